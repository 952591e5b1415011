//! Chunk read side
//!
//! Positions passed here are chunk-local logical positions. An unscavenged
//! chunk stores each record at its own logical position. A scavenged chunk
//! stores the survivors back to back and translates through its position
//! map, narrowed by a sparse midpoint index when the chunk is not cached.

use std::io::{Read, Seek, SeekFrom};

use super::file::{Chunk, WorkItem};
use super::footer::{PosMap, POS_MAP_SIZE};
use super::header::HEADER_SIZE;
use crate::error::{Error, Result};
use crate::record::{LogRecord, FRAME_OVERHEAD};

/// A record read from a chunk
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRead {
    pub record: LogRecord,
    /// Chunk-local position to continue reading from. After a backward read
    /// this is the position of the record itself.
    pub next_position: i64,
    /// Body length, excluding the framing
    pub length: i32,
}

/// Sampled position map entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Midpoint {
    pub item_index: usize,
    pub log_pos: i64,
}

/// Sample `2^depth` entries of a position map, first and last included
pub(crate) fn build_midpoints(
    count: usize,
    depth: u32,
    mut read_entry: impl FnMut(usize) -> Result<PosMap>,
) -> Result<Vec<Midpoint>> {
    if count == 0 {
        return Ok(Vec::new());
    }
    if count == 1 {
        let entry = read_entry(0)?;
        return Ok(vec![Midpoint {
            item_index: 0,
            log_pos: entry.log_pos,
        }]);
    }

    let samples = (1usize << depth.min(30)).min(count).max(2);
    let mut midpoints = Vec::with_capacity(samples);
    for i in 0..samples {
        let item_index = ((count - 1) as u64 * i as u64 / (samples - 1) as u64) as usize;
        let entry = read_entry(item_index)?;
        midpoints.push(Midpoint {
            item_index,
            log_pos: entry.log_pos,
        });
    }
    Ok(midpoints)
}

fn check_position(local: i64) -> Result<()> {
    if local < 0 {
        return Err(Error::InvalidArgument(format!(
            "chunk position must be non-negative, got {}",
            local
        )));
    }
    Ok(())
}

impl Chunk {
    /// Read the record stored at exactly this position
    pub fn try_read_at(&self, local: i64) -> Result<Option<LogRecord>> {
        check_position(local)?;
        let mut item = self.acquire_work_item()?;

        if self.header.is_scavenged() {
            return match self.translate_exact(&mut item, local)? {
                Some(actual) => Ok(Some(self.read_record(&mut item, actual)?.0)),
                None => Ok(None),
            };
        }

        if local >= self.physical_data_size() {
            return Ok(None);
        }
        let (record, _) = self.read_record(&mut item, local)?;
        if self.header.local_position(record.log_position()) != local {
            return Err(Error::corrupt(
                &self.path,
                format!(
                    "record at local position {} claims log position {}",
                    local,
                    record.log_position()
                ),
            ));
        }
        Ok(Some(record))
    }

    /// Whether a record starts at exactly this position
    pub fn exists_at(&self, local: i64) -> Result<bool> {
        check_position(local)?;
        if !self.header.is_scavenged() {
            return Ok(local < self.logical_data_size());
        }
        let mut item = self.acquire_work_item()?;
        Ok(self.translate_exact(&mut item, local)?.is_some())
    }

    pub fn try_read_first(&self) -> Result<Option<ChunkRead>> {
        self.try_read_closest_forward(0)
    }

    /// First record at or after `local`
    pub fn try_read_closest_forward(&self, local: i64) -> Result<Option<ChunkRead>> {
        check_position(local)?;
        let mut item = self.acquire_work_item()?;

        if self.header.is_scavenged() {
            let Some((entry, index)) = self.translate_closest_forward(&mut item, local)? else {
                return Ok(None);
            };
            let (record, length) = self.read_record(&mut item, entry.actual_pos as i64)?;
            let next_position = if index + 1 < self.map_count() {
                self.read_pos_map(&mut item, index + 1)?.log_pos
            } else {
                entry.log_pos + length as i64 + FRAME_OVERHEAD as i64
            };
            return Ok(Some(ChunkRead {
                record,
                next_position,
                length,
            }));
        }

        if local >= self.physical_data_size() {
            return Ok(None);
        }
        let (record, length) = self.read_record(&mut item, local)?;
        Ok(Some(ChunkRead {
            record,
            next_position: local + length as i64 + FRAME_OVERHEAD as i64,
            length,
        }))
    }

    pub fn try_read_last(&self) -> Result<Option<ChunkRead>> {
        if self.header.is_scavenged() {
            let count = self.map_count();
            if count == 0 {
                return Ok(None);
            }
            let mut item = self.acquire_work_item()?;
            return self.read_backward_at_index(&mut item, count - 1).map(Some);
        }
        self.try_read_closest_backward(self.physical_data_size())
    }

    /// Last record that starts before `local`
    pub fn try_read_closest_backward(&self, local: i64) -> Result<Option<ChunkRead>> {
        check_position(local)?;
        if local == 0 {
            return Ok(None);
        }
        let mut item = self.acquire_work_item()?;

        if self.header.is_scavenged() {
            let count = self.map_count();
            if count == 0 {
                return Ok(None);
            }
            let index = match self.translate_closest_forward(&mut item, local)? {
                Some((_, 0)) => return Ok(None),
                Some((_, index)) => index - 1,
                None => count - 1,
            };
            return self.read_backward_at_index(&mut item, index).map(Some);
        }

        if local > self.physical_data_size() {
            return Ok(None);
        }

        let suffix = self.read_i32_at(&mut item, local - 4)? as i64;
        let start = local - suffix - FRAME_OVERHEAD as i64;
        if suffix <= 0 || start < 0 {
            return Err(Error::corrupt(
                &self.path,
                format!("invalid length suffix {} before position {}", suffix, local),
            ));
        }
        let (record, length) = self.read_record(&mut item, start)?;
        Ok(Some(ChunkRead {
            record,
            next_position: start,
            length,
        }))
    }

    fn read_backward_at_index(&self, item: &mut WorkItem<'_>, index: usize) -> Result<ChunkRead> {
        let entry = self.read_pos_map(item, index)?;
        let (record, length) = self.read_record(item, entry.actual_pos as i64)?;
        Ok(ChunkRead {
            record,
            next_position: entry.log_pos,
            length,
        })
    }

    /// Rebuild the midpoint index of a scavenged chunk from its position map
    pub(crate) fn rebuild_midpoints(&self) -> Result<()> {
        if !self.header.is_scavenged() || !self.is_read_only() {
            return Ok(());
        }

        let count = self.map_count();
        let mut item = self.acquire_work_item()?;
        let midpoints = build_midpoints(count, self.options.midpoints_depth, |i| {
            self.read_pos_map(&mut item, i)
        })?;
        drop(item);

        *self.midpoints.write() = Some(midpoints.into());
        Ok(())
    }

    /// Physical offset of the record at exactly `local`
    fn translate_exact(&self, item: &mut WorkItem<'_>, local: i64) -> Result<Option<i64>> {
        Ok(self
            .translate_closest_forward(item, local)?
            .filter(|(entry, _)| entry.log_pos == local)
            .map(|(entry, _)| entry.actual_pos as i64))
    }

    /// First map entry with a logical position at or after `local`
    fn translate_closest_forward(
        &self,
        item: &mut WorkItem<'_>,
        local: i64,
    ) -> Result<Option<(PosMap, usize)>> {
        let count = self.map_count();
        if count == 0 {
            return Ok(None);
        }

        let (low, high) = self.search_bounds(local, count);
        let (mut lo, mut hi) = (low, high + 1);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if self.read_pos_map(item, mid)?.log_pos < local {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        if lo > high {
            return Ok(None);
        }
        Ok(Some((self.read_pos_map(item, lo)?, lo)))
    }

    /// Inclusive index range that must contain the answer of a forward search
    fn search_bounds(&self, local: i64, count: usize) -> (usize, usize) {
        let midpoints = self.midpoints.read().clone();
        match midpoints {
            Some(mp) if mp.len() >= 2 => {
                let at_or_before = mp.partition_point(|m| m.log_pos <= local);
                let low = if at_or_before == 0 {
                    0
                } else {
                    mp[at_or_before - 1].item_index
                };
                let first_at_or_after = mp.partition_point(|m| m.log_pos < local);
                let high = mp
                    .get(first_at_or_after)
                    .map_or(count - 1, |m| m.item_index);
                (low, high.max(low))
            }
            _ => (0, count - 1),
        }
    }

    fn read_pos_map(&self, item: &mut WorkItem<'_>, index: usize) -> Result<PosMap> {
        let offset = HEADER_SIZE as u64
            + self.physical_data_size() as u64
            + (index * POS_MAP_SIZE) as u64;
        let mut bytes = [0u8; POS_MAP_SIZE];
        let stream = item.stream();
        stream.seek(SeekFrom::Start(offset))?;
        stream.read_exact(&mut bytes)?;
        Ok(PosMap::from_bytes(&bytes))
    }

    fn read_i32_at(&self, item: &mut WorkItem<'_>, actual: i64) -> Result<i32> {
        let mut bytes = [0u8; 4];
        let stream = item.stream();
        stream.seek(SeekFrom::Start(HEADER_SIZE as u64 + actual as u64))?;
        stream.read_exact(&mut bytes)?;
        Ok(i32::from_le_bytes(bytes))
    }

    /// Read and validate the framed record at a data-region offset
    fn read_record(&self, item: &mut WorkItem<'_>, actual: i64) -> Result<(LogRecord, i32)> {
        let limit = self.physical_data_size();
        let length = self.read_i32_at(item, actual)?;
        if length <= 0 || actual + length as i64 + FRAME_OVERHEAD as i64 > limit {
            return Err(Error::corrupt(
                &self.path,
                format!("invalid record length {} at offset {}", length, actual),
            ));
        }

        let mut body = vec![0u8; length as usize];
        let stream = item.stream();
        stream.read_exact(&mut body)?;
        let mut suffix = [0u8; 4];
        stream.read_exact(&mut suffix)?;
        if i32::from_le_bytes(suffix) != length {
            return Err(Error::corrupt(
                &self.path,
                format!("length prefix and suffix disagree at offset {}", actual),
            ));
        }

        let record =
            LogRecord::decode(&body).map_err(|e| Error::corrupt(&self.path, e.to_string()))?;
        Ok((record, length))
    }
}
