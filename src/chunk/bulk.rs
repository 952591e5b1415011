//! Bulk reader
//!
//! Raw sequential access to a chunk's bytes for copying whole chunks. Holds
//! a reader lock on the chunk until released or dropped, so a chunk marked
//! for deletion keeps its file while a bulk reader is open.

use std::fs::File;
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use super::file::Chunk;
use super::header::HEADER_SIZE;
use super::work_item::ReaderStream;
use crate::error::Result;

/// Result of a bulk read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkReadResult {
    /// Raw or data-region position before the read
    pub old_position: i64,
    pub bytes_read: usize,
    /// True once the end of the readable range was reached
    pub is_eof: bool,
}

pub struct BulkReader {
    chunk: Arc<Chunk>,
    stream: ReaderStream,
    released: bool,
}

impl Chunk {
    /// Take a dedicated reader over the chunk's bytes
    pub fn acquire_reader(self: &Arc<Self>) -> Result<BulkReader> {
        self.try_lock()?;

        let stream = match self.pool.cached_buffer() {
            Some(buffer) => ReaderStream::Memory(Cursor::new(buffer)),
            None => match File::open(&self.path) {
                Ok(file) => ReaderStream::File(file),
                Err(e) => {
                    self.release_lock();
                    return Err(e.into());
                }
            },
        };

        Ok(BulkReader {
            chunk: Arc::clone(self),
            stream,
            released: false,
        })
    }
}

impl BulkReader {
    pub fn chunk(&self) -> &Arc<Chunk> {
        &self.chunk
    }

    pub fn is_memory(&self) -> bool {
        self.stream.is_memory()
    }

    /// Position within the whole file
    pub fn set_raw_position(&mut self, position: u64) -> Result<()> {
        self.stream.seek(SeekFrom::Start(position))?;
        Ok(())
    }

    /// Position within the data region
    pub fn set_data_position(&mut self, position: u64) -> Result<()> {
        self.stream
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + position))?;
        Ok(())
    }

    /// Read file bytes, header and footer included
    pub fn read_next_raw_bytes(&mut self, buf: &mut [u8]) -> Result<BulkReadResult> {
        let old_position = self.stream.stream_position()?;
        let limit = self.chunk.file_size();
        let (bytes_read, is_eof) = self.read_bounded(buf, old_position, limit)?;
        Ok(BulkReadResult {
            old_position: old_position as i64,
            bytes_read,
            is_eof,
        })
    }

    /// Read record bytes only, stopping at the end of the physical data
    pub fn read_next_data_bytes(&mut self, buf: &mut [u8]) -> Result<BulkReadResult> {
        let raw = self.stream.stream_position()?.max(HEADER_SIZE as u64);
        self.stream.seek(SeekFrom::Start(raw))?;
        let limit = HEADER_SIZE as u64 + self.chunk.physical_data_size() as u64;
        let (bytes_read, is_eof) = self.read_bounded(buf, raw, limit)?;
        Ok(BulkReadResult {
            old_position: (raw - HEADER_SIZE as u64) as i64,
            bytes_read,
            is_eof,
        })
    }

    /// Read up to `limit`, reporting whether nothing is left to read. A cached
    /// copy ends before the footer, so running dry also counts as the end.
    fn read_bounded(&mut self, buf: &mut [u8], position: u64, limit: u64) -> Result<(usize, bool)> {
        let available = limit.saturating_sub(position).min(buf.len() as u64) as usize;
        let mut total = 0;
        while total < available {
            let n = self.stream.read(&mut buf[total..available])?;
            if n == 0 {
                return Ok((total, true));
            }
            total += n;
        }
        Ok((total, position + total as u64 >= limit))
    }

    /// Give the chunk lock back
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            self.chunk.release_lock();
        }
    }
}

impl Drop for BulkReader {
    fn drop(&mut self) {
        self.release_inner();
    }
}
