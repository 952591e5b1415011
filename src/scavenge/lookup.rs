//! Log Scan Metadata
//!
//! Derives last event numbers and stream positions by reading the whole log.
//! An event written more than once resolves to its first write.
//! Retention metadata is not stored in the log, so every stream gets the
//! metadata registered with `with_metadata`, or none at all; only hard
//! deletes and explicit retention settings make records obsolete.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    Crc32StreamHasher, LastEventNumber, StreamHasher, StreamIndex, StreamMetadata,
    StreamMetadataLookup,
};
use crate::db::ChunkDb;
use crate::error::Result;
use crate::record::{LogRecord, PrepareFlags};
use crate::txlog::ChunkReader;

/// Prepare of a transaction that has not been committed yet
struct PendingEvent {
    stream: String,
    offset: i32,
    position: i64,
    is_delete: bool,
}

#[derive(Default)]
pub struct LogScanMetadata {
    last_event_numbers: HashMap<String, LastEventNumber>,
    positions: HashMap<u64, (i64, i64)>,
    event_positions: HashMap<(String, i64), i64>,
    metadata: HashMap<String, StreamMetadata>,
}

impl LogScanMetadata {
    /// Scan the log up to the writer checkpoint
    pub fn scan(db: &ChunkDb) -> Result<Self> {
        Self::scan_with_hasher(db, &Crc32StreamHasher)
    }

    pub fn scan_with_hasher(db: &ChunkDb, hasher: &dyn StreamHasher) -> Result<Self> {
        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )?;

        let mut lookup = Self::default();
        let mut pending: HashMap<i64, Vec<PendingEvent>> = HashMap::new();
        let mut records = 0u64;

        while let Some(read) = reader.try_read_next()? {
            records += 1;
            match read.record {
                LogRecord::Prepare(prepare) => {
                    let hash = hasher.hash(&prepare.event_stream_id);
                    lookup
                        .positions
                        .entry(hash)
                        .and_modify(|(_, latest)| *latest = read.record_position)
                        .or_insert((read.record_position, read.record_position));

                    let is_delete = prepare.flags.contains(PrepareFlags::STREAM_DELETE);
                    if prepare.is_committed_inline() {
                        lookup.apply_event(
                            &prepare.event_stream_id,
                            prepare.expected_version + 1,
                            read.record_position,
                            is_delete,
                        );
                    } else {
                        pending
                            .entry(prepare.transaction_position)
                            .or_default()
                            .push(PendingEvent {
                                stream: prepare.event_stream_id,
                                offset: prepare.transaction_offset,
                                position: read.record_position,
                                is_delete,
                            });
                    }
                }
                LogRecord::Commit(commit) => {
                    for event in pending
                        .remove(&commit.transaction_position)
                        .unwrap_or_default()
                    {
                        lookup.apply_event(
                            &event.stream,
                            commit.first_event_number + event.offset as i64,
                            event.position,
                            event.is_delete,
                        );
                    }
                }
                LogRecord::System(_) => {}
            }
        }

        tracing::debug!(
            "Scanned {} records, {} streams",
            records,
            lookup.last_event_numbers.len()
        );
        Ok(lookup)
    }

    /// Retention settings to apply to a stream
    pub fn with_metadata(mut self, stream_id: impl Into<String>, metadata: StreamMetadata) -> Self {
        self.metadata.insert(stream_id.into(), metadata);
        self
    }

    pub fn stream_count(&self) -> usize {
        self.last_event_numbers.len()
    }

    fn apply_event(&mut self, stream: &str, event_number: i64, position: i64, is_delete: bool) {
        self.event_positions
            .entry((stream.to_string(), event_number))
            .or_insert(position);

        let entry = self
            .last_event_numbers
            .entry(stream.to_string())
            .or_insert(LastEventNumber::NoStream);
        *entry = match *entry {
            _ if is_delete => LastEventNumber::Deleted,
            LastEventNumber::Deleted => LastEventNumber::Deleted,
            LastEventNumber::Last(last) => LastEventNumber::Last(last.max(event_number)),
            LastEventNumber::NoStream => LastEventNumber::Last(event_number),
        };
    }
}

impl StreamMetadataLookup for LogScanMetadata {
    fn last_event_number(&self, stream_id: &str) -> LastEventNumber {
        self.last_event_numbers
            .get(stream_id)
            .copied()
            .unwrap_or(LastEventNumber::NoStream)
    }

    fn metadata(&self, stream_id: &str) -> StreamMetadata {
        self.metadata.get(stream_id).cloned().unwrap_or_default()
    }
}

impl StreamIndex for LogScanMetadata {
    fn oldest_position(&self, stream_hash: u64) -> Option<i64> {
        self.positions.get(&stream_hash).map(|(oldest, _)| *oldest)
    }

    fn latest_position(&self, stream_hash: u64) -> Option<i64> {
        self.positions.get(&stream_hash).map(|(_, latest)| *latest)
    }

    fn event_position(&self, stream_id: &str, event_number: i64) -> Option<i64> {
        self.event_positions
            .get(&(stream_id.to_string(), event_number))
            .copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::PrepareLogRecord;
    use crate::test_support::{commit, event, open_db, tx_prepare};
    use crate::txlog::ChunkWriter;
    use tempfile::tempdir;

    #[test]
    fn test_scan_tracks_streams() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();

        let first = writer.position();
        writer.write(&mut event(first, "a", -1, 10)).unwrap();
        let second = writer.position();
        writer.write(&mut event(second, "a", 0, 10)).unwrap();
        let pos = writer.position();
        writer.write(&mut event(pos, "gone", -1, 10)).unwrap();
        let pos = writer.position();
        let mut tombstone: LogRecord = PrepareLogRecord::delete_tombstone(pos, "gone", 0)
            .unwrap()
            .into();
        writer.write(&mut tombstone).unwrap();

        let begin = writer.position();
        writer
            .write(&mut tx_prepare(begin, begin, 0, "tx", PrepareFlags::DATA))
            .unwrap();
        let pos = writer.position();
        writer
            .write(&mut tx_prepare(pos, begin, 1, "tx", PrepareFlags::DATA))
            .unwrap();
        let pos = writer.position();
        writer.write(&mut commit(pos, begin, 5)).unwrap();

        let lookup = LogScanMetadata::scan(&db).unwrap();
        assert_eq!(lookup.stream_count(), 3);
        assert_eq!(lookup.last_event_number("a"), LastEventNumber::Last(1));
        assert_eq!(lookup.last_event_number("gone"), LastEventNumber::Deleted);
        assert_eq!(lookup.last_event_number("tx"), LastEventNumber::Last(6));
        assert_eq!(lookup.last_event_number("other"), LastEventNumber::NoStream);

        let hash = Crc32StreamHasher.hash("a");
        assert_eq!(lookup.oldest_position(hash), Some(first));
        assert_eq!(lookup.latest_position(hash), Some(second));
        assert_eq!(lookup.metadata("a"), StreamMetadata::default());
        assert_eq!(lookup.event_position("a", 1), Some(second));
        let tx_hash = Crc32StreamHasher.hash("tx");
        assert_eq!(lookup.event_position("tx", 6), lookup.latest_position(tx_hash));
        assert_eq!(lookup.event_position("a", 2), None);
    }

    #[test]
    fn test_rewritten_event_resolves_to_first_write() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();

        let first = writer.position();
        writer.write(&mut event(first, "a", -1, 10)).unwrap();
        let again = writer.position();
        writer.write(&mut event(again, "a", -1, 10)).unwrap();

        let lookup = LogScanMetadata::scan(&db).unwrap();
        assert_eq!(lookup.event_position("a", 0), Some(first));
        assert_eq!(lookup.last_event_number("a"), LastEventNumber::Last(0));
    }

    #[test]
    fn test_uncommitted_transaction_ignored() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        writer
            .write(&mut tx_prepare(0, 0, 0, "open", PrepareFlags::DATA))
            .unwrap();

        let lookup = LogScanMetadata::scan(&db)
            .unwrap()
            .with_metadata("open", StreamMetadata {
                max_count: Some(1),
                ..Default::default()
            });
        assert_eq!(lookup.last_event_number("open"), LastEventNumber::NoStream);
        assert_eq!(lookup.metadata("open").max_count, Some(1));
    }
}
