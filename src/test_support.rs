//! Shared helpers for unit tests

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::chunk::ChunkOptions;
use crate::config::DbConfig;
use crate::db::ChunkDb;
use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};
use crate::scavenge::{
    Crc32StreamHasher, LastEventNumber, ScavengeLog, ScavengeReport, ScavengeResult,
    StreamHasher, StreamIndex, StreamMetadata, StreamMetadataLookup,
};

pub(crate) const TEST_CHUNK_SIZE: i32 = 4096;

pub(crate) fn chunk_options() -> ChunkOptions {
    ChunkOptions::default()
}

/// Small chunks, no caching and a short wait for chunk deletion
pub(crate) fn test_config(path: &Path) -> DbConfig {
    let mut config = DbConfig::new(path, TEST_CHUNK_SIZE);
    config.cached_chunks = 0;
    config.file_deletion_wait = Duration::from_secs(2);
    config
}

pub(crate) fn open_db(path: &Path) -> ChunkDb {
    ChunkDb::open(test_config(path)).unwrap()
}

/// First event of a stream, committed inline
pub(crate) fn prepare(log_position: i64, stream: &str, data_len: usize) -> LogRecord {
    event(log_position, stream, -1, data_len)
}

/// Event committed inline with the given expected version
pub(crate) fn event(
    log_position: i64,
    stream: &str,
    expected_version: i64,
    data_len: usize,
) -> LogRecord {
    PrepareLogRecord::single_write(
        log_position,
        stream,
        expected_version,
        "test-event",
        vec![0xAB; data_len],
        Vec::new(),
    )
    .unwrap()
    .into()
}

/// Prepare of an explicit transaction
pub(crate) fn tx_prepare(
    log_position: i64,
    transaction_position: i64,
    transaction_offset: i32,
    stream: &str,
    flags: PrepareFlags,
) -> LogRecord {
    PrepareLogRecord::new(
        log_position,
        Uuid::new_v4(),
        Uuid::new_v4(),
        transaction_position,
        transaction_offset,
        stream,
        -2,
        Utc::now(),
        flags,
        "test-event",
        vec![0xCD; 64],
        Vec::new(),
    )
    .unwrap()
    .into()
}

pub(crate) fn commit(
    log_position: i64,
    transaction_position: i64,
    first_event_number: i64,
) -> LogRecord {
    CommitLogRecord::new(
        log_position,
        Uuid::new_v4(),
        transaction_position,
        Utc::now(),
        first_event_number,
    )
    .unwrap()
    .into()
}

/// Stream state kept in maps
#[derive(Default)]
pub(crate) struct MemoryMetadata {
    last: Mutex<HashMap<String, LastEventNumber>>,
    metadata: Mutex<HashMap<String, StreamMetadata>>,
    positions: Mutex<HashMap<u64, (i64, i64)>>,
    events: Mutex<HashMap<(String, i64), i64>>,
}

impl MemoryMetadata {
    pub(crate) fn set_last(&self, stream: &str, last: LastEventNumber) {
        self.last.lock().insert(stream.to_string(), last);
    }

    pub(crate) fn set_metadata(&self, stream: &str, metadata: StreamMetadata) {
        self.metadata.lock().insert(stream.to_string(), metadata);
    }

    pub(crate) fn set_positions(&self, stream: &str, oldest: i64, latest: i64) {
        self.positions
            .lock()
            .insert(Crc32StreamHasher.hash(stream), (oldest, latest));
    }

    pub(crate) fn set_event_position(&self, stream: &str, event_number: i64, position: i64) {
        self.events
            .lock()
            .insert((stream.to_string(), event_number), position);
    }
}

impl StreamMetadataLookup for MemoryMetadata {
    fn last_event_number(&self, stream_id: &str) -> LastEventNumber {
        self.last
            .lock()
            .get(stream_id)
            .copied()
            .unwrap_or(LastEventNumber::NoStream)
    }

    fn metadata(&self, stream_id: &str) -> StreamMetadata {
        self.metadata
            .lock()
            .get(stream_id)
            .cloned()
            .unwrap_or_default()
    }
}

impl StreamIndex for MemoryMetadata {
    fn oldest_position(&self, stream_hash: u64) -> Option<i64> {
        self.positions.lock().get(&stream_hash).map(|p| p.0)
    }

    fn latest_position(&self, stream_hash: u64) -> Option<i64> {
        self.positions.lock().get(&stream_hash).map(|p| p.1)
    }

    fn event_position(&self, stream_id: &str, event_number: i64) -> Option<i64> {
        self.events
            .lock()
            .get(&(stream_id.to_string(), event_number))
            .copied()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum ScavengeEvent {
    Started(Uuid),
    Scavenged { start: i32, end: i32, space_saved: i64 },
    NotScavenged { start: i32, end: i32, reason: String },
    Merged { start: i32, end: i32, space_saved: i64 },
    NotMerged { start: i32, end: i32, reason: String },
    Completed(ScavengeResult),
}

/// Keeps every scavenge event in order
#[derive(Default)]
pub(crate) struct RecordingScavengeLog {
    events: Mutex<Vec<ScavengeEvent>>,
}

impl RecordingScavengeLog {
    pub(crate) fn events(&self) -> Vec<ScavengeEvent> {
        self.events.lock().clone()
    }

    fn push(&self, event: ScavengeEvent) {
        self.events.lock().push(event);
    }
}

impl ScavengeLog for RecordingScavengeLog {
    fn scavenge_started(&self, scavenge_id: Uuid) {
        self.push(ScavengeEvent::Started(scavenge_id));
    }

    fn chunks_scavenged(&self, start: i32, end: i32, _: Duration, space_saved: i64) {
        self.push(ScavengeEvent::Scavenged {
            start,
            end,
            space_saved,
        });
    }

    fn chunks_not_scavenged(&self, start: i32, end: i32, _: Duration, reason: &str) {
        self.push(ScavengeEvent::NotScavenged {
            start,
            end,
            reason: reason.to_string(),
        });
    }

    fn chunks_merged(&self, start: i32, end: i32, _: Duration, space_saved: i64) {
        self.push(ScavengeEvent::Merged {
            start,
            end,
            space_saved,
        });
    }

    fn chunks_not_merged(&self, start: i32, end: i32, _: Duration, reason: &str) {
        self.push(ScavengeEvent::NotMerged {
            start,
            end,
            reason: reason.to_string(),
        });
    }

    fn scavenge_completed(&self, report: &ScavengeReport) {
        self.push(ScavengeEvent::Completed(report.result));
    }
}
