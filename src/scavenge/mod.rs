//! Scavenging
//!
//! Rewrites completed chunks without the records that are provably obsolete,
//! then merges small neighbouring chunks. The stream index and metadata live
//! outside the storage engine; the scavenger consults them through
//! `StreamMetadataLookup`, `StreamIndex` and `StreamHasher`.

mod log;
mod lookup;
mod scavenger;
mod service;

pub use log::{ScavengeLog, TracingScavengeLog};
pub use lookup::LogScanMetadata;
pub use scavenger::Scavenger;
pub use service::ScavengeService;

use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

/// Scavenger tuning
#[derive(Debug, Clone)]
pub struct ScavengeOptions {
    /// Swap in scavenged chunks even when they are not smaller
    pub always_keep_scavenged: bool,
    /// Merge adjacent chunks after scavenging
    pub merge_chunks: bool,
    /// Physical data budget of a merged chunk
    pub max_chunk_data_size: i64,
}

impl Default for ScavengeOptions {
    fn default() -> Self {
        Self {
            always_keep_scavenged: false,
            merge_chunks: true,
            max_chunk_data_size: 256 * 1024 * 1024,
        }
    }
}

/// Last event number of a stream as known by the index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LastEventNumber {
    /// The stream has no events yet
    NoStream,
    /// The stream was hard-deleted
    Deleted,
    Last(i64),
}

/// Retention settings of a stream
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamMetadata {
    pub max_count: Option<i64>,
    pub max_age: Option<Duration>,
    pub truncate_before: Option<i64>,
    pub temp_stream: bool,
}

impl StreamMetadata {
    /// A soft delete truncates the stream before every possible event
    pub fn is_soft_deleted(&self) -> bool {
        self.truncate_before == Some(i64::MAX)
    }
}

/// Stream state lookups
pub trait StreamMetadataLookup: Send + Sync {
    fn last_event_number(&self, stream_id: &str) -> LastEventNumber;

    fn metadata(&self, stream_id: &str) -> StreamMetadata;
}

/// Positions of a stream's first and last events, by stream hash
pub trait StreamIndex: Send + Sync {
    fn oldest_position(&self, stream_hash: u64) -> Option<i64>;

    fn latest_position(&self, stream_hash: u64) -> Option<i64>;

    /// Log position an index read of one event resolves to. Indexes that
    /// cannot answer return `None`, which keeps duplicates in place.
    fn event_position(&self, _stream_id: &str, _event_number: i64) -> Option<i64> {
        None
    }
}

/// Prefix marking the metadata stream of a stream
pub const META_STREAM_PREFIX: &str = "$$";

/// Metadata stream holding the settings of `stream_id`
pub fn meta_stream_of(stream_id: &str) -> String {
    format!("{}{}", META_STREAM_PREFIX, stream_id)
}

/// Stream described by a metadata stream, `None` for ordinary streams
pub fn original_stream_of(stream_id: &str) -> Option<&str> {
    stream_id.strip_prefix(META_STREAM_PREFIX)
}

/// Hashes stream ids the same way the stream index does
pub trait StreamHasher: Send + Sync {
    fn hash(&self, stream_id: &str) -> u64;
}

/// CRC32 of the UTF-8 stream id
#[derive(Debug, Clone, Copy, Default)]
pub struct Crc32StreamHasher;

impl StreamHasher for Crc32StreamHasher {
    fn hash(&self, stream_id: &str) -> u64 {
        crc32fast::hash(stream_id.as_bytes()) as u64
    }
}

/// How a scavenge ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ScavengeResult {
    Success,
    Stopped,
    Errored,
}

/// Summary of one scavenge
#[derive(Debug, Clone, Serialize)]
pub struct ScavengeReport {
    pub scavenge_id: Uuid,
    pub result: ScavengeResult,
    /// First error that aborted a chunk range or the whole scavenge
    pub error: Option<String>,
    /// Bytes reclaimed across every swapped-in chunk
    pub space_saved: i64,
    pub chunks_scavenged: usize,
    pub chunks_merged: usize,
    pub elapsed: Duration,
}
