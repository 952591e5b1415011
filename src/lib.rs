//! ChunkLog - Chunked Transaction Log Storage Engine
//!
//! The storage layer of an event-sourced database: an append-only
//! transaction log split into fixed-size chunk files, with durable
//! checkpoints, forward and backward readers, and a scavenger that compacts
//! completed chunks in place.
//!
//! # Architecture
//!
//! A single writer appends framed records to the last chunk. When it fills
//! up the chunk is completed (footer and checksum written) and becomes
//! read-only. Readers translate logical log positions to chunk offsets; a
//! scavenged chunk carries a position map for that translation. The chunk
//! manager swaps scavenged chunks in atomically and deletes the replaced
//! files once their last reader is gone.
//!
//! # Features
//!
//! - Byte-exact chunk format with SHA-256 checksums
//! - Midpoint index for position lookups in scavenged chunks
//! - In-memory caching of the most recent completed chunks
//! - Deferred file deletion while readers are active
//! - Scavenging with retention rules and chunk merging
//! - Truncation and crash recovery driven by checkpoints

pub mod checkpoint;
pub mod chunk;
pub mod config;
pub mod db;
pub mod error;
pub mod record;
pub mod scavenge;
pub mod txlog;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::ChunkLogConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::checkpoint::{Checkpoint, CheckpointSet};
    pub use crate::chunk::Chunk;
    pub use crate::config::{ChunkLogConfig, DbConfig};
    pub use crate::db::{ChunkDb, ChunkManager};
    pub use crate::error::{Error, Result};
    pub use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};
    pub use crate::scavenge::{ScavengeOptions, ScavengeService, Scavenger};
    pub use crate::txlog::{ChunkChaser, ChunkReader, ChunkWriter};
}
