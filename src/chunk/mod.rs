//! Chunk Module
//!
//! Fixed-size chunk files holding a contiguous range of the transaction log.
//! A chunk file is a 128-byte header, a data region of length-framed records,
//! an optional position map (scavenged chunks only) and a 128-byte footer
//! carrying a SHA-256 checksum of everything before it.

mod bulk;
mod file;
mod footer;
mod header;
mod lifecycle;
pub mod naming;
mod read_side;
mod work_item;

pub use bulk::{BulkReadResult, BulkReader};
pub use file::{AppendResult, Chunk};
pub use footer::{ChunkFooter, PosMap, CHECKSUM_SIZE, FOOTER_SIZE, POS_MAP_SIZE};
pub use header::{ChunkHeader, TransformType, CHUNK_FORMAT_VERSION, HEADER_SIZE};
pub use naming::{FileNamingStrategy, VersionedPatternNamingStrategy};
pub use read_side::ChunkRead;

pub(crate) use file::scan_data_end;

/// Per-chunk tuning shared by every chunk of a database
#[derive(Debug, Clone, Copy)]
pub struct ChunkOptions {
    /// File handles opened when a completed chunk is opened
    pub initial_reader_count: usize,
    /// Upper bound on pooled file handles per chunk
    pub max_reader_count: usize,
    /// log2 of the number of sampled position map entries
    pub midpoints_depth: u32,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            initial_reader_count: 5,
            max_reader_count: 25,
            midpoints_depth: 14,
        }
    }
}
