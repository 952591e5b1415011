//! Transaction Log Access
//!
//! The writer appends, the chaser follows it, and readers walk the log in
//! either direction.

mod chaser;
mod reader;
mod writer;

pub use chaser::ChunkChaser;
pub use reader::{ChunkReader, SeqRead};
pub use writer::{ChunkWriter, WriteResult};
