//! Checkpoints
//!
//! Durable 64-bit position markers. A written value is visible to readers in
//! the same process immediately; surviving a crash requires `flush`.

mod file;
mod memory;

pub use file::FileCheckpoint;
pub use memory::InMemoryCheckpoint;

use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Checkpoint file names
pub const WRITER_CHECKPOINT: &str = "writer";
pub const CHASER_CHECKPOINT: &str = "chaser";
pub const EPOCH_CHECKPOINT: &str = "epoch";
pub const TRUNCATE_CHECKPOINT: &str = "truncate";
pub const REPLICATION_CHECKPOINT: &str = "replication";

/// When checkpoint writes reach stable storage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointMode {
    /// Every write is flushed immediately
    Durable,
    /// Writes are buffered until `flush` is called
    #[default]
    Batched,
}

/// A named, monotonic position marker
pub trait Checkpoint: Send + Sync {
    /// Checkpoint name
    fn name(&self) -> &str;

    /// Last written value, flushed or not
    fn read(&self) -> i64;

    /// Last value known to be on stable storage
    fn read_flushed(&self) -> i64;

    /// Move the checkpoint forward. Moving backwards is rejected.
    fn write(&self, value: i64) -> Result<()>;

    /// Set the checkpoint to any value and flush it. Reserved for recovery
    /// and truncation.
    fn reset(&self, value: i64) -> Result<()>;

    /// Persist the last written value
    fn flush(&self) -> Result<()>;

    /// Flush and release any underlying resources
    fn close(&self) -> Result<()> {
        self.flush()
    }
}

pub(crate) fn ensure_forward(name: &str, current: i64, value: i64) -> Result<()> {
    if value < current {
        return Err(Error::InvalidOperation(format!(
            "checkpoint {} cannot move backwards from {} to {}",
            name, current, value
        )));
    }
    Ok(())
}

/// The checkpoints owned by one database
#[derive(Clone)]
pub struct CheckpointSet {
    /// End of the valid log
    pub writer: Arc<dyn Checkpoint>,
    /// End of the log known to be replicated and processed
    pub chaser: Arc<dyn Checkpoint>,
    pub epoch: Arc<dyn Checkpoint>,
    /// Pending truncation position, -1 when none
    pub truncate: Arc<dyn Checkpoint>,
    pub replication: Arc<dyn Checkpoint>,
}

impl CheckpointSet {
    /// Open (or create) the checkpoint files in a directory
    pub fn open(dir: &Path, mode: CheckpointMode) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let open = |name: &str, initial: i64| -> Result<Arc<dyn Checkpoint>> {
            let path = dir.join(format!("{}.chk", name));
            Ok(Arc::new(FileCheckpoint::open(path, name, initial, mode)?))
        };

        Ok(Self {
            writer: open(WRITER_CHECKPOINT, 0)?,
            chaser: open(CHASER_CHECKPOINT, 0)?,
            epoch: open(EPOCH_CHECKPOINT, -1)?,
            truncate: open(TRUNCATE_CHECKPOINT, -1)?,
            replication: open(REPLICATION_CHECKPOINT, -1)?,
        })
    }

    /// Ephemeral checkpoints
    pub fn in_memory() -> Self {
        Self {
            writer: Arc::new(InMemoryCheckpoint::new(WRITER_CHECKPOINT, 0)),
            chaser: Arc::new(InMemoryCheckpoint::new(CHASER_CHECKPOINT, 0)),
            epoch: Arc::new(InMemoryCheckpoint::new(EPOCH_CHECKPOINT, -1)),
            truncate: Arc::new(InMemoryCheckpoint::new(TRUNCATE_CHECKPOINT, -1)),
            replication: Arc::new(InMemoryCheckpoint::new(REPLICATION_CHECKPOINT, -1)),
        }
    }

    /// Checkpoints that must never be ahead of the writer
    pub fn readers(&self) -> [&Arc<dyn Checkpoint>; 4] {
        [&self.chaser, &self.epoch, &self.truncate, &self.replication]
    }

    pub fn flush_all(&self) -> Result<()> {
        self.writer.flush()?;
        for checkpoint in self.readers() {
            checkpoint.flush()?;
        }
        Ok(())
    }

    pub fn close_all(&self) -> Result<()> {
        self.writer.close()?;
        for checkpoint in self.readers() {
            checkpoint.close()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_checkpoint_set_initial_values() {
        let dir = tempdir().unwrap();
        let set = CheckpointSet::open(dir.path(), CheckpointMode::Batched).unwrap();

        assert_eq!(set.writer.read(), 0);
        assert_eq!(set.chaser.read(), 0);
        assert_eq!(set.epoch.read(), -1);
        assert_eq!(set.truncate.read(), -1);
        assert_eq!(set.replication.read(), -1);
        assert!(dir.path().join("writer.chk").exists());
        assert!(dir.path().join("truncate.chk").exists());
    }

    #[test]
    fn test_checkpoint_set_survives_reopen() {
        let dir = tempdir().unwrap();
        {
            let set = CheckpointSet::open(dir.path(), CheckpointMode::Batched).unwrap();
            set.writer.write(4096).unwrap();
            set.chaser.write(1024).unwrap();
            set.close_all().unwrap();
        }

        let set = CheckpointSet::open(dir.path(), CheckpointMode::Batched).unwrap();
        assert_eq!(set.writer.read(), 4096);
        assert_eq!(set.chaser.read(), 1024);
    }
}
