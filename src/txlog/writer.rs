//! Log Writer
//!
//! Appends records to the last chunk. When a record does not fit, the chunk
//! is completed, the writer checkpoint jumps to the chunk end and the record
//! moves to the start of a fresh chunk.

use std::sync::Arc;

use crate::checkpoint::Checkpoint;
use crate::chunk::{AppendResult, Chunk};
use crate::db::{ChunkDb, ChunkManager};
use crate::error::{Error, Result};
use crate::record::LogRecord;

/// Where a record ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteResult {
    /// Position the record was written at
    pub log_position: i64,
    /// Writer position after the record
    pub next_position: i64,
}

/// The single writer of a database
pub struct ChunkWriter {
    manager: Arc<ChunkManager>,
    checkpoint: Arc<dyn Checkpoint>,
    current: Arc<Chunk>,
    position: i64,
}

impl ChunkWriter {
    /// Attach to the chunk holding the writer checkpoint
    pub fn open(db: &ChunkDb) -> Result<Self> {
        let manager = Arc::clone(db.manager());
        let checkpoint = Arc::clone(&db.checkpoints().writer);
        let position = checkpoint.read();

        let current = manager.get_chunk_for(position)?;
        if current.is_read_only() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} holding writer position {} is already completed",
                current, position
            )));
        }

        tracing::debug!("Writer opened at position {}", position);
        Ok(Self {
            manager,
            checkpoint,
            current,
            position,
        })
    }

    /// Position the next record must be written at
    pub fn position(&self) -> i64 {
        self.position
    }

    /// Append a record at the writer position. A record that does not fit
    /// in the current chunk is moved to the next one, changing its position.
    pub fn write(&mut self, record: &mut LogRecord) -> Result<WriteResult> {
        if record.log_position() != self.position {
            return Err(Error::InvalidArgument(format!(
                "record position {} does not match writer position {}",
                record.log_position(),
                self.position
            )));
        }

        let size = record.framed_size()?;
        let capacity = self.current.data_capacity();
        if size as i64 > capacity {
            return Err(Error::RecordTooLarge { size, capacity });
        }

        if let AppendResult::Appended { new_position, .. } = self.current.try_append(record)? {
            return self.advance(record.log_position(), new_position);
        }

        self.complete_chunk()?;
        record.relocate(self.position)?;

        match self.current.try_append(record)? {
            AppendResult::Appended { new_position, .. } => {
                self.advance(record.log_position(), new_position)
            }
            AppendResult::NotEnoughSpace { .. } => Err(Error::RecordTooLarge {
                size,
                capacity: self.current.data_capacity(),
            }),
        }
    }

    fn advance(&mut self, log_position: i64, new_local_position: i64) -> Result<WriteResult> {
        let next_position = self.current.chunk_start_position() + new_local_position;
        self.position = next_position;
        self.checkpoint.write(next_position)?;
        Ok(WriteResult {
            log_position,
            next_position,
        })
    }

    /// Make everything written so far durable
    pub fn flush(&self) -> Result<()> {
        self.current.flush()?;
        self.checkpoint.flush()
    }

    /// Complete the current chunk and continue in a new one
    pub fn complete_chunk(&mut self) -> Result<()> {
        self.current.flush()?;
        self.current.complete()?;

        let end = self.current.chunk_end_position();
        self.position = end;
        self.checkpoint.write(end)?;
        self.checkpoint.flush()?;

        self.current = self.manager.add_new_chunk()?;
        self.manager.trigger_background_caching();
        Ok(())
    }

    pub fn close(self) -> Result<()> {
        self.flush()?;
        tracing::debug!("Writer closed at position {}", self.position);
        Ok(())
    }
}
