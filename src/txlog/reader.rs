//! Log Reader
//!
//! Reads records across chunk boundaries, forward or backward, never past
//! the writer checkpoint. A chunk that is swapped out mid-read is looked up
//! again; positions that used to hold records removed by scavenging are
//! skipped.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::checkpoint::Checkpoint;
use crate::chunk::Chunk;
use crate::db::ChunkManager;
use crate::error::{Error, Result};
use crate::record::LogRecord;

/// Attempts made when a chunk is being replaced under the reader
const MAX_RETRIES: u32 = 20;

/// A record read from the log
#[derive(Debug, Clone, PartialEq)]
pub struct SeqRead {
    pub record: LogRecord,
    pub record_position: i64,
    /// Reader position after the read
    pub next_position: i64,
}

pub struct ChunkReader {
    manager: Arc<ChunkManager>,
    writer_checkpoint: Arc<dyn Checkpoint>,
    position: i64,
    cancel: Option<CancellationToken>,
}

impl ChunkReader {
    pub fn new(
        manager: Arc<ChunkManager>,
        writer_checkpoint: Arc<dyn Checkpoint>,
        position: i64,
    ) -> Result<Self> {
        if position < 0 {
            return Err(Error::InvalidArgument(format!(
                "reader position must be non-negative, got {}",
                position
            )));
        }
        Ok(Self {
            manager,
            writer_checkpoint,
            position,
            cancel: None,
        })
    }

    /// Abort reads with `Error::Cancelled` once the token fires
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn position(&self) -> i64 {
        self.position
    }

    pub fn reposition(&mut self, position: i64) -> Result<()> {
        if position < 0 {
            return Err(Error::InvalidArgument(format!(
                "reader position must be non-negative, got {}",
                position
            )));
        }
        self.position = position;
        Ok(())
    }

    fn check_cancelled(&self) -> Result<()> {
        match &self.cancel {
            Some(token) if token.is_cancelled() => Err(Error::Cancelled),
            _ => Ok(()),
        }
    }

    /// Chunk covering a position, waiting out a concurrent swap
    fn chunk_for(&self, position: i64, retries: &mut u32) -> Result<Arc<Chunk>> {
        loop {
            if let Some(chunk) = self.manager.try_get_chunk_for(position) {
                return Ok(chunk);
            }
            self.retry(retries, || {
                Error::InvariantViolation(format!(
                    "no chunk covers position {} below writer checkpoint {}",
                    position,
                    self.writer_checkpoint.read()
                ))
            })?;
        }
    }

    fn retry(&self, retries: &mut u32, exhausted: impl FnOnce() -> Error) -> Result<()> {
        *retries += 1;
        if *retries > MAX_RETRIES {
            return Err(exhausted());
        }
        std::thread::yield_now();
        Ok(())
    }

    /// Next record at or after the reader position
    pub fn try_read_next(&mut self) -> Result<Option<SeqRead>> {
        let mut retries = 0;
        loop {
            self.check_cancelled()?;
            let writer = self.writer_checkpoint.read();
            if self.position >= writer {
                return Ok(None);
            }

            let chunk = self.chunk_for(self.position, &mut retries)?;
            let local = chunk.header().local_position(self.position);

            match chunk.try_read_closest_forward(local) {
                Ok(Some(read)) => {
                    let record_position = read.record.log_position();
                    if record_position >= writer {
                        return Ok(None);
                    }
                    let next_position = chunk.chunk_start_position() + read.next_position;
                    self.position = next_position;
                    return Ok(Some(SeqRead {
                        record: read.record,
                        record_position,
                        next_position,
                    }));
                }
                Ok(None) if chunk.is_read_only() => {
                    self.position = chunk.chunk_end_position();
                }
                Ok(None) => return Ok(None),
                Err(Error::FileBeingDeleted) => {
                    self.retry(&mut retries, || Error::FileBeingDeleted)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Last record before the reader position
    pub fn try_read_prev(&mut self) -> Result<Option<SeqRead>> {
        let mut retries = 0;
        loop {
            self.check_cancelled()?;
            let writer = self.writer_checkpoint.read();
            if self.position > writer {
                return Err(Error::ReadPastEnd {
                    position: self.position,
                    limit: writer,
                });
            }
            if self.position == 0 {
                return Ok(None);
            }

            let chunk = self.chunk_for(self.position - 1, &mut retries)?;
            let result = if self.position == chunk.chunk_end_position() {
                chunk.try_read_last()
            } else {
                chunk.try_read_closest_backward(chunk.header().local_position(self.position))
            };

            match result {
                Ok(Some(read)) => {
                    let record_position = read.record.log_position();
                    self.position = record_position;
                    return Ok(Some(SeqRead {
                        record: read.record,
                        record_position,
                        next_position: record_position,
                    }));
                }
                Ok(None) => {
                    self.position = chunk.chunk_start_position();
                }
                Err(Error::FileBeingDeleted) => {
                    self.retry(&mut retries, || Error::FileBeingDeleted)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Record starting exactly at a position
    pub fn try_read_at(&self, position: i64) -> Result<Option<LogRecord>> {
        if position < 0 {
            return Err(Error::InvalidArgument(format!(
                "log position must be non-negative, got {}",
                position
            )));
        }
        if position >= self.writer_checkpoint.read() {
            return Ok(None);
        }

        let mut retries = 0;
        loop {
            self.check_cancelled()?;
            let chunk = self.chunk_for(position, &mut retries)?;
            match chunk.try_read_at(chunk.header().local_position(position)) {
                Err(Error::FileBeingDeleted) => {
                    self.retry(&mut retries, || Error::FileBeingDeleted)?;
                }
                other => return other,
            }
        }
    }

    /// Whether a position below the writer checkpoint holds a record
    pub fn exists_at(&self, position: i64) -> Result<bool> {
        if position < 0 || position >= self.writer_checkpoint.read() {
            return Ok(false);
        }

        let mut retries = 0;
        loop {
            let chunk = self.chunk_for(position, &mut retries)?;
            match chunk.exists_at(chunk.header().local_position(position)) {
                Err(Error::FileBeingDeleted) => {
                    self.retry(&mut retries, || Error::FileBeingDeleted)?;
                }
                other => return other,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_db, prepare};
    use crate::txlog::ChunkWriter;
    use rand::Rng;
    use tempfile::tempdir;

    #[test]
    fn test_forward_and_backward_across_chunks() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();

        let mut positions = Vec::new();
        for i in 0..20 {
            let mut record = prepare(writer.position(), &format!("s-{}", i), 300);
            positions.push(writer.write(&mut record).unwrap().log_position);
        }
        assert!(db.manager().chunks_count() > 1);

        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap();

        let mut forward = Vec::new();
        while let Some(read) = reader.try_read_next().unwrap() {
            forward.push(read.record_position);
        }
        assert_eq!(forward, positions);
        assert_eq!(reader.position(), writer.position());

        let mut backward = Vec::new();
        while let Some(read) = reader.try_read_prev().unwrap() {
            backward.push(read.record_position);
        }
        backward.reverse();
        assert_eq!(backward, positions);
        assert_eq!(reader.position(), 0);
    }

    #[test]
    fn test_random_payloads_read_back() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let mut rng = rand::thread_rng();

        let mut written = Vec::new();
        for i in 0..200 {
            let stream = format!("s-{}", i % 7);
            let mut record = prepare(writer.position(), &stream, rng.gen_range(0..900));
            writer.write(&mut record).unwrap();
            written.push(record);
        }

        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap();
        for expected in &written {
            let read = reader.try_read_next().unwrap().unwrap();
            assert_eq!(&read.record, expected);
        }
        assert!(reader.try_read_next().unwrap().is_none());

        for expected in written.iter().rev() {
            let read = reader.try_read_prev().unwrap().unwrap();
            assert_eq!(&read.record, expected);
        }
        assert!(reader.try_read_prev().unwrap().is_none());
    }

    #[test]
    fn test_reads_stop_at_writer_checkpoint() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let chunk = db.manager().get_chunk(0).unwrap();
        chunk.try_append(&prepare(0, "s", 10)).unwrap();

        let reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap();
        assert_eq!(reader.try_read_at(0).unwrap(), None);
        assert!(!reader.exists_at(0).unwrap());

        db.checkpoints()
            .writer
            .write(chunk.physical_data_size())
            .unwrap();
        assert!(reader.try_read_at(0).unwrap().is_some());
        assert!(reader.exists_at(0).unwrap());
    }

    #[test]
    fn test_read_prev_past_writer_fails() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            100,
        )
        .unwrap();
        assert!(matches!(
            reader.try_read_prev(),
            Err(Error::ReadPastEnd { .. })
        ));
        assert!(ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            -1
        )
        .is_err());
    }

    #[test]
    fn test_missing_chunk_below_writer_is_invariant_violation() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        // The writer claims data in chunk #1 but only chunk #0 exists
        db.checkpoints().writer.write(4096 + 100).unwrap();

        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            4096,
        )
        .unwrap();
        assert!(matches!(
            reader.try_read_next(),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            reader.try_read_at(4096),
            Err(Error::InvariantViolation(_))
        ));
        assert!(matches!(
            reader.exists_at(4096),
            Err(Error::InvariantViolation(_))
        ));
    }

    #[test]
    fn test_chunk_being_deleted_after_retries() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let first = writer.write(&mut prepare(0, "s", 50)).unwrap();
        writer.complete_chunk().unwrap();
        let mut second = prepare(writer.position(), "s", 50);
        writer.write(&mut second).unwrap();

        db.manager().get_chunk(0).unwrap().mark_for_deletion();

        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap();
        assert!(matches!(
            reader.try_read_next(),
            Err(Error::FileBeingDeleted)
        ));
        assert_eq!(reader.position(), 0);
        assert!(matches!(
            reader.try_read_at(first.log_position),
            Err(Error::FileBeingDeleted)
        ));

        // Chunks that are still live read normally
        assert_eq!(
            reader.try_read_at(second.log_position()).unwrap(),
            Some(second)
        );
    }

    #[test]
    fn test_cancelled_reader() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let token = CancellationToken::new();
        let mut reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap()
        .with_cancellation(token.clone());

        token.cancel();
        assert!(matches!(reader.try_read_next(), Err(Error::Cancelled)));
    }
}
