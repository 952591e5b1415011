//! Log Chaser
//!
//! Follows the writer, recording how far it has read in the chaser
//! checkpoint. Scavenging never touches chunks past that checkpoint.

use std::sync::Arc;

use super::reader::ChunkReader;
use crate::checkpoint::Checkpoint;
use crate::db::ChunkDb;
use crate::error::Result;
use crate::record::LogRecord;

pub struct ChunkChaser {
    reader: ChunkReader,
    checkpoint: Arc<dyn Checkpoint>,
}

impl ChunkChaser {
    /// Start reading at the chaser checkpoint
    pub fn open(db: &ChunkDb) -> Result<Self> {
        let checkpoint = Arc::clone(&db.checkpoints().chaser);
        let reader = ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            checkpoint.read(),
        )?;
        Ok(Self { reader, checkpoint })
    }

    /// Read the next record and move the chaser checkpoint past it
    pub fn try_read_next(&mut self) -> Result<Option<LogRecord>> {
        match self.reader.try_read_next()? {
            Some(read) => {
                self.checkpoint.write(read.next_position)?;
                Ok(Some(read.record))
            }
            None => Ok(None),
        }
    }

    pub fn position(&self) -> i64 {
        self.reader.position()
    }

    pub fn flush(&self) -> Result<()> {
        self.checkpoint.flush()
    }

    pub fn close(self) -> Result<()> {
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{open_db, prepare};
    use crate::txlog::ChunkWriter;
    use tempfile::tempdir;

    #[test]
    fn test_chaser_follows_writer() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let mut chaser = ChunkChaser::open(&db).unwrap();

        assert!(chaser.try_read_next().unwrap().is_none());

        let mut record = prepare(0, "s", 10);
        let written = writer.write(&mut record).unwrap();
        assert_eq!(chaser.try_read_next().unwrap(), Some(record));
        assert_eq!(db.checkpoints().chaser.read(), written.next_position);
        assert!(chaser.try_read_next().unwrap().is_none());

        chaser.flush().unwrap();
        assert_eq!(db.checkpoints().chaser.read_flushed(), written.next_position);
    }

    #[test]
    fn test_chaser_resumes_from_checkpoint() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let first = writer.write(&mut prepare(0, "a", 10)).unwrap();
        let mut second = prepare(first.next_position, "b", 10);
        writer.write(&mut second).unwrap();

        db.checkpoints().chaser.write(first.next_position).unwrap();
        let mut chaser = ChunkChaser::open(&db).unwrap();
        assert_eq!(chaser.position(), first.next_position);
        assert_eq!(chaser.try_read_next().unwrap(), Some(second));
    }

    #[test]
    fn test_chaser_never_passes_writer() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let mut chaser = ChunkChaser::open(&db).unwrap();
        let checkpoints = db.checkpoints();
        let behind = || checkpoints.chaser.read() <= checkpoints.writer.read();

        let mut written = Vec::new();
        let mut read = Vec::new();
        for i in 0..60 {
            let mut record = prepare(writer.position(), &format!("s-{}", i % 5), 250);
            writer.write(&mut record).unwrap();
            written.push(record);
            assert!(behind());

            if i % 9 == 8 {
                writer.complete_chunk().unwrap();
                assert!(behind());
            }

            for _ in 0..i % 3 {
                if let Some(record) = chaser.try_read_next().unwrap() {
                    read.push(record);
                }
                assert!(behind());
                assert!(chaser.position() <= writer.position());
            }
        }
        assert!(db.manager().chunks_count() > 3);

        while let Some(record) = chaser.try_read_next().unwrap() {
            read.push(record);
            assert!(behind());
        }
        assert_eq!(read, written);
        assert!(chaser.try_read_next().unwrap().is_none());
        assert_eq!(chaser.position(), writer.position());
    }
}
