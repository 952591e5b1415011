//! Database
//!
//! Opening a database brings the chunk files back in line with the
//! checkpoints: a pending truncation is applied, completed chunks are opened
//! read-only, the chunk holding the writer position is reopened for
//! appending, and leftovers (stale chunk versions, temporary files) are
//! removed.

pub mod manager;
mod truncate;

pub use manager::{ChunkManager, MAX_CHUNKS_COUNT};

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;

use crate::checkpoint::CheckpointSet;
use crate::chunk::{
    scan_data_end, Chunk, ChunkFooter, ChunkHeader, FileNamingStrategy,
    VersionedPatternNamingStrategy,
};
use crate::config::DbConfig;
use crate::error::{Error, Result};

/// Prefix of chunk file names
pub const CHUNK_FILE_PREFIX: &str = "chunk-";

/// An open chunked transaction log
pub struct ChunkDb {
    config: DbConfig,
    checkpoints: CheckpointSet,
    naming: Arc<dyn FileNamingStrategy>,
    manager: Arc<ChunkManager>,
}

/// Summary of one chunk
#[derive(Debug, Clone, Serialize)]
pub struct ChunkInfo {
    pub file_name: String,
    pub chunk_start_number: i32,
    pub chunk_end_number: i32,
    pub scavenge_version: i32,
    pub is_read_only: bool,
    pub is_cached: bool,
    pub physical_data_size: i64,
    pub logical_data_size: i64,
    pub file_size: u64,
}

/// Summary of an open database
#[derive(Debug, Clone, Serialize)]
pub struct DbInfo {
    pub path: PathBuf,
    pub chunk_size: i32,
    pub writer_checkpoint: i64,
    pub chaser_checkpoint: i64,
    pub epoch_checkpoint: i64,
    pub replication_checkpoint: i64,
    pub chunks_count: i32,
    pub chunks: Vec<ChunkInfo>,
}

impl ChunkDb {
    /// Open the database in `config.path`, creating it if needed
    pub fn open(config: DbConfig) -> Result<Self> {
        config.validate()?;
        fs::create_dir_all(&config.path)?;

        let checkpoints = CheckpointSet::open(config.checkpoint_dir(), config.checkpoint_mode)?;
        let naming = Arc::new(VersionedPatternNamingStrategy::new(
            &config.path,
            CHUNK_FILE_PREFIX,
        ));
        Self::open_with(config, checkpoints, naming)
    }

    /// Open with explicit checkpoints and naming
    pub fn open_with(
        config: DbConfig,
        checkpoints: CheckpointSet,
        naming: Arc<dyn FileNamingStrategy>,
    ) -> Result<Self> {
        config.validate()?;
        tracing::info!("Opening chunk database at {}", config.path.display());

        let truncate_position = checkpoints.truncate.read();
        if truncate_position >= 0 {
            truncate::truncate_db(&config, &checkpoints, naming.as_ref(), truncate_position)?;
        }

        let writer = checkpoints.writer.read();
        for checkpoint in checkpoints.readers() {
            let position = checkpoint.read();
            if position > writer {
                return Err(Error::ReaderCheckpointHigherThanWriter {
                    name: checkpoint.name().to_string(),
                    position,
                    writer,
                });
            }
        }

        let manager = ChunkManager::new(config.clone(), Arc::clone(&naming));
        let db = Self {
            config,
            checkpoints,
            naming,
            manager,
        };

        db.open_chunks(writer)?;
        db.ensure_no_excessive_chunks()?;
        db.remove_old_chunk_versions()?;
        db.remove_temp_files()?;

        if db.config.verify_hash {
            for chunk in db.manager.all_chunks() {
                if chunk.is_read_only() {
                    chunk.verify_file_hash()?;
                }
            }
        }

        db.manager.enable_caching();
        tracing::info!(
            "Opened chunk database: {} chunks, writer at {}",
            db.manager.chunks_count(),
            db.checkpoints.writer.read()
        );
        Ok(db)
    }

    fn open_chunks(&self, writer: i64) -> Result<()> {
        let chunk_size = self.config.chunk_size as i64;
        let options = self.config.chunk_options();
        let last_chunk_number = (writer / chunk_size) as i32;
        let last_chunk_local = writer % chunk_size;

        let mut number = 0;
        while number < last_chunk_number {
            let path = self.newest_version(number)?.ok_or_else(|| {
                Error::CorruptDatabase(format!("chunk #{} is missing", number))
            })?;

            let at_boundary = last_chunk_local == 0 && number == last_chunk_number - 1;
            let chunk = if at_boundary && !is_completed_file(&path)? {
                // Writer reached the chunk end before the footer was written
                let end = scan_data_end(&path)?;
                tracing::warn!(
                    "Completing unfinished chunk #{} at local position {}",
                    number,
                    end
                );
                let chunk = Chunk::open_ongoing(path, end, options)?;
                chunk.complete()?;
                chunk
            } else {
                Chunk::open_completed(path, options, false)?
            };

            number = chunk.chunk_end_number() + 1;
            self.manager.add_chunk(chunk)?;
        }

        if number > last_chunk_number {
            // The writer position lies inside a merged scavenged chunk
            return self.resume_after(number as i64 * chunk_size);
        }

        match self.newest_version(last_chunk_number)? {
            None if last_chunk_local == 0 => {
                self.manager.add_new_chunk()?;
            }
            None => {
                return Err(Error::CorruptDatabase(format!(
                    "chunk #{} holding writer position {} is missing",
                    last_chunk_number, writer
                )));
            }
            Some(path) => {
                let header = read_header(&path)?;
                // A completed footer with the writer still inside the chunk
                // means the writer stopped before moving its checkpoint on
                if header.is_scavenged() || is_completed_file(&path)? {
                    let chunk = Chunk::open_completed(path, options, false)?;
                    let end = chunk.chunk_end_position();
                    self.manager.add_chunk(chunk)?;
                    return self.resume_after(end);
                }
                let chunk = Chunk::open_ongoing(path, last_chunk_local, options)?;
                self.manager.add_chunk(chunk)?;
            }
        }
        Ok(())
    }

    /// Move the writer to the end of a completed chunk and start a new one
    fn resume_after(&self, position: i64) -> Result<()> {
        tracing::warn!(
            "Moving writer checkpoint from {} to {} after a completed chunk",
            self.checkpoints.writer.read(),
            position
        );
        self.checkpoints.writer.write(position)?;
        self.checkpoints.writer.flush()?;
        self.manager.add_new_chunk()?;
        Ok(())
    }

    fn newest_version(&self, number: i32) -> Result<Option<PathBuf>> {
        Ok(self.naming.all_versions_for(number)?.into_iter().next())
    }

    /// Chunk files numbered past the last chunk mean the checkpoints and the
    /// files disagree
    fn ensure_no_excessive_chunks(&self) -> Result<()> {
        let count = self.manager.chunks_count();
        for path in self.naming.all_present_files()? {
            if let Some((index, _)) = self.naming.index_and_version(&path) {
                if index >= count {
                    return Err(Error::CorruptDatabase(format!(
                        "unexpected chunk file {} beyond chunk #{}",
                        path.display(),
                        count - 1
                    )));
                }
            }
        }
        Ok(())
    }

    /// Delete every chunk file that is not the one in use for its number
    fn remove_old_chunk_versions(&self) -> Result<()> {
        for path in self.naming.all_present_files()? {
            let Some((index, _)) = self.naming.index_and_version(&path) else {
                continue;
            };
            let in_use = self
                .manager
                .try_get_chunk(index)
                .map_or(false, |chunk| chunk.path() == path);
            if !in_use {
                fs::remove_file(&path)?;
                tracing::info!("Removed stale chunk file {}", path.display());
            }
        }
        Ok(())
    }

    fn remove_temp_files(&self) -> Result<()> {
        for path in self.naming.all_temp_files()? {
            fs::remove_file(&path)?;
            tracing::info!("Removed temporary file {}", path.display());
        }
        Ok(())
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn checkpoints(&self) -> &CheckpointSet {
        &self.checkpoints
    }

    pub fn manager(&self) -> &Arc<ChunkManager> {
        &self.manager
    }

    pub fn naming(&self) -> &Arc<dyn FileNamingStrategy> {
        &self.naming
    }

    /// Describe the database and each of its chunks
    pub fn describe(&self) -> DbInfo {
        let chunks = self
            .manager
            .all_chunks()
            .iter()
            .map(|chunk| ChunkInfo {
                file_name: chunk
                    .path()
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
                chunk_start_number: chunk.chunk_start_number(),
                chunk_end_number: chunk.chunk_end_number(),
                scavenge_version: chunk.header().scavenge_version,
                is_read_only: chunk.is_read_only(),
                is_cached: chunk.is_cached(),
                physical_data_size: chunk.physical_data_size(),
                logical_data_size: chunk.logical_data_size(),
                file_size: chunk.file_size(),
            })
            .collect();

        DbInfo {
            path: self.config.path.clone(),
            chunk_size: self.config.chunk_size,
            writer_checkpoint: self.checkpoints.writer.read(),
            chaser_checkpoint: self.checkpoints.chaser.read(),
            epoch_checkpoint: self.checkpoints.epoch.read(),
            replication_checkpoint: self.checkpoints.replication.read(),
            chunks_count: self.manager.chunks_count(),
            chunks,
        }
    }

    /// Flush checkpoints and close every chunk
    pub fn close(&self) -> Result<()> {
        if let Some(last) = self.manager.last_chunk() {
            last.flush()?;
        }
        self.checkpoints.close_all()?;
        if !self.manager.close() {
            tracing::warn!("Closed chunk database with readers still open");
        }
        tracing::info!("Closed chunk database at {}", self.config.path.display());
        Ok(())
    }
}

fn read_header(path: &Path) -> Result<ChunkHeader> {
    let mut file = File::open(path)?;
    ChunkHeader::read_from(&mut file).map_err(|e| Error::corrupt(path, e.to_string()))
}

fn is_completed_file(path: &Path) -> Result<bool> {
    let mut file = File::open(path)?;
    let footer = ChunkFooter::read_from(&mut file).map_err(|e| Error::corrupt(path, e.to_string()))?;
    Ok(footer.map_or(false, |f| f.is_completed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::AppendResult;
    use crate::test_support::{prepare, test_config};
    use tempfile::tempdir;

    #[test]
    fn test_open_empty_creates_first_chunk() {
        let dir = tempdir().unwrap();
        let db = ChunkDb::open(test_config(dir.path())).unwrap();

        assert_eq!(db.manager().chunks_count(), 1);
        assert!(dir.path().join("chunk-000000.000000").exists());
        assert!(dir.path().join("writer.chk").exists());
        let chunk = db.manager().get_chunk(0).unwrap();
        assert!(!chunk.is_read_only());
        db.close().unwrap();
    }

    #[test]
    fn test_reopen_resumes_at_writer_position() {
        let dir = tempdir().unwrap();
        let record = prepare(0, "s", 50);
        let end;
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            let AppendResult::Appended { new_position, .. } = chunk.try_append(&record).unwrap()
            else {
                panic!("append failed");
            };
            end = new_position;
            chunk.flush().unwrap();
            db.checkpoints().writer.write(end).unwrap();
            db.close().unwrap();
        }

        let db = ChunkDb::open(test_config(dir.path())).unwrap();
        let chunk = db.manager().get_chunk(0).unwrap();
        assert_eq!(chunk.physical_data_size(), end);
        assert_eq!(chunk.try_read_at(0).unwrap(), Some(record));
        db.close().unwrap();
    }

    #[test]
    fn test_boundary_chunk_without_footer_is_completed() {
        let dir = tempdir().unwrap();
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            chunk.try_append(&prepare(0, "s", 50)).unwrap();
            chunk.flush().unwrap();
            db.checkpoints().writer.write(4096).unwrap();
            db.close().unwrap();
        }

        let db = ChunkDb::open(test_config(dir.path())).unwrap();
        assert_eq!(db.manager().chunks_count(), 2);
        let first = db.manager().get_chunk(0).unwrap();
        assert!(first.is_read_only());
        assert!(first.try_read_at(0).unwrap().is_some());
        assert!(!db.manager().get_chunk(1).unwrap().is_read_only());
        db.close().unwrap();
    }

    #[test]
    fn test_completed_chunk_before_checkpoint_moved() {
        let dir = tempdir().unwrap();
        let record = prepare(0, "s", 50);
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            let AppendResult::Appended { new_position, .. } = chunk.try_append(&record).unwrap()
            else {
                panic!("append failed");
            };
            chunk.flush().unwrap();
            db.checkpoints().writer.write(new_position).unwrap();
            db.checkpoints().writer.flush().unwrap();
            // Stop after the footer is written but before the checkpoint moves
            chunk.complete().unwrap();
            db.close().unwrap();
        }

        let db = ChunkDb::open(test_config(dir.path())).unwrap();
        assert_eq!(db.checkpoints().writer.read(), 4096);
        assert_eq!(db.manager().chunks_count(), 2);
        let first = db.manager().get_chunk(0).unwrap();
        assert!(first.is_read_only());
        assert_eq!(first.try_read_at(0).unwrap(), Some(record));
        assert!(!db.manager().get_chunk(1).unwrap().is_read_only());
        db.close().unwrap();
    }

    #[test]
    fn test_missing_chunk_is_corruption() {
        let dir = tempdir().unwrap();
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            db.checkpoints().writer.write(5000).unwrap();
            db.close().unwrap();
        }
        let err = ChunkDb::open(test_config(dir.path())).err().unwrap();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_reader_checkpoint_ahead_of_writer() {
        let dir = tempdir().unwrap();
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            db.checkpoints().chaser.write(10).unwrap();
            db.close().unwrap();
        }
        let err = ChunkDb::open(test_config(dir.path())).err().unwrap();
        assert!(matches!(
            err,
            Error::ReaderCheckpointHigherThanWriter { ref name, .. } if name == "chaser"
        ));
    }

    #[test]
    fn test_open_removes_temp_and_stale_files() {
        let dir = tempdir().unwrap();
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            db.close().unwrap();
        }
        let temp = dir.path().join("0f0e0d0c-0000-4000-8000-000000000000.tmp");
        fs::write(&temp, b"partial").unwrap();
        fs::write(dir.path().join("chunk-000007.000000"), b"").unwrap();

        let err = ChunkDb::open(test_config(dir.path())).err().unwrap();
        assert!(err.is_corruption());

        fs::remove_file(dir.path().join("chunk-000007.000000")).unwrap();
        let db = ChunkDb::open(test_config(dir.path())).unwrap();
        assert!(!temp.exists());
        db.close().unwrap();
    }

    #[test]
    fn test_truncation_applied_on_open() {
        let dir = tempdir().unwrap();
        let first = prepare(0, "s", 20);
        {
            let db = ChunkDb::open(test_config(dir.path())).unwrap();
            let chunk = db.manager().get_chunk(0).unwrap();
            let AppendResult::Appended { new_position, .. } = chunk.try_append(&first).unwrap()
            else {
                panic!("append failed");
            };
            chunk.try_append(&prepare(new_position, "s", 20)).unwrap();
            chunk.flush().unwrap();
            db.checkpoints().writer.write(chunk.physical_data_size()).unwrap();
            db.checkpoints().truncate.write(new_position).unwrap();
            db.close().unwrap();
        }

        let db = ChunkDb::open(test_config(dir.path())).unwrap();
        let end = db.checkpoints().writer.read();
        assert_eq!(db.checkpoints().truncate.read(), -1);
        let chunk = db.manager().get_chunk(0).unwrap();
        assert_eq!(chunk.physical_data_size(), end);
        assert_eq!(chunk.try_read_at(0).unwrap(), Some(first));
        assert!(chunk.try_read_at(end).unwrap().is_none());

        let info = db.describe();
        assert_eq!(info.writer_checkpoint, end);
        assert_eq!(info.chunks.len(), 1);
        db.close().unwrap();
    }
}
