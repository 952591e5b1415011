//! File-backed checkpoint holding a single little-endian i64.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;

use super::{ensure_forward, Checkpoint, CheckpointMode};
use crate::error::{Error, Result};

const CHECKPOINT_SIZE: u64 = 8;

/// Checkpoint persisted in its own 8-byte file
pub struct FileCheckpoint {
    name: String,
    path: PathBuf,
    file: Mutex<File>,
    value: AtomicI64,
    flushed: AtomicI64,
    mode: CheckpointMode,
}

impl FileCheckpoint {
    /// Open an existing checkpoint file or create it holding `initial`
    pub fn open(path: PathBuf, name: &str, initial: i64, mode: CheckpointMode) -> Result<Self> {
        let exists = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let value = if exists {
            let len = file.metadata()?.len();
            if len != CHECKPOINT_SIZE {
                return Err(Error::CorruptDatabase(format!(
                    "checkpoint file {} has size {}, expected {}",
                    path.display(),
                    len,
                    CHECKPOINT_SIZE
                )));
            }
            file.seek(SeekFrom::Start(0))?;
            file.read_i64::<LittleEndian>()?
        } else {
            file.write_i64::<LittleEndian>(initial)?;
            file.sync_all()?;
            initial
        };

        tracing::debug!("Opened checkpoint {} at {}", name, value);

        Ok(Self {
            name: name.to_string(),
            path,
            file: Mutex::new(file),
            value: AtomicI64::new(value),
            flushed: AtomicI64::new(value),
            mode,
        })
    }

    /// Path of the backing file
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn persist(&self, value: i64) -> Result<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(0))?;
        file.write_i64::<LittleEndian>(value)?;
        file.flush()?;
        file.sync_data()?;
        self.flushed.store(value, Ordering::Release);
        Ok(())
    }
}

impl Checkpoint for FileCheckpoint {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    fn read_flushed(&self) -> i64 {
        self.flushed.load(Ordering::Acquire)
    }

    fn write(&self, value: i64) -> Result<()> {
        ensure_forward(&self.name, self.read(), value)?;
        self.value.store(value, Ordering::Release);
        if self.mode == CheckpointMode::Durable {
            self.persist(value)?;
        }
        Ok(())
    }

    fn reset(&self, value: i64) -> Result<()> {
        self.value.store(value, Ordering::Release);
        self.persist(value)
    }

    fn flush(&self) -> Result<()> {
        let value = self.read();
        if value == self.read_flushed() {
            return Ok(());
        }
        self.persist(value)
    }
}
