//! Ephemeral checkpoint for tests and throwaway databases.

use std::sync::atomic::{AtomicI64, Ordering};

use super::{ensure_forward, Checkpoint};
use crate::error::Result;

/// Checkpoint that lives only in memory
pub struct InMemoryCheckpoint {
    name: String,
    value: AtomicI64,
    flushed: AtomicI64,
}

impl InMemoryCheckpoint {
    pub fn new(name: &str, initial: i64) -> Self {
        Self {
            name: name.to_string(),
            value: AtomicI64::new(initial),
            flushed: AtomicI64::new(initial),
        }
    }
}

impl Checkpoint for InMemoryCheckpoint {
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
        Ok(())
    }

    fn reset(&self, value: i64) -> Result<()> {
        self.value.store(value, Ordering::Release);
        self.flushed.store(value, Ordering::Release);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        self.flushed.store(self.read(), Ordering::Release);
        Ok(())
    }
}
