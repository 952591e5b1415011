//! Chunk Manager
//!
//! Maps chunk numbers to the chunk objects covering them. A merged chunk
//! occupies every slot in its range. Readers look slots up without locking;
//! adding and swapping chunks is serialized.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::chunk::{Chunk, FileNamingStrategy};
use crate::config::DbConfig;
use crate::error::{Error, Result};

/// Upper bound on chunk numbers
pub const MAX_CHUNKS_COUNT: usize = 100_000;

pub struct ChunkManager {
    config: DbConfig,
    naming: Arc<dyn FileNamingStrategy>,
    chunks: Box<[ArcSwapOption<Chunk>]>,
    chunks_count: AtomicI32,
    mutation: Mutex<()>,
    caching_enabled: AtomicBool,
    caching_running: AtomicBool,
    passes_remaining: AtomicU32,
    this: Weak<ChunkManager>,
}

impl ChunkManager {
    pub fn new(config: DbConfig, naming: Arc<dyn FileNamingStrategy>) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            config,
            naming,
            chunks: (0..MAX_CHUNKS_COUNT)
                .map(|_| ArcSwapOption::empty())
                .collect(),
            chunks_count: AtomicI32::new(0),
            mutation: Mutex::new(()),
            caching_enabled: AtomicBool::new(false),
            caching_running: AtomicBool::new(false),
            passes_remaining: AtomicU32::new(0),
            this: this.clone(),
        })
    }

    pub fn config(&self) -> &DbConfig {
        &self.config
    }

    pub fn naming(&self) -> &Arc<dyn FileNamingStrategy> {
        &self.naming
    }

    /// One past the highest chunk number present
    pub fn chunks_count(&self) -> i32 {
        self.chunks_count.load(Ordering::Acquire)
    }

    /// Create the next chunk file and register it
    pub fn add_new_chunk(&self) -> Result<Arc<Chunk>> {
        let _guard = self.mutation.lock();
        let number = self.chunks_count();
        let chunk = Chunk::create_new(
            self.naming.filename_for(number, 0),
            self.config.chunk_size,
            number,
            number,
            0,
            self.config.chunk_options(),
        )?;
        self.add_chunk_locked(Arc::clone(&chunk))?;

        tracing::info!("Added chunk #{}", number);
        Ok(chunk)
    }

    /// Register an opened chunk in every slot of its range
    pub fn add_chunk(&self, chunk: Arc<Chunk>) -> Result<()> {
        let read_only = chunk.is_read_only();
        {
            let _guard = self.mutation.lock();
            self.add_chunk_locked(chunk)?;
        }
        if read_only {
            self.trigger_background_caching();
        }
        Ok(())
    }

    fn add_chunk_locked(&self, chunk: Arc<Chunk>) -> Result<()> {
        let start = chunk.chunk_start_number();
        let end = chunk.chunk_end_number();
        if end as usize >= MAX_CHUNKS_COUNT {
            return Err(Error::InvalidOperation(format!(
                "chunk #{} exceeds the maximum of {} chunks",
                end, MAX_CHUNKS_COUNT
            )));
        }
        if start > self.chunks_count() {
            return Err(Error::InvariantViolation(format!(
                "chunk #{}-{} would leave a gap after chunk #{}",
                start,
                end,
                self.chunks_count() - 1
            )));
        }

        for number in start..=end {
            self.chunks[number as usize].store(Some(Arc::clone(&chunk)));
        }
        self.chunks_count.fetch_max(end + 1, Ordering::AcqRel);
        Ok(())
    }

    /// Create a chunk under a temporary name for the scavenger
    pub fn create_temp_chunk(
        &self,
        chunk_start_number: i32,
        chunk_end_number: i32,
        scavenge_version: i32,
    ) -> Result<Arc<Chunk>> {
        Chunk::create_new(
            self.naming.temp_filename(),
            self.config.chunk_size,
            chunk_start_number,
            chunk_end_number,
            scavenge_version,
            self.config.chunk_options(),
        )
    }

    pub fn try_get_chunk(&self, number: i32) -> Option<Arc<Chunk>> {
        if number < 0 || number as usize >= MAX_CHUNKS_COUNT {
            return None;
        }
        self.chunks[number as usize].load_full()
    }

    pub fn get_chunk(&self, number: i32) -> Result<Arc<Chunk>> {
        self.try_get_chunk(number)
            .ok_or(Error::ChunkNotPresent(number))
    }

    /// Chunk number covering a log position
    pub fn chunk_number_for(&self, log_position: i64) -> Result<i32> {
        if log_position < 0 {
            return Err(Error::InvalidArgument(format!(
                "log position must be non-negative, got {}",
                log_position
            )));
        }
        i32::try_from(log_position / self.config.chunk_size as i64)
            .map_err(|_| Error::InvalidArgument(format!("log position {} out of range", log_position)))
    }

    pub fn try_get_chunk_for(&self, log_position: i64) -> Option<Arc<Chunk>> {
        self.chunk_number_for(log_position)
            .ok()
            .and_then(|number| self.try_get_chunk(number))
    }

    pub fn get_chunk_for(&self, log_position: i64) -> Result<Arc<Chunk>> {
        let number = self.chunk_number_for(log_position)?;
        self.get_chunk(number)
    }

    /// Chunk holding the highest chunk number
    pub fn last_chunk(&self) -> Option<Arc<Chunk>> {
        self.try_get_chunk(self.chunks_count() - 1)
    }

    /// Every distinct chunk in order
    pub fn all_chunks(&self) -> Vec<Arc<Chunk>> {
        let mut chunks: Vec<Arc<Chunk>> = Vec::new();
        for number in 0..self.chunks_count() {
            if let Some(chunk) = self.try_get_chunk(number) {
                if chunks.last().map_or(true, |last| !Arc::ptr_eq(last, &chunk)) {
                    chunks.push(chunk);
                }
            }
        }
        chunks
    }

    /// Install a completed chunk in place of the chunks covering its range.
    ///
    /// The chunk is closed, renamed to the next version of its start number
    /// and reopened. The chunks it replaces are marked for deletion and
    /// vanish once their last reader is done.
    pub fn switch_chunk(&self, chunk: Arc<Chunk>, verify_hash: bool) -> Result<Arc<Chunk>> {
        if !chunk.is_read_only() {
            return Err(Error::InvalidOperation(format!(
                "chunk {} must be completed before it can be switched in",
                chunk
            )));
        }

        let start = chunk.chunk_start_number();
        let end = chunk.chunk_end_number();
        let old_path = chunk.path().to_path_buf();

        chunk.dispose();
        if !chunk.wait_for_destroy(self.config.file_deletion_wait) {
            return Err(Error::Timeout(format!(
                "chunk {} still has readers after {:?}",
                chunk, self.config.file_deletion_wait
            )));
        }

        let new_chunk = {
            let _guard = self.mutation.lock();
            let replaced = self.replaced_by(start, end)?;

            let new_path = self.naming.next_version_filename_for(start)?;
            fs::rename(&old_path, &new_path)?;
            let new_chunk =
                Chunk::open_completed(new_path, self.config.chunk_options(), verify_hash)?;

            for number in start..=end {
                self.chunks[number as usize].store(Some(Arc::clone(&new_chunk)));
            }
            for old in replaced {
                old.mark_for_deletion();
            }
            new_chunk
        };

        tracing::info!("Switched in chunk {}", new_chunk);
        self.trigger_background_caching();
        Ok(new_chunk)
    }

    /// The distinct chunks a new chunk spanning `start..=end` would replace.
    /// Fails if any of them reaches outside that range.
    fn replaced_by(&self, start: i32, end: i32) -> Result<Vec<Arc<Chunk>>> {
        if start < 0 || end >= self.chunks_count() {
            return Err(Error::InvariantViolation(format!(
                "chunk range #{}-{} is outside of the {} present chunks",
                start,
                end,
                self.chunks_count()
            )));
        }

        let mut replaced: Vec<Arc<Chunk>> = Vec::new();
        for number in start..=end {
            let existing = self
                .try_get_chunk(number)
                .ok_or(Error::ChunkNotPresent(number))?;
            if existing.chunk_start_number() < start || existing.chunk_end_number() > end {
                return Err(Error::InvariantViolation(format!(
                    "chunk {} is not contained in range #{}-{}",
                    existing, start, end
                )));
            }
            if replaced.last().map_or(true, |last| !Arc::ptr_eq(last, &existing)) {
                replaced.push(existing);
            }
        }
        Ok(replaced)
    }

    /// Start keeping the most recent completed chunks in memory
    pub fn enable_caching(&self) {
        if self.config.cached_chunks == 0 {
            return;
        }
        self.caching_enabled.store(true, Ordering::Release);
        self.trigger_background_caching();
    }

    /// Schedule a cache pass on a background thread. Requests made while a
    /// pass runs are coalesced into one more pass.
    pub fn trigger_background_caching(&self) {
        if !self.caching_enabled.load(Ordering::Acquire) {
            return;
        }

        self.passes_remaining.fetch_add(1, Ordering::AcqRel);
        if self
            .caching_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        let Some(manager) = self.this.upgrade() else {
            self.caching_running.store(false, Ordering::Release);
            return;
        };

        let spawned = std::thread::Builder::new()
            .name("chunk-cache".into())
            .spawn(move || manager.caching_loop());
        if let Err(e) = spawned {
            tracing::warn!("Failed to start chunk caching thread: {}", e);
            self.caching_running.store(false, Ordering::Release);
        }
    }

    fn caching_loop(&self) {
        loop {
            self.passes_remaining.store(0, Ordering::Release);
            if let Err(e) = self.run_cache_pass() {
                tracing::warn!("Chunk cache pass failed: {}", e);
            }

            if self.passes_remaining.load(Ordering::Acquire) > 0 {
                continue;
            }
            self.caching_running.store(false, Ordering::Release);

            // A trigger may have arrived between the check and the release
            if self.passes_remaining.load(Ordering::Acquire) == 0
                || self
                    .caching_running
                    .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                return;
            }
        }
    }

    /// Cache the newest `cached_chunks` completed chunks and uncache the rest
    pub fn run_cache_pass(&self) -> Result<()> {
        if !self.caching_enabled.load(Ordering::Acquire) {
            return Ok(());
        }

        let mut cached = 0;
        for chunk in self.all_chunks().into_iter().rev() {
            if !chunk.is_read_only() {
                continue;
            }

            let result = if cached < self.config.cached_chunks {
                cached += 1;
                chunk.cache_in_memory()
            } else {
                chunk.uncache_from_memory()
            };

            match result {
                Ok(_) | Err(Error::FileBeingDeleted) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Stop caching and dispose every chunk. Returns false if some chunk
    /// still had readers once the wait expired.
    pub fn close(&self) -> bool {
        self.caching_enabled.store(false, Ordering::Release);

        let chunks = {
            let _guard = self.mutation.lock();
            let chunks = self.all_chunks();
            for slot in self.chunks.iter().take(self.chunks_count().max(0) as usize) {
                slot.store(None);
            }
            self.chunks_count.store(0, Ordering::Release);
            chunks
        };

        let mut all_closed = true;
        for chunk in &chunks {
            chunk.dispose();
        }
        for chunk in &chunks {
            if !chunk.wait_for_destroy(self.config.file_deletion_wait) {
                tracing::warn!("Chunk {} still has readers at close", chunk);
                all_closed = false;
            }
        }
        all_closed
    }
}
