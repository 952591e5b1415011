//! Reader work items
//!
//! Short-lived read handles over a chunk, backed either by a pooled file
//! handle or by the chunk's cached in-memory copy.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

use super::lifecycle::Lifecycle;
use crate::error::{Error, Result};

/// Attempts made to obtain a file handle before giving up
const ACQUIRE_ATTEMPTS: u32 = 1000;
/// Attempts that busy-spin before yielding the thread
const SPIN_ATTEMPTS: u32 = 50;

/// A seekable view over the chunk's bytes
pub(crate) enum ReaderStream {
    File(File),
    Memory(Cursor<Bytes>),
}

impl ReaderStream {
    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, ReaderStream::Memory(_))
    }
}

impl Read for ReaderStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            ReaderStream::File(file) => file.read(buf),
            ReaderStream::Memory(cursor) => cursor.read(buf),
        }
    }
}

impl Seek for ReaderStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            ReaderStream::File(file) => file.seek(pos),
            ReaderStream::Memory(cursor) => cursor.seek(pos),
        }
    }
}

/// Bounded pool of file handles plus the optional cached buffer
pub(crate) struct ReaderPool {
    path: PathBuf,
    idle: Mutex<Vec<File>>,
    file_count: AtomicUsize,
    max_count: usize,
    cache: RwLock<Option<Bytes>>,
    closed: AtomicBool,
}

impl ReaderPool {
    pub(crate) fn new(path: &Path, max_count: usize) -> Self {
        Self {
            path: path.to_path_buf(),
            idle: Mutex::new(Vec::new()),
            file_count: AtomicUsize::new(0),
            max_count: max_count.max(1),
            cache: RwLock::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// Open `count` handles up front
    pub(crate) fn prime(&self, count: usize) -> Result<()> {
        let count = count.min(self.max_count);
        let mut idle = self.idle.lock();
        while self.file_count.load(Ordering::Acquire) < count {
            idle.push(File::open(&self.path)?);
            self.file_count.fetch_add(1, Ordering::AcqRel);
        }
        Ok(())
    }

    pub(crate) fn set_cache(&self, buffer: Option<Bytes>) {
        *self.cache.write() = buffer;
    }

    pub(crate) fn cached_buffer(&self) -> Option<Bytes> {
        self.cache.read().clone()
    }

    pub(crate) fn is_cached(&self) -> bool {
        self.cache.read().is_some()
    }

    /// Get a stream, preferring the cached buffer. Spins briefly when every
    /// file handle is in use and fails fast once the chunk is destructing.
    pub(crate) fn acquire(&self, lifecycle: &Lifecycle) -> Result<ReaderStream> {
        if let Some(buffer) = self.cache.read().clone() {
            return Ok(ReaderStream::Memory(Cursor::new(buffer)));
        }

        for attempt in 0..ACQUIRE_ATTEMPTS {
            if lifecycle.is_destructing() || self.closed.load(Ordering::Acquire) {
                return Err(Error::FileBeingDeleted);
            }

            if let Some(file) = self.idle.lock().pop() {
                return Ok(ReaderStream::File(file));
            }

            let count = self.file_count.load(Ordering::Acquire);
            if count < self.max_count {
                if self
                    .file_count
                    .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return match File::open(&self.path) {
                        Ok(file) => Ok(ReaderStream::File(file)),
                        Err(e) => {
                            self.file_count.fetch_sub(1, Ordering::AcqRel);
                            Err(e.into())
                        }
                    };
                }
                continue;
            }

            if attempt < SPIN_ATTEMPTS {
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }

        Err(Error::ReaderPoolExhausted(self.path.display().to_string()))
    }

    pub(crate) fn release(&self, stream: ReaderStream) {
        if let ReaderStream::File(file) = stream {
            if self.closed.load(Ordering::Acquire) {
                self.file_count.fetch_sub(1, Ordering::AcqRel);
            } else {
                self.idle.lock().push(file);
            }
        }
    }

    /// Drop every handle and the cached buffer
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let mut idle = self.idle.lock();
        self.file_count.fetch_sub(idle.len(), Ordering::AcqRel);
        idle.clear();
        *self.cache.write() = None;
    }

    #[cfg(test)]
    pub(crate) fn file_count(&self) -> usize {
        self.file_count.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pool_reuses_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"0123456789").unwrap();

        let lifecycle = Lifecycle::default();
        let pool = ReaderPool::new(&path, 2);
        pool.prime(1).unwrap();
        assert_eq!(pool.file_count(), 1);

        let a = pool.acquire(&lifecycle).unwrap();
        let b = pool.acquire(&lifecycle).unwrap();
        assert_eq!(pool.file_count(), 2);
        assert!(matches!(
            pool.acquire(&lifecycle),
            Err(Error::ReaderPoolExhausted(_))
        ));

        pool.release(a);
        let mut c = pool.acquire(&lifecycle).unwrap();
        let mut buf = [0u8; 4];
        c.seek(SeekFrom::Start(3)).unwrap();
        c.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"3456");

        pool.release(b);
        pool.release(c);
        assert_eq!(pool.file_count(), 2);
    }

    #[test]
    fn test_pool_prefers_cache() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"on-disk").unwrap();

        let lifecycle = Lifecycle::default();
        let pool = ReaderPool::new(&path, 1);
        pool.set_cache(Some(Bytes::from_static(b"in-memory")));

        let mut stream = pool.acquire(&lifecycle).unwrap();
        assert!(stream.is_memory());
        let mut text = String::new();
        stream.read_to_string(&mut text).unwrap();
        assert_eq!(text, "in-memory");
    }

    #[test]
    fn test_pool_fails_fast_when_destructing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"x").unwrap();

        let lifecycle = Lifecycle::default();
        let pool = ReaderPool::new(&path, 1);
        lifecycle.begin_destruct(false);
        assert!(matches!(
            pool.acquire(&lifecycle),
            Err(Error::FileBeingDeleted)
        ));
    }
}
