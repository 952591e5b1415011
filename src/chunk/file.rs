//! Chunk Files
//!
//! A `Chunk` wraps one physical chunk file. It is created writable, appended
//! to by a single writer, then completed (footer and checksum written) and
//! read-only from there on. Read-only chunks can be cached in memory and are
//! destroyed once disposed or marked for deletion and no reader holds them.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use sha2::{Digest, Sha256};

use super::footer::{ChunkFooter, PosMap, CHECKSUM_OFFSET, CHECKSUM_SIZE, FOOTER_SIZE, POS_MAP_SIZE};
use super::header::{ChunkHeader, HEADER_SIZE};
use super::lifecycle::{DestructAction, Lifecycle};
use super::read_side::{build_midpoints, Midpoint};
use super::work_item::{ReaderPool, ReaderStream};
use super::ChunkOptions;
use crate::error::{Error, Result};
use crate::record::{LogRecord, FRAME_OVERHEAD};

/// Buffer size used when hashing files
const HASH_BUFFER_SIZE: usize = 64 * 1024;

/// Outcome of an append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendResult {
    /// Record written between these data-region offsets
    Appended { old_position: i64, new_position: i64 },
    /// Record does not fit; nothing was written
    NotEnoughSpace { position: i64 },
}

struct WriterWorkItem {
    file: File,
    /// Next free offset in the data region
    position: i64,
    /// Reused framing buffer
    buffer: Vec<u8>,
}

/// One chunk file
pub struct Chunk {
    pub(super) path: PathBuf,
    pub(super) header: ChunkHeader,
    pub(super) footer: RwLock<Option<ChunkFooter>>,
    pub(super) physical_size: AtomicI64,
    pub(super) logical_size: AtomicI64,
    pub(super) pool: ReaderPool,
    pub(super) midpoints: RwLock<Option<Arc<[Midpoint]>>>,
    pub(super) lifecycle: Lifecycle,
    pub(super) options: ChunkOptions,
    writer: Mutex<Option<WriterWorkItem>>,
    read_only: AtomicBool,
}

/// A pooled reader handle holding a lock on its chunk
pub(crate) struct WorkItem<'a> {
    chunk: &'a Chunk,
    stream: ReaderStream,
}

impl WorkItem<'_> {
    pub(crate) fn stream(&mut self) -> &mut ReaderStream {
        &mut self.stream
    }
}

impl Drop for WorkItem<'_> {
    fn drop(&mut self) {
        let stream = std::mem::replace(
            &mut self.stream,
            ReaderStream::Memory(io::Cursor::new(Bytes::new())),
        );
        self.chunk.pool.release(stream);
        self.chunk.release_lock();
    }
}

impl Chunk {
    fn build(
        path: PathBuf,
        header: ChunkHeader,
        footer: Option<ChunkFooter>,
        physical_size: i64,
        logical_size: i64,
        writer: Option<WriterWorkItem>,
        options: ChunkOptions,
    ) -> Self {
        let read_only = writer.is_none();
        Self {
            pool: ReaderPool::new(&path, options.max_reader_count),
            path,
            header,
            footer: RwLock::new(footer),
            physical_size: AtomicI64::new(physical_size),
            logical_size: AtomicI64::new(logical_size),
            midpoints: RwLock::new(None),
            lifecycle: Lifecycle::default(),
            options,
            writer: Mutex::new(writer),
            read_only: AtomicBool::new(read_only),
        }
    }

    /// Create a new, empty, writable chunk file
    pub fn create_new(
        path: PathBuf,
        chunk_size: i32,
        chunk_start_number: i32,
        chunk_end_number: i32,
        scavenge_version: i32,
        options: ChunkOptions,
    ) -> Result<Arc<Self>> {
        let header = ChunkHeader::new(
            chunk_size,
            chunk_start_number,
            chunk_end_number,
            scavenge_version,
        )?;
        Self::create_with_header(path, header, options)
    }

    /// Create a writable chunk file with a prepared header
    pub fn create_with_header(
        path: PathBuf,
        header: ChunkHeader,
        options: ChunkOptions,
    ) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        file.write_all(&header.to_bytes())?;
        if !header.is_scavenged() {
            file.set_len((HEADER_SIZE + header.chunk_size as usize + FOOTER_SIZE) as u64)?;
        }
        file.sync_all()?;

        tracing::debug!(
            "Created chunk #{}-{} at {}",
            header.chunk_start_number,
            header.chunk_end_number,
            path.display()
        );

        let writer = WriterWorkItem {
            file,
            position: 0,
            buffer: Vec::new(),
        };
        Ok(Arc::new(Self::build(
            path,
            header,
            None,
            0,
            0,
            Some(writer),
            options,
        )))
    }

    /// Open a completed chunk file read-only
    pub fn open_completed(path: PathBuf, options: ChunkOptions, verify_hash: bool) -> Result<Arc<Self>> {
        let mut file = File::open(&path)?;
        let len = file.metadata()?.len();
        if len < (HEADER_SIZE + FOOTER_SIZE) as u64 {
            return Err(Error::corrupt(&path, format!("file too short: {} bytes", len)));
        }

        let header = ChunkHeader::read_from(&mut file).map_err(|e| Error::corrupt(&path, e.to_string()))?;
        let footer = ChunkFooter::read_from(&mut file)
            .map_err(|e| Error::corrupt(&path, e.to_string()))?
            .filter(|footer| footer.is_completed)
            .ok_or_else(|| Error::corrupt(&path, "chunk is not completed"))?;

        let expected = expected_file_size(&header, &footer);
        if len != expected {
            return Err(Error::corrupt(
                &path,
                format!("file size {} does not match expected {}", len, expected),
            ));
        }
        if !header.is_scavenged() && footer.map_size != 0 {
            return Err(Error::corrupt(&path, "unscavenged chunk carries a position map"));
        }
        if footer.physical_data_size as i64 > data_capacity(&header) {
            return Err(Error::corrupt(&path, "physical data size exceeds chunk capacity"));
        }
        drop(file);

        let physical = footer.physical_data_size as i64;
        let logical = footer.logical_data_size;
        let chunk = Arc::new(Self::build(
            path,
            header,
            Some(footer),
            physical,
            logical,
            None,
            options,
        ));

        chunk.pool.prime(options.initial_reader_count)?;
        if verify_hash {
            chunk.verify_file_hash()?;
        }
        if chunk.header.is_scavenged() {
            chunk.rebuild_midpoints()?;
        }

        tracing::debug!(
            "Opened completed chunk #{}-{} ({} bytes)",
            chunk.header.chunk_start_number,
            chunk.header.chunk_end_number,
            physical
        );
        Ok(chunk)
    }

    /// Open an unfinished chunk for appending at `write_position`
    pub fn open_ongoing(path: PathBuf, write_position: i64, options: ChunkOptions) -> Result<Arc<Self>> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;
        let header = ChunkHeader::read_from(&mut file).map_err(|e| Error::corrupt(&path, e.to_string()))?;

        if header.is_scavenged() {
            return Err(Error::corrupt(&path, "scavenged chunk cannot be written to"));
        }

        let len = file.metadata()?.len();
        let expected = (HEADER_SIZE + header.chunk_size as usize + FOOTER_SIZE) as u64;
        if len != expected {
            return Err(Error::corrupt(
                &path,
                format!("file size {} does not match expected {}", len, expected),
            ));
        }

        let footer = ChunkFooter::read_from(&mut file).map_err(|e| Error::corrupt(&path, e.to_string()))?;
        if footer.map_or(false, |f| f.is_completed) {
            return Err(Error::corrupt(&path, "chunk is already completed"));
        }

        if write_position < 0 || write_position > header.chunk_size as i64 {
            return Err(Error::corrupt(
                &path,
                format!("write position {} outside of data region", write_position),
            ));
        }

        tracing::debug!(
            "Opened ongoing chunk #{} at local position {}",
            header.chunk_start_number,
            write_position
        );

        let writer = WriterWorkItem {
            file,
            position: write_position,
            buffer: Vec::new(),
        };
        Ok(Arc::new(Self::build(
            path,
            header,
            None,
            write_position,
            write_position,
            Some(writer),
            options,
        )))
    }

    /// Append a record. Fails without writing anything if the framed record
    /// does not fit before the end of the data region.
    pub fn try_append(&self, record: &LogRecord) -> Result<AppendResult> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("chunk {} is read-only", self)))?;

        writer.buffer.clear();
        let framed = record.encode_framed(&mut writer.buffer)? as i64;

        let old_position = writer.position;
        if old_position + framed > self.data_capacity() {
            return Ok(AppendResult::NotEnoughSpace {
                position: old_position,
            });
        }

        writer
            .file
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + old_position as u64))?;
        writer.file.write_all(&writer.buffer)?;

        let new_position = old_position + framed;
        writer.position = new_position;
        self.physical_size.store(new_position, Ordering::Release);
        if self.header.is_scavenged() {
            let logical_end = self.header.local_position(record.log_position()) + framed;
            self.logical_size.fetch_max(logical_end, Ordering::AcqRel);
        } else {
            self.logical_size.store(new_position, Ordering::Release);
        }

        Ok(AppendResult::Appended {
            old_position,
            new_position,
        })
    }

    /// Force appended data to stable storage
    pub fn flush(&self) -> Result<()> {
        if let Some(writer) = self.writer.lock().as_mut() {
            writer.file.sync_data()?;
        }
        Ok(())
    }

    /// Write the footer of a chunk filled by the writer and make it read-only
    pub fn complete(&self) -> Result<()> {
        if self.header.is_scavenged() {
            return Err(Error::InvalidOperation(
                "scavenged chunks are completed with a position map".into(),
            ));
        }

        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("chunk {} is already completed", self)))?;

        let physical = writer.position;
        let mut footer = ChunkFooter::new(physical as i32, physical, 0, [0u8; CHECKSUM_SIZE]);
        footer.checksum = hash_chunk(
            &mut writer.file,
            HEADER_SIZE as u64 + physical as u64,
            &footer,
        )?;

        writer.file.seek(SeekFrom::Start(
            (HEADER_SIZE + self.header.chunk_size as usize) as u64,
        ))?;
        writer.file.write_all(&footer.to_bytes())?;
        writer.file.sync_all()?;

        *guard = None;
        *self.footer.write() = Some(footer);
        self.read_only.store(true, Ordering::Release);

        tracing::info!(
            "Completed chunk #{} ({} bytes of data)",
            self.header.chunk_start_number,
            physical
        );
        Ok(())
    }

    /// Write the position map and footer of a scavenged chunk, truncate the
    /// file to its exact size and make it read-only
    pub fn complete_scavenge(&self, pos_map: &[PosMap]) -> Result<()> {
        if !self.header.is_scavenged() {
            return Err(Error::InvalidOperation(
                "only scavenged chunks carry a position map".into(),
            ));
        }
        if pos_map.windows(2).any(|w| w[0].log_pos >= w[1].log_pos) {
            return Err(Error::InvalidArgument(
                "position map must be strictly increasing".into(),
            ));
        }

        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or_else(|| Error::InvalidOperation(format!("chunk {} is already completed", self)))?;

        let physical = writer.position;
        let map_size = i32::try_from(pos_map.len() * POS_MAP_SIZE)
            .map_err(|_| Error::InvalidArgument("position map too large".into()))?;

        let mut map_bytes = Vec::with_capacity(map_size as usize);
        for entry in pos_map {
            map_bytes.extend_from_slice(&entry.to_bytes());
        }
        writer
            .file
            .seek(SeekFrom::Start(HEADER_SIZE as u64 + physical as u64))?;
        writer.file.write_all(&map_bytes)?;

        let logical = self.logical_size.load(Ordering::Acquire);
        let mut footer = ChunkFooter::new(physical as i32, logical, map_size, [0u8; CHECKSUM_SIZE]);
        let data_and_map = HEADER_SIZE as u64 + physical as u64 + map_size as u64;
        footer.checksum = hash_chunk(&mut writer.file, data_and_map, &footer)?;

        writer.file.seek(SeekFrom::Start(data_and_map))?;
        writer.file.write_all(&footer.to_bytes())?;
        writer.file.set_len(data_and_map + FOOTER_SIZE as u64)?;
        writer.file.sync_all()?;

        *guard = None;
        *self.footer.write() = Some(footer);
        self.read_only.store(true, Ordering::Release);

        let midpoints = build_midpoints(pos_map.len(), self.options.midpoints_depth, |i| {
            Ok(pos_map[i])
        })?;
        *self.midpoints.write() = Some(midpoints.into());

        tracing::debug!(
            "Completed scavenged chunk #{}-{}: {} records, {} bytes",
            self.header.chunk_start_number,
            self.header.chunk_end_number,
            pos_map.len(),
            physical
        );
        Ok(())
    }

    /// Verify the stored checksum against the file contents
    pub fn verify_file_hash(&self) -> Result<()> {
        let footer = self
            .footer()
            .ok_or_else(|| Error::InvalidOperation(format!("chunk {} is not completed", self)))?;

        let file = File::open(&self.path)?;
        // SAFETY: completed chunk files are never written in place; they are
        // only replaced by renaming a new version over a different name.
        let mmap = unsafe { memmap2::Mmap::map(&file)? };

        let expected = expected_file_size(&self.header, &footer);
        if mmap.len() as u64 != expected {
            return Err(Error::corrupt(
                &self.path,
                format!("file size {} does not match expected {}", mmap.len(), expected),
            ));
        }

        let data_and_map =
            HEADER_SIZE + footer.physical_data_size as usize + footer.map_size as usize;
        let footer_start = mmap.len() - FOOTER_SIZE;

        let mut hasher = Sha256::new();
        hasher.update(&mmap[..data_and_map]);
        hasher.update(&mmap[footer_start..footer_start + CHECKSUM_OFFSET]);
        let checksum: [u8; CHECKSUM_SIZE] = hasher.finalize().into();

        if checksum != footer.checksum {
            return Err(Error::HashValidation {
                path: self.path.clone(),
            });
        }
        Ok(())
    }

    /// Load a read-only chunk into memory. Returns false if nothing changed.
    pub fn cache_in_memory(&self) -> Result<bool> {
        if !self.is_read_only() || self.pool.is_cached() {
            return Ok(false);
        }
        let footer = match self.footer() {
            Some(footer) => footer,
            None => return Ok(false),
        };

        self.lifecycle.try_lock()?;
        let loaded = (|| -> Result<Bytes> {
            let len = HEADER_SIZE + footer.physical_data_size as usize + footer.map_size as usize;
            let mut buffer = BytesMut::zeroed(len);
            let mut file = File::open(&self.path)?;
            file.read_exact(&mut buffer)?;
            Ok(buffer.freeze())
        })();

        let cached = loaded.map(|buffer| {
            self.pool.set_cache(Some(buffer));
            *self.midpoints.write() = None;
        });
        self.release_lock();
        cached?;

        tracing::debug!("Cached chunk #{} in memory", self.header.chunk_start_number);
        Ok(true)
    }

    /// Drop the in-memory copy. Returns false if the chunk was not cached.
    pub fn uncache_from_memory(&self) -> Result<bool> {
        if !self.pool.is_cached() {
            return Ok(false);
        }

        self.pool.set_cache(None);
        if self.header.is_scavenged() && !self.lifecycle.is_destructing() {
            self.rebuild_midpoints()?;
        }

        tracing::debug!("Uncached chunk #{} from memory", self.header.chunk_start_number);
        Ok(true)
    }

    /// Stop serving readers and delete the file once the last one is gone
    pub fn mark_for_deletion(&self) {
        match self.lifecycle.begin_destruct(true) {
            DestructAction::Destroy => self.destroy(),
            DestructAction::DeleteOnly => self.delete_file(),
            DestructAction::Deferred => tracing::debug!(
                "Chunk {} marked for deletion with {} readers outstanding",
                self,
                self.lifecycle.lock_count()
            ),
        }
    }

    /// Stop serving readers and close the file once the last one is gone
    pub fn dispose(&self) {
        if self.lifecycle.begin_destruct(false) == DestructAction::Destroy {
            self.destroy();
        }
    }

    /// Wait until every handle is closed, returning false on timeout
    pub fn wait_for_destroy(&self, timeout: Duration) -> bool {
        self.lifecycle.wait_for_destroy(timeout)
    }

    pub(crate) fn acquire_work_item(&self) -> Result<WorkItem<'_>> {
        self.lifecycle.try_lock()?;
        match self.pool.acquire(&self.lifecycle) {
            Ok(stream) => Ok(WorkItem {
                chunk: self,
                stream,
            }),
            Err(e) => {
                self.release_lock();
                Err(e)
            }
        }
    }

    pub(crate) fn try_lock(&self) -> Result<()> {
        self.lifecycle.try_lock()
    }

    pub(crate) fn release_lock(&self) {
        if self.lifecycle.unlock() {
            self.destroy();
        }
    }

    fn destroy(&self) {
        self.pool.close();
        *self.writer.lock() = None;
        *self.midpoints.write() = None;
        let delete = self.lifecycle.is_marked_for_deletion();
        if delete {
            self.delete_file();
        }
        if self.lifecycle.finish_destroy(delete) {
            // Marked for deletion while the handles were closing
            self.delete_file();
        }
    }

    fn delete_file(&self) {
        match fs::remove_file(&self.path) {
            Ok(()) => tracing::info!("Deleted chunk file {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Failed to delete chunk file {}: {}", self.path.display(), e),
        }
    }

    /// Bytes available for framed records
    pub fn data_capacity(&self) -> i64 {
        data_capacity(&self.header)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &ChunkHeader {
        &self.header
    }

    pub fn footer(&self) -> Option<ChunkFooter> {
        self.footer.read().clone()
    }

    pub fn chunk_start_number(&self) -> i32 {
        self.header.chunk_start_number
    }

    pub fn chunk_end_number(&self) -> i32 {
        self.header.chunk_end_number
    }

    pub fn chunk_start_position(&self) -> i64 {
        self.header.chunk_start_position()
    }

    pub fn chunk_end_position(&self) -> i64 {
        self.header.chunk_end_position()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    pub fn is_cached(&self) -> bool {
        self.pool.is_cached()
    }

    pub fn is_marked_for_deletion(&self) -> bool {
        self.lifecycle.is_marked_for_deletion()
    }

    /// Number of outstanding reader locks
    pub fn lock_count(&self) -> u32 {
        self.lifecycle.lock_count()
    }

    pub fn physical_data_size(&self) -> i64 {
        self.physical_size.load(Ordering::Acquire)
    }

    pub fn logical_data_size(&self) -> i64 {
        self.logical_size.load(Ordering::Acquire)
    }

    /// Size of the file on disk
    pub fn file_size(&self) -> u64 {
        match self.footer() {
            Some(footer) => expected_file_size(&self.header, &footer),
            None if self.header.is_scavenged() => {
                HEADER_SIZE as u64 + self.physical_data_size() as u64
            }
            None => (HEADER_SIZE + self.header.chunk_size as usize + FOOTER_SIZE) as u64,
        }
    }

    /// Number of position map entries
    pub fn map_count(&self) -> usize {
        self.footer().map_or(0, |f| f.map_count())
    }
}

impl std::fmt::Display for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "#{}-{} ({})",
            self.header.chunk_start_number,
            self.header.chunk_end_number,
            self.path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("?")
        )
    }
}

fn data_capacity(header: &ChunkHeader) -> i64 {
    if header.is_scavenged() {
        (header.chunk_size as i64 * header.chunk_span()).min(i32::MAX as i64)
    } else {
        header.chunk_size as i64
    }
}

pub(crate) fn expected_file_size(header: &ChunkHeader, footer: &ChunkFooter) -> u64 {
    if header.is_scavenged() {
        (HEADER_SIZE + footer.physical_data_size as usize + footer.map_size as usize + FOOTER_SIZE)
            as u64
    } else {
        (HEADER_SIZE + header.chunk_size as usize + FOOTER_SIZE) as u64
    }
}

/// Hash `[0, data_end)` of the file followed by the footer minus its checksum
fn hash_chunk(file: &mut File, data_end: u64, footer: &ChunkFooter) -> Result<[u8; CHECKSUM_SIZE]> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];
    let mut remaining = data_end;

    file.seek(SeekFrom::Start(0))?;
    while remaining > 0 {
        let n = remaining.min(HASH_BUFFER_SIZE as u64) as usize;
        file.read_exact(&mut buffer[..n])?;
        hasher.update(&buffer[..n]);
        remaining -= n as u64;
    }
    hasher.update(&footer.to_bytes()[..CHECKSUM_OFFSET]);

    Ok(hasher.finalize().into())
}

/// Offset after the last intact record of an unfinished chunk file
pub(crate) fn scan_data_end(path: &Path) -> Result<i64> {
    let mut file = File::open(path)?;
    let header = ChunkHeader::read_from(&mut file).map_err(|e| Error::corrupt(path, e.to_string()))?;
    let capacity = header.chunk_size as i64;
    let mut position = 0i64;
    let mut len_bytes = [0u8; 4];

    loop {
        if position + FRAME_OVERHEAD as i64 > capacity {
            break;
        }
        file.seek(SeekFrom::Start(HEADER_SIZE as u64 + position as u64))?;
        file.read_exact(&mut len_bytes)?;
        let len = i32::from_le_bytes(len_bytes) as i64;
        if len <= 0 || position + len + FRAME_OVERHEAD as i64 > capacity {
            break;
        }

        let mut body = vec![0u8; len as usize];
        file.read_exact(&mut body)?;
        file.read_exact(&mut len_bytes)?;
        if i32::from_le_bytes(len_bytes) as i64 != len || LogRecord::decode(&body).is_err() {
            break;
        }
        position += len + FRAME_OVERHEAD as i64;
    }

    Ok(position)
}
