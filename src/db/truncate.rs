//! Truncation
//!
//! Cuts the log back to the position recorded in the truncate checkpoint.
//! Runs before any chunk is opened.

use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::checkpoint::CheckpointSet;
use crate::chunk::{ChunkHeader, FileNamingStrategy, FOOTER_SIZE, HEADER_SIZE};
use crate::config::DbConfig;
use crate::error::{Error, Result};

const ZERO_BLOCK: [u8; 64 * 1024] = [0u8; 64 * 1024];

/// Truncate the log to `truncate_position` (or to the start of a scavenged
/// chunk containing it) and rewind every checkpoint. Returns the position
/// the log was actually truncated to.
pub(crate) fn truncate_db(
    config: &DbConfig,
    checkpoints: &CheckpointSet,
    naming: &dyn FileNamingStrategy,
    truncate_position: i64,
) -> Result<i64> {
    let writer = checkpoints.writer.read();
    if truncate_position > writer {
        return Err(Error::CorruptDatabase(format!(
            "truncate checkpoint {} is ahead of the writer checkpoint {}",
            truncate_position, writer
        )));
    }

    let chunk_size = config.chunk_size as i64;
    let truncate_chunk = (truncate_position / chunk_size) as i32;
    tracing::warn!(
        "Truncating log from {} to {} (chunk #{})",
        writer,
        truncate_position,
        truncate_chunk
    );

    let containing = find_containing_chunk(naming, truncate_chunk)?;
    let mut effective = truncate_position;
    let mut first_deleted = truncate_chunk + 1;

    if let Some((path, header)) = &containing {
        if header.is_scavenged() {
            effective = header.chunk_start_position();
            first_deleted = header.chunk_start_number;
            tracing::info!(
                "Truncation position falls inside scavenged chunk {}, truncating to {}",
                path.display(),
                effective
            );
        } else {
            zero_tail(path, header, truncate_position)?;
        }
    }

    for path in naming.all_present_files()? {
        if let Some((index, _)) = naming.index_and_version(&path) {
            if index >= first_deleted {
                fs::remove_file(&path)?;
                tracing::info!("Deleted chunk file {} during truncation", path.display());
            }
        }
    }

    checkpoints.writer.reset(effective)?;
    if checkpoints.chaser.read() > effective {
        checkpoints.chaser.reset(effective)?;
    }
    if checkpoints.epoch.read() >= effective {
        checkpoints.epoch.reset(-1)?;
    }
    if checkpoints.replication.read() > effective {
        checkpoints.replication.reset(effective)?;
    }
    checkpoints.flush_all()?;
    checkpoints.truncate.reset(-1)?;

    tracing::info!("Truncated log to {}", effective);
    Ok(effective)
}

/// The current file whose chunk range contains `chunk_number`, found by
/// walking the newest versions from chunk 0
fn find_containing_chunk(
    naming: &dyn FileNamingStrategy,
    chunk_number: i32,
) -> Result<Option<(PathBuf, ChunkHeader)>> {
    let mut index = 0;
    while index <= chunk_number {
        let Some(path) = naming.all_versions_for(index)?.into_iter().next() else {
            return Ok(None);
        };
        let header = read_header(&path)?;
        if header.chunk_end_number >= chunk_number {
            return Ok(Some((path, header)));
        }
        index = header.chunk_end_number + 1;
    }
    Ok(None)
}

fn read_header(path: &Path) -> Result<ChunkHeader> {
    let mut file = File::open(path)?;
    ChunkHeader::read_from(&mut file).map_err(|e| Error::corrupt(path, e.to_string()))
}

/// Zero everything from a log position to the end of the file, footer
/// included, turning the chunk back into an unfinished one
fn zero_tail(path: &Path, header: &ChunkHeader, log_position: i64) -> Result<()> {
    let local = header.local_position(log_position);
    let start = HEADER_SIZE as u64 + local as u64;
    let end = (HEADER_SIZE + header.chunk_size as usize + FOOTER_SIZE) as u64;

    let mut file = OpenOptions::new().write(true).open(path)?;
    file.set_len(end)?;
    file.seek(SeekFrom::Start(start))?;

    let mut remaining = end - start;
    while remaining > 0 {
        let n = remaining.min(ZERO_BLOCK.len() as u64) as usize;
        file.write_all(&ZERO_BLOCK[..n])?;
        remaining -= n as u64;
    }
    file.sync_all()?;

    tracing::debug!(
        "Zeroed {} from local position {}",
        path.display(),
        local
    );
    Ok(())
}
