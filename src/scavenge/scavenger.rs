//! Chunk Scavenger
//!
//! Scavenging runs in two phases over the completed chunks the chaser has
//! already passed:
//!
//! 1. Every chunk is rewritten into a temporary scavenged chunk holding only
//!    the records that must survive. The rewrite replaces the original only
//!    if it is smaller.
//! 2. Adjacent chunks are merged into larger scavenged chunks, as long as
//!    their combined data fits the configured budget. Merging repeats until
//!    no group of two or more chunks fits.
//!
//! A failure in one chunk range aborts that range only.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{
    meta_stream_of, original_stream_of, Crc32StreamHasher, LastEventNumber, ScavengeLog,
    ScavengeOptions, ScavengeReport, ScavengeResult, StreamHasher, StreamIndex,
    StreamMetadataLookup, TracingScavengeLog,
};
use crate::checkpoint::Checkpoint;
use crate::chunk::{AppendResult, Chunk, PosMap, FOOTER_SIZE, HEADER_SIZE, POS_MAP_SIZE};
use crate::db::{ChunkDb, ChunkManager};
use crate::error::{Error, Result};
use crate::record::{CommitLogRecord, LogRecord, PrepareFlags, PrepareLogRecord};

/// Keep decision shared by a commit and the prepares of its transaction
#[derive(Debug, Clone, Copy)]
struct CommitInfo {
    first_event_number: i64,
    keep: Option<bool>,
}

impl CommitInfo {
    fn new(first_event_number: i64) -> Self {
        Self {
            first_event_number,
            keep: None,
        }
    }

    fn force_keep(&mut self) {
        self.keep = Some(true);
    }

    fn try_not_to_keep(&mut self) {
        self.keep = self.keep.or(Some(false));
    }

    /// Dropped only once a prepare confirmed it droppable and none forced it
    fn should_keep(&self) -> bool {
        self.keep != Some(false)
    }
}

/// Commits keyed by transaction position
type CommitMap = HashMap<i64, CommitInfo>;

enum RangeOutcome {
    Switched { space_saved: i64 },
    Discarded { old_size: i64, new_size: i64 },
}

#[derive(Default)]
struct PassState {
    space_saved: i64,
    chunks_scavenged: usize,
    chunks_merged: usize,
    error: Option<String>,
}

impl PassState {
    fn record_error(&mut self, error: &Error) {
        if self.error.is_none() {
            self.error = Some(error.to_string());
        }
    }
}

/// Scavenges the completed chunks of a database
#[derive(Clone)]
pub struct Scavenger {
    manager: Arc<ChunkManager>,
    chaser: Arc<dyn Checkpoint>,
    metadata: Arc<dyn StreamMetadataLookup>,
    index: Arc<dyn StreamIndex>,
    hasher: Arc<dyn StreamHasher>,
    log: Arc<dyn ScavengeLog>,
    options: ScavengeOptions,
}

impl Scavenger {
    pub fn new(
        db: &ChunkDb,
        metadata: Arc<dyn StreamMetadataLookup>,
        index: Arc<dyn StreamIndex>,
        options: ScavengeOptions,
    ) -> Self {
        Self {
            manager: Arc::clone(db.manager()),
            chaser: Arc::clone(&db.checkpoints().chaser),
            metadata,
            index,
            hasher: Arc::new(Crc32StreamHasher),
            log: Arc::new(TracingScavengeLog),
            options,
        }
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn StreamHasher>) -> Self {
        self.hasher = hasher;
        self
    }

    pub fn with_log(mut self, log: Arc<dyn ScavengeLog>) -> Self {
        self.log = log;
        self
    }

    pub fn options(&self) -> &ScavengeOptions {
        &self.options
    }

    /// Run a scavenge on the blocking thread pool
    pub async fn scavenge(&self, cancel: CancellationToken) -> ScavengeReport {
        self.scavenge_as(Uuid::new_v4(), cancel).await
    }

    /// Run a scavenge under a caller-chosen id
    pub async fn scavenge_as(&self, scavenge_id: Uuid, cancel: CancellationToken) -> ScavengeReport {
        let this = self.clone();
        let started = Instant::now();
        let task = tokio::task::spawn_blocking(move || this.scavenge_blocking(scavenge_id, &cancel));
        match task.await {
            Ok(report) => report,
            Err(e) => {
                let report = ScavengeReport {
                    scavenge_id,
                    result: ScavengeResult::Errored,
                    error: Some(format!("scavenge task failed: {}", e)),
                    space_saved: 0,
                    chunks_scavenged: 0,
                    chunks_merged: 0,
                    elapsed: started.elapsed(),
                };
                self.log.scavenge_completed(&report);
                report
            }
        }
    }

    /// Run a scavenge on the current thread
    pub fn scavenge_blocking(&self, scavenge_id: Uuid, cancel: &CancellationToken) -> ScavengeReport {
        let started = Instant::now();
        self.log.scavenge_started(scavenge_id);

        let mut state = PassState::default();
        let outcome = self.run(cancel, &mut state);

        let result = match outcome {
            Ok(()) if state.error.is_none() => ScavengeResult::Success,
            Ok(()) => ScavengeResult::Errored,
            Err(Error::Cancelled) => ScavengeResult::Stopped,
            Err(e) => {
                state.record_error(&e);
                ScavengeResult::Errored
            }
        };

        let report = ScavengeReport {
            scavenge_id,
            result,
            error: state.error,
            space_saved: state.space_saved,
            chunks_scavenged: state.chunks_scavenged,
            chunks_merged: state.chunks_merged,
            elapsed: started.elapsed(),
        };
        self.log.scavenge_completed(&report);
        report
    }

    fn run(&self, cancel: &CancellationToken, state: &mut PassState) -> Result<()> {
        check_cancelled(cancel)?;
        self.scavenge_chunks(cancel, state)?;
        if self.options.merge_chunks {
            self.merge_chunks(cancel, state)?;
        }
        Ok(())
    }

    /// Completed chunks wholly below the chaser checkpoint, in log order
    fn scavengeable_chunks(&self) -> Vec<Arc<Chunk>> {
        let chaser = self.chaser.read();
        self.manager
            .all_chunks()
            .into_iter()
            .take_while(|chunk| chunk.is_read_only() && chunk.chunk_end_position() <= chaser)
            .collect()
    }

    fn scavenge_chunks(&self, cancel: &CancellationToken, state: &mut PassState) -> Result<()> {
        for chunk in self.scavengeable_chunks() {
            check_cancelled(cancel)?;
            let started = Instant::now();
            let start = chunk.chunk_start_number();
            let end = chunk.chunk_end_number();

            match self.scavenge_range(std::slice::from_ref(&chunk), true, cancel) {
                Ok(RangeOutcome::Switched { space_saved }) => {
                    state.space_saved += space_saved;
                    state.chunks_scavenged += 1;
                    self.log
                        .chunks_scavenged(start, end, started.elapsed(), space_saved);
                }
                Ok(RangeOutcome::Discarded { old_size, new_size }) => {
                    self.log.chunks_not_scavenged(
                        start,
                        end,
                        started.elapsed(),
                        &format!(
                            "scavenged chunk is not smaller ({} >= {} bytes)",
                            new_size, old_size
                        ),
                    );
                }
                Err(Error::Cancelled) => return Err(Error::Cancelled),
                Err(Error::FileBeingDeleted) => {
                    self.log.chunks_not_scavenged(
                        start,
                        end,
                        started.elapsed(),
                        "chunk was replaced while scavenging",
                    );
                }
                Err(e) => {
                    self.log
                        .chunks_not_scavenged(start, end, started.elapsed(), &e.to_string());
                    state.record_error(&e);
                }
            }
        }
        Ok(())
    }

    fn merge_chunks(&self, cancel: &CancellationToken, state: &mut PassState) -> Result<()> {
        loop {
            check_cancelled(cancel)?;
            let mut merged_any = false;
            let mut group: Vec<Arc<Chunk>> = Vec::new();
            let mut group_size = 0i64;

            for chunk in self.scavengeable_chunks() {
                let size = chunk.physical_data_size() + (chunk.map_count() * POS_MAP_SIZE) as i64;
                if !group.is_empty() && group_size + size > self.options.max_chunk_data_size {
                    merged_any |= self.merge_group(&group, cancel, state)?;
                    group.clear();
                    group_size = 0;
                }
                group.push(chunk);
                group_size += size;
            }
            if !group.is_empty() {
                merged_any |= self.merge_group(&group, cancel, state)?;
            }

            if !merged_any {
                return Ok(());
            }
        }
    }

    fn merge_group(
        &self,
        group: &[Arc<Chunk>],
        cancel: &CancellationToken,
        state: &mut PassState,
    ) -> Result<bool> {
        if group.len() < 2 {
            return Ok(false);
        }
        let started = Instant::now();
        let start = group[0].chunk_start_number();
        let end = group[group.len() - 1].chunk_end_number();

        match self.scavenge_range(group, false, cancel) {
            Ok(RangeOutcome::Switched { space_saved }) => {
                state.space_saved += space_saved;
                state.chunks_merged += 1;
                self.log
                    .chunks_merged(start, end, started.elapsed(), space_saved);
                Ok(true)
            }
            Ok(RangeOutcome::Discarded { old_size, new_size }) => {
                self.log.chunks_not_merged(
                    start,
                    end,
                    started.elapsed(),
                    &format!(
                        "merged chunk is not smaller ({} >= {} bytes)",
                        new_size, old_size
                    ),
                );
                Ok(false)
            }
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(Error::FileBeingDeleted) => {
                self.log.chunks_not_merged(
                    start,
                    end,
                    started.elapsed(),
                    "chunk was replaced while merging",
                );
                Ok(false)
            }
            Err(e) => {
                self.log
                    .chunks_not_merged(start, end, started.elapsed(), &e.to_string());
                state.record_error(&e);
                Ok(false)
            }
        }
    }

    /// Rewrite a contiguous run of chunks into one scavenged chunk and swap
    /// it in if it is smaller. Without `filter` every record is copied.
    fn scavenge_range(
        &self,
        old_chunks: &[Arc<Chunk>],
        filter: bool,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome> {
        let (first, last) = match (old_chunks.first(), old_chunks.last()) {
            (Some(first), Some(last)) => (first, last),
            _ => return Err(Error::InvalidArgument("empty chunk range".into())),
        };
        let scavenge_version = old_chunks
            .iter()
            .map(|chunk| chunk.header().scavenge_version)
            .max()
            .unwrap_or(0)
            + 1;

        let temp = self.manager.create_temp_chunk(
            first.chunk_start_number(),
            last.chunk_end_number(),
            scavenge_version,
        )?;

        let outcome = self.fill_and_switch(old_chunks, &temp, filter, cancel);
        match &outcome {
            Ok(RangeOutcome::Switched { .. }) => {}
            _ => temp.mark_for_deletion(),
        }
        outcome
    }

    fn fill_and_switch(
        &self,
        old_chunks: &[Arc<Chunk>],
        temp: &Arc<Chunk>,
        filter: bool,
        cancel: &CancellationToken,
    ) -> Result<RangeOutcome> {
        let range_start = temp.chunk_start_position();
        let range_end = temp.chunk_end_position();

        let mut commits = if filter {
            self.collect_commits(old_chunks, range_start, cancel)?
        } else {
            CommitMap::new()
        };

        let mut pos_map = Vec::new();
        for old in old_chunks {
            let mut local = 0i64;
            loop {
                check_cancelled(cancel)?;
                let read = match old.try_read_closest_forward(local)? {
                    Some(read) => read,
                    None => break,
                };
                local = read.next_position;

                let keep = !filter
                    || self.should_keep(&read.record, &mut commits, range_start, range_end);
                if !keep {
                    continue;
                }

                let log_pos = read.record.log_position() - range_start;
                match temp.try_append(&read.record)? {
                    AppendResult::Appended { old_position, .. } => {
                        pos_map.push(PosMap::new(log_pos, old_position as i32));
                    }
                    AppendResult::NotEnoughSpace { position } => {
                        return Err(Error::InvariantViolation(format!(
                            "scavenged data of {} exceeds its capacity at {}",
                            temp, position
                        )));
                    }
                }
            }
        }

        temp.complete_scavenge(&pos_map)?;

        let old_size: i64 = old_chunks.iter().map(|chunk| stored_size(chunk)).sum();
        let new_size = stored_size(temp);
        if !self.options.always_keep_scavenged && old_size <= new_size {
            return Ok(RangeOutcome::Discarded { old_size, new_size });
        }

        self.manager.switch_chunk(Arc::clone(temp), false)?;
        Ok(RangeOutcome::Switched {
            space_saved: old_size - new_size,
        })
    }

    /// First pass: every commit whose transaction starts inside the range
    fn collect_commits(
        &self,
        old_chunks: &[Arc<Chunk>],
        range_start: i64,
        cancel: &CancellationToken,
    ) -> Result<CommitMap> {
        let mut commits = CommitMap::new();
        for chunk in old_chunks {
            let mut local = 0i64;
            loop {
                check_cancelled(cancel)?;
                let read = match chunk.try_read_closest_forward(local)? {
                    Some(read) => read,
                    None => break,
                };
                local = read.next_position;

                if let LogRecord::Commit(commit) = &read.record {
                    if commit.transaction_position >= range_start {
                        commits.insert(
                            commit.transaction_position,
                            CommitInfo::new(commit.first_event_number),
                        );
                    }
                }
            }
        }
        Ok(commits)
    }

    fn should_keep(
        &self,
        record: &LogRecord,
        commits: &mut CommitMap,
        range_start: i64,
        range_end: i64,
    ) -> bool {
        match record {
            LogRecord::Prepare(prepare) => {
                self.should_keep_prepare(prepare, commits, range_start, range_end)
            }
            LogRecord::Commit(commit) => should_keep_commit(commit, commits),
            LogRecord::System(_) => true,
        }
    }

    fn should_keep_prepare(
        &self,
        prepare: &PrepareLogRecord,
        commits: &mut CommitMap,
        range_start: i64,
        range_end: i64,
    ) -> bool {
        let mut commit = commits.get_mut(&prepare.transaction_position);

        if prepare.flags.contains(PrepareFlags::STREAM_DELETE) {
            if let Some(commit) = commit.as_deref_mut() {
                commit.force_keep();
            }
            return true;
        }

        let is_committed = commit.is_some() || prepare.is_committed_inline();
        if !is_committed && prepare.flags.contains(PrepareFlags::TRANSACTION_BEGIN) {
            return true;
        }

        let last_event_number = self.metadata.last_event_number(&prepare.event_stream_id);
        if last_event_number == LastEventNumber::Deleted {
            if let Some(commit) = commit.as_deref_mut() {
                commit.try_not_to_keep();
            }
            return false;
        }

        if !is_committed {
            return true;
        }

        if !prepare.flags.contains(PrepareFlags::DATA) {
            if let Some(commit) = commit.as_deref_mut() {
                commit.try_not_to_keep();
            }
            return false;
        }

        if self.is_soft_deleted_temp_stream_within(&prepare.event_stream_id, range_start, range_end)
        {
            if let Some(commit) = commit.as_deref_mut() {
                commit.try_not_to_keep();
            }
            return false;
        }

        let event_number = if prepare.is_committed_inline() {
            prepare.expected_version + 1
        } else {
            match commit.as_deref() {
                Some(commit) => commit.first_event_number + prepare.transaction_offset as i64,
                None => return true,
            }
        };

        // The index resolves this event to another record
        if let Some(position) = self.index.event_position(&prepare.event_stream_id, event_number) {
            if position != prepare.log_position {
                if let Some(commit) = commit.as_deref_mut() {
                    commit.try_not_to_keep();
                }
                return false;
            }
        }

        let last = match last_event_number {
            LastEventNumber::Last(last) if event_number < last => last,
            _ => {
                if let Some(commit) = commit.as_deref_mut() {
                    commit.force_keep();
                }
                return true;
            }
        };

        let meta = self.metadata.metadata(&prepare.event_stream_id);
        let expired_by_count = meta
            .max_count
            .map_or(false, |max_count| event_number < last - max_count + 1);
        let truncated = meta
            .truncate_before
            .map_or(false, |truncate_before| event_number < truncate_before);
        let expired_by_age = meta.max_age.map_or(false, |max_age| is_older_than(prepare, max_age));

        if expired_by_count || truncated || expired_by_age {
            if let Some(commit) = commit.as_deref_mut() {
                commit.try_not_to_keep();
            }
            false
        } else {
            if let Some(commit) = commit.as_deref_mut() {
                commit.force_keep();
            }
            true
        }
    }

    /// A soft-deleted temp stream whose events and metadata events all lie
    /// in the range can go as a whole
    fn is_soft_deleted_temp_stream_within(
        &self,
        stream_id: &str,
        range_start: i64,
        range_end: i64,
    ) -> bool {
        let (stream, meta_stream) = match original_stream_of(stream_id) {
            Some(original) => (original.to_string(), stream_id.to_string()),
            None => (stream_id.to_string(), meta_stream_of(stream_id)),
        };

        let meta = self.metadata.metadata(&stream);
        if !meta.temp_stream || !meta.is_soft_deleted() {
            return false;
        }

        let within = |position: Option<i64>| {
            position.map_or(false, |p| p >= range_start && p < range_end)
        };
        [stream.as_str(), meta_stream.as_str()].iter().all(|id| {
            let hash = self.hasher.hash(id);
            within(self.index.oldest_position(hash)) && within(self.index.latest_position(hash))
        })
    }
}

fn should_keep_commit(commit: &CommitLogRecord, commits: &CommitMap) -> bool {
    commits
        .get(&commit.transaction_position)
        .map_or(true, CommitInfo::should_keep)
}

fn is_older_than(prepare: &PrepareLogRecord, max_age: Duration) -> bool {
    match chrono::Duration::from_std(max_age) {
        Ok(max_age) => match chrono::Utc::now().checked_sub_signed(max_age) {
            Some(cutoff) => prepare.timestamp < cutoff,
            None => false,
        },
        Err(_) => false,
    }
}

/// Bytes a chunk occupies on disk, excluding unused preallocated space
fn stored_size(chunk: &Chunk) -> i64 {
    chunk.physical_data_size()
        + (chunk.map_count() * POS_MAP_SIZE) as i64
        + HEADER_SIZE as i64
        + FOOTER_SIZE as i64
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(Error::Cancelled)
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scavenge::StreamMetadata;
    use crate::test_support::{
        commit, event, open_db, prepare, tx_prepare, MemoryMetadata, RecordingScavengeLog,
        ScavengeEvent,
    };
    use crate::txlog::{ChunkReader, ChunkWriter};
    use tempfile::tempdir;

    fn options(merge_chunks: bool) -> ScavengeOptions {
        ScavengeOptions {
            always_keep_scavenged: false,
            merge_chunks,
            max_chunk_data_size: 64 * 1024,
        }
    }

    fn scavenger(db: &ChunkDb, metadata: &Arc<MemoryMetadata>, merge_chunks: bool) -> Scavenger {
        Scavenger::new(
            db,
            Arc::clone(metadata) as Arc<dyn StreamMetadataLookup>,
            Arc::clone(metadata) as Arc<dyn StreamIndex>,
            options(merge_chunks),
        )
    }

    /// Write records, close the chunk and let the chaser pass it
    fn write_and_complete(db: &ChunkDb, records: Vec<LogRecord>) -> Vec<i64> {
        let mut writer = ChunkWriter::open(db).unwrap();
        let mut positions = Vec::new();
        for mut record in records {
            record.relocate(writer.position()).unwrap();
            positions.push(writer.write(&mut record).unwrap().log_position);
        }
        writer.complete_chunk().unwrap();
        db.checkpoints().chaser.write(writer.position()).unwrap();
        positions
    }

    fn soft_deleted_tmp() -> Arc<MemoryMetadata> {
        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("tmp", LastEventNumber::Last(1));
        metadata.set_metadata(
            "tmp",
            StreamMetadata {
                truncate_before: Some(i64::MAX),
                temp_stream: true,
                ..Default::default()
            },
        );
        metadata
    }

    /// Marks a chunk for deletion the first time the scavenger asks about a
    /// stream
    struct DeletingLookup {
        inner: Arc<MemoryMetadata>,
        chunk: parking_lot::Mutex<Option<Arc<Chunk>>>,
    }

    impl StreamMetadataLookup for DeletingLookup {
        fn last_event_number(&self, stream_id: &str) -> LastEventNumber {
            if let Some(chunk) = self.chunk.lock().take() {
                chunk.mark_for_deletion();
            }
            self.inner.last_event_number(stream_id)
        }

        fn metadata(&self, stream_id: &str) -> StreamMetadata {
            self.inner.metadata(stream_id)
        }
    }

    fn reader(db: &ChunkDb) -> ChunkReader {
        ChunkReader::new(
            Arc::clone(db.manager()),
            Arc::clone(&db.checkpoints().writer),
            0,
        )
        .unwrap()
    }

    #[test]
    fn test_commit_keep_flag() {
        let mut info = CommitInfo::new(0);
        assert!(info.should_keep());
        info.try_not_to_keep();
        assert!(!info.should_keep());
        info.force_keep();
        assert!(info.should_keep());
        info.try_not_to_keep();
        assert!(info.should_keep());
    }

    #[test]
    fn test_scavenge_drops_hard_deleted_stream() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let positions = write_and_complete(
            &db,
            vec![prepare(0, "a", 100), prepare(0, "b", 100), prepare(0, "c", 100)],
        );
        let old_physical = db.manager().get_chunk(0).unwrap().physical_data_size();

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("a", LastEventNumber::Last(0));
        metadata.set_last("b", LastEventNumber::Deleted);
        metadata.set_last("c", LastEventNumber::Last(0));
        let log = Arc::new(RecordingScavengeLog::default());
        let scavenger = scavenger(&db, &metadata, false).with_log(log.clone());

        let report = scavenger.scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(report.chunks_scavenged, 1);
        assert!(report.space_saved > 0);

        let chunk = db.manager().get_chunk(0).unwrap();
        assert_eq!(chunk.header().scavenge_version, 1);
        assert_eq!(chunk.map_count(), 2);
        assert!(chunk.physical_data_size() < old_physical);

        let reader = reader(&db);
        assert!(reader.try_read_at(positions[0]).unwrap().is_some());
        assert_eq!(reader.try_read_at(positions[1]).unwrap(), None);
        assert!(!reader.exists_at(positions[1]).unwrap());
        let last = reader.try_read_at(positions[2]).unwrap().unwrap();
        assert_eq!(last.as_prepare().unwrap().event_stream_id, "c");

        let second = scavenger.scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(second.result, ScavengeResult::Success);
        assert_eq!(second.space_saved, 0);
        assert_eq!(second.chunks_scavenged, 0);
        assert_eq!(db.manager().get_chunk(0).unwrap().header().scavenge_version, 1);

        let events = log.events();
        assert!(matches!(events[0], ScavengeEvent::Started(_)));
        assert!(events
            .iter()
            .any(|e| matches!(e, ScavengeEvent::Scavenged { start: 0, end: 0, .. })));
        assert!(events
            .iter()
            .any(|e| matches!(e, ScavengeEvent::NotScavenged { start: 0, end: 0, .. })));
    }

    #[test]
    fn test_retention_rules() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let positions = write_and_complete(
            &db,
            vec![
                event(0, "counted", -1, 50),
                event(0, "counted", 0, 50),
                event(0, "counted", 1, 50),
                event(0, "truncated", -1, 50),
                event(0, "truncated", 0, 50),
                event(0, "aged", -1, 50),
                event(0, "aged", 0, 50),
            ],
        );

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("counted", LastEventNumber::Last(2));
        metadata.set_metadata(
            "counted",
            StreamMetadata {
                max_count: Some(2),
                ..Default::default()
            },
        );
        metadata.set_last("truncated", LastEventNumber::Last(1));
        metadata.set_metadata(
            "truncated",
            StreamMetadata {
                truncate_before: Some(1),
                ..Default::default()
            },
        );
        metadata.set_last("aged", LastEventNumber::Last(1));
        metadata.set_metadata(
            "aged",
            StreamMetadata {
                max_age: Some(Duration::ZERO),
                ..Default::default()
            },
        );
        std::thread::sleep(Duration::from_millis(5));

        let report = scavenger(&db, &metadata, false)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);

        let reader = reader(&db);
        let kept: Vec<bool> = positions
            .iter()
            .map(|&p| reader.exists_at(p).unwrap())
            .collect();
        assert_eq!(kept, vec![false, true, true, false, true, false, true]);
    }

    #[test]
    fn test_soft_deleted_temp_stream_dropped_entirely() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let positions = write_and_complete(
            &db,
            vec![
                event(0, "tmp", -1, 80),
                event(0, "$$tmp", -1, 40),
                event(0, "kept", -1, 80),
                event(0, "tmp", 0, 80),
            ],
        );

        let metadata = soft_deleted_tmp();
        metadata.set_last("kept", LastEventNumber::Last(0));
        metadata.set_positions("tmp", positions[0], positions[3]);
        metadata.set_positions("$$tmp", positions[1], positions[1]);

        let report = scavenger(&db, &metadata, false)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);

        let reader = reader(&db);
        assert!(!reader.exists_at(positions[0]).unwrap());
        assert!(!reader.exists_at(positions[1]).unwrap());
        assert!(reader.exists_at(positions[2]).unwrap());
        assert!(!reader.exists_at(positions[3]).unwrap());
    }

    #[test]
    fn test_temp_stream_with_metadata_elsewhere_keeps_last_event() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let positions = write_and_complete(
            &db,
            vec![event(0, "tmp", -1, 80), event(0, "tmp", 0, 80)],
        );

        let metadata = soft_deleted_tmp();
        metadata.set_positions("tmp", positions[0], positions[1]);
        // Metadata events live in a later chunk
        metadata.set_positions("$$tmp", 3 * 4096, 3 * 4096);

        let report = scavenger(&db, &metadata, false)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);

        let reader = reader(&db);
        assert!(!reader.exists_at(positions[0]).unwrap());
        assert!(reader.exists_at(positions[1]).unwrap());
    }

    #[test]
    fn test_duplicate_event_dropped() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let positions = write_and_complete(
            &db,
            vec![
                event(0, "a", -1, 80),
                event(0, "a", -1, 80),
                event(0, "a", 0, 80),
            ],
        );

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("a", LastEventNumber::Last(1));
        metadata.set_event_position("a", 0, positions[0]);
        metadata.set_event_position("a", 1, positions[2]);

        let report = scavenger(&db, &metadata, false)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(report.chunks_scavenged, 1);

        let reader = reader(&db);
        assert!(reader.exists_at(positions[0]).unwrap());
        assert!(!reader.exists_at(positions[1]).unwrap());
        assert!(reader.exists_at(positions[2]).unwrap());
    }

    #[test]
    fn test_chunk_deleted_while_scavenging_is_skipped() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        write_and_complete(&db, vec![prepare(0, "gone", 100), prepare(0, "gone", 100)]);

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("gone", LastEventNumber::Deleted);
        let lookup = Arc::new(DeletingLookup {
            inner: Arc::clone(&metadata),
            chunk: parking_lot::Mutex::new(Some(db.manager().get_chunk(0).unwrap())),
        });
        let log = Arc::new(RecordingScavengeLog::default());
        let report = Scavenger::new(
            &db,
            lookup as Arc<dyn StreamMetadataLookup>,
            Arc::clone(&metadata) as Arc<dyn StreamIndex>,
            options(false),
        )
        .with_log(log.clone())
        .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());

        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(report.error, None);
        assert_eq!(report.chunks_scavenged, 0);
        assert!(log.events().iter().any(|e| matches!(
            e,
            ScavengeEvent::NotScavenged { start: 0, end: 0, reason }
                if reason == "chunk was replaced while scavenging"
        )));
        assert!(dir.path().read_dir().unwrap().all(|entry| {
            !entry.unwrap().file_name().to_string_lossy().ends_with(".tmp")
        }));
    }

    #[test]
    fn test_transaction_commit_follows_prepares() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());

        // Two explicit transactions: one on a deleted stream, one whose
        // second event is the last of its stream.
        let mut writer = ChunkWriter::open(&db).unwrap();
        let begin = PrepareFlags::DATA | PrepareFlags::TRANSACTION_BEGIN;
        let end = PrepareFlags::DATA | PrepareFlags::TRANSACTION_END;

        let gone_begin = writer.position();
        writer
            .write(&mut tx_prepare(gone_begin, gone_begin, 0, "gone", begin))
            .unwrap();
        let gone_commit = writer.position();
        writer.write(&mut commit(gone_commit, gone_begin, 0)).unwrap();

        let live_begin = writer.position();
        writer
            .write(&mut tx_prepare(live_begin, live_begin, 0, "live", begin))
            .unwrap();
        let live_second = writer.position();
        writer
            .write(&mut tx_prepare(live_second, live_begin, 1, "live", end))
            .unwrap();
        let live_commit = writer.position();
        writer.write(&mut commit(live_commit, live_begin, 0)).unwrap();

        writer.complete_chunk().unwrap();
        db.checkpoints().chaser.write(writer.position()).unwrap();

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("gone", LastEventNumber::Deleted);
        metadata.set_last("live", LastEventNumber::Last(1));
        metadata.set_metadata(
            "live",
            StreamMetadata {
                max_count: Some(1),
                ..Default::default()
            },
        );

        let report = scavenger(&db, &metadata, false)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);

        let reader = reader(&db);
        assert!(!reader.exists_at(gone_begin).unwrap());
        assert!(!reader.exists_at(gone_commit).unwrap());
        assert!(!reader.exists_at(live_begin).unwrap());
        assert!(reader.exists_at(live_second).unwrap());
        assert!(reader.exists_at(live_commit).unwrap());
        let read = reader.try_read_at(live_commit).unwrap().unwrap();
        assert_eq!(read.as_commit().unwrap().transaction_position, live_begin);
    }

    #[test]
    fn test_merge_adjacent_chunks() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        let mut writer = ChunkWriter::open(&db).unwrap();
        let mut positions = Vec::new();
        while db.manager().chunks_count() < 4 {
            let mut record = prepare(writer.position(), "s", 1000);
            positions.push(writer.write(&mut record).unwrap().log_position);
        }
        let chaser = db.manager().get_chunk(2).unwrap().chunk_end_position();
        db.checkpoints().chaser.write(chaser).unwrap();
        let below_chaser: Vec<i64> = positions.iter().copied().filter(|&p| p < chaser).collect();

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("s", LastEventNumber::Last(i64::MAX - 1));
        let log = Arc::new(RecordingScavengeLog::default());
        let report = scavenger(&db, &metadata, true)
            .with_log(log.clone())
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(report.chunks_merged, 1);

        let merged = db.manager().get_chunk(0).unwrap();
        assert_eq!(merged.chunk_start_number(), 0);
        assert_eq!(merged.chunk_end_number(), 2);
        assert!(Arc::ptr_eq(&merged, &db.manager().get_chunk(2).unwrap()));
        assert!(!db.manager().get_chunk(3).unwrap().is_read_only());

        let mut reader = reader(&db);
        let mut read_back = Vec::new();
        while let Some(read) = reader.try_read_next().unwrap() {
            if read.record_position >= chaser {
                break;
            }
            read_back.push(read.record_position);
        }
        assert_eq!(read_back, below_chaser);
        assert!(log
            .events()
            .iter()
            .any(|e| matches!(e, ScavengeEvent::Merged { start: 0, end: 2, .. })));
    }

    #[test]
    fn test_chunks_past_chaser_untouched() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        write_and_complete(&db, vec![prepare(0, "gone", 100), prepare(0, "gone", 100)]);
        db.checkpoints().chaser.reset(0).unwrap();

        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("gone", LastEventNumber::Deleted);
        let report = scavenger(&db, &metadata, true)
            .scavenge_blocking(Uuid::new_v4(), &CancellationToken::new());
        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(report.chunks_scavenged, 0);
        assert_eq!(db.manager().get_chunk(0).unwrap().header().scavenge_version, 0);
    }

    #[test]
    fn test_cancelled_scavenge_leaves_chunks() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        write_and_complete(&db, vec![prepare(0, "gone", 100)]);
        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("gone", LastEventNumber::Deleted);

        let token = CancellationToken::new();
        token.cancel();
        let report = scavenger(&db, &metadata, true).scavenge_blocking(Uuid::new_v4(), &token);
        assert_eq!(report.result, ScavengeResult::Stopped);
        assert_eq!(db.manager().get_chunk(0).unwrap().header().scavenge_version, 0);
    }

    #[tokio::test]
    async fn test_async_scavenge() {
        let dir = tempdir().unwrap();
        let db = open_db(dir.path());
        write_and_complete(&db, vec![prepare(0, "a", 100), prepare(0, "gone", 100)]);
        let metadata = Arc::new(MemoryMetadata::default());
        metadata.set_last("gone", LastEventNumber::Deleted);

        let report = scavenger(&db, &metadata, false)
            .scavenge(CancellationToken::new())
            .await;
        assert_eq!(report.result, ScavengeResult::Success);
        assert_eq!(db.manager().get_chunk(0).unwrap().map_count(), 1);
    }
}
