//! Scavenge progress reporting

use std::time::Duration;

use uuid::Uuid;

use super::ScavengeReport;

/// Receives scavenge progress
pub trait ScavengeLog: Send + Sync {
    fn scavenge_started(&self, scavenge_id: Uuid);

    fn chunks_scavenged(
        &self,
        chunk_start_number: i32,
        chunk_end_number: i32,
        elapsed: Duration,
        space_saved: i64,
    );

    fn chunks_not_scavenged(
        &self,
        chunk_start_number: i32,
        chunk_end_number: i32,
        elapsed: Duration,
        reason: &str,
    );

    fn chunks_merged(
        &self,
        chunk_start_number: i32,
        chunk_end_number: i32,
        elapsed: Duration,
        space_saved: i64,
    );

    fn chunks_not_merged(
        &self,
        chunk_start_number: i32,
        chunk_end_number: i32,
        elapsed: Duration,
        reason: &str,
    );

    fn scavenge_completed(&self, report: &ScavengeReport);
}

/// Writes scavenge progress to the tracing subscriber
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingScavengeLog;

impl ScavengeLog for TracingScavengeLog {
    fn scavenge_started(&self, scavenge_id: Uuid) {
        tracing::info!("Scavenge {} started", scavenge_id);
    }

    fn chunks_scavenged(&self, start: i32, end: i32, elapsed: Duration, space_saved: i64) {
        tracing::info!(
            "Scavenged chunks #{}-{} in {:?}, saved {} bytes",
            start,
            end,
            elapsed,
            space_saved
        );
    }

    fn chunks_not_scavenged(&self, start: i32, end: i32, elapsed: Duration, reason: &str) {
        tracing::info!(
            "Chunks #{}-{} not scavenged after {:?}: {}",
            start,
            end,
            elapsed,
            reason
        );
    }

    fn chunks_merged(&self, start: i32, end: i32, elapsed: Duration, space_saved: i64) {
        tracing::info!(
            "Merged chunks #{}-{} in {:?}, saved {} bytes",
            start,
            end,
            elapsed,
            space_saved
        );
    }

    fn chunks_not_merged(&self, start: i32, end: i32, elapsed: Duration, reason: &str) {
        tracing::info!(
            "Chunks #{}-{} not merged after {:?}: {}",
            start,
            end,
            elapsed,
            reason
        );
    }

    fn scavenge_completed(&self, report: &ScavengeReport) {
        match &report.error {
            Some(error) => tracing::warn!(
                "Scavenge {} finished as {:?} in {:?}, saved {} bytes: {}",
                report.scavenge_id,
                report.result,
                report.elapsed,
                report.space_saved,
                error
            ),
            None => tracing::info!(
                "Scavenge {} finished as {:?} in {:?}, saved {} bytes",
                report.scavenge_id,
                report.result,
                report.elapsed,
                report.space_saved
            ),
        }
    }
}
