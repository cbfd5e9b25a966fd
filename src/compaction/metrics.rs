//! Compaction observability counters and summaries.

use std::sync::atomic::{AtomicU64, Ordering};

use super::CompactionError;

/// Snapshot of compaction observability counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionMetricsSnapshot {
    /// Tasks handed to the executor, retries included.
    pub tasks_scheduled: u64,
    /// Tasks whose merge succeeded.
    pub tasks_succeeded: u64,
    /// Tasks that failed with an I/O status.
    pub failures_io: u64,
    /// Tasks that lost contention for their inputs.
    pub failures_contention: u64,
    /// Tasks the engine rejected for an unclassified reason.
    pub failures_rejected: u64,
    /// Retry tasks scheduled after a contention failure.
    pub retries_scheduled: u64,
    /// Flush events observed for the compactor's column family.
    pub flush_events: u64,
    /// Compaction-completed events observed for the compactor's column family.
    pub compaction_events: u64,
    /// Scheduling rounds run by synchronous drains.
    pub drain_rounds: u64,
}

impl CompactionMetricsSnapshot {
    /// Total failed tasks.
    pub fn failures(&self) -> u64 {
        self.failures_io + self.failures_contention + self.failures_rejected
    }
}

/// Shared compaction counters.
#[derive(Debug, Default)]
pub struct CompactionMetrics {
    tasks_scheduled: AtomicU64,
    tasks_succeeded: AtomicU64,
    failures_io: AtomicU64,
    failures_contention: AtomicU64,
    failures_rejected: AtomicU64,
    retries_scheduled: AtomicU64,
    flush_events: AtomicU64,
    compaction_events: AtomicU64,
    drain_rounds: AtomicU64,
}

impl CompactionMetrics {
    /// Create zeroed metrics.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_scheduled(&self) {
        self.tasks_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_succeeded(&self) {
        self.tasks_succeeded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_failure(&self, err: &CompactionError) {
        let counter = match err {
            CompactionError::MergeIo(_) => &self.failures_io,
            CompactionError::MergeContention(_) => &self.failures_contention,
            _ => &self.failures_rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_flush_event(&self) {
        self.flush_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction_event(&self) {
        self.compaction_events.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_drain_round(&self) {
        self.drain_rounds.fetch_add(1, Ordering::Relaxed);
    }

    /// Capture a point-in-time copy of every counter.
    pub fn snapshot(&self) -> CompactionMetricsSnapshot {
        CompactionMetricsSnapshot {
            tasks_scheduled: self.tasks_scheduled.load(Ordering::Relaxed),
            tasks_succeeded: self.tasks_succeeded.load(Ordering::Relaxed),
            failures_io: self.failures_io.load(Ordering::Relaxed),
            failures_contention: self.failures_contention.load(Ordering::Relaxed),
            failures_rejected: self.failures_rejected.load(Ordering::Relaxed),
            retries_scheduled: self.retries_scheduled.load(Ordering::Relaxed),
            flush_events: self.flush_events.load(Ordering::Relaxed),
            compaction_events: self.compaction_events.load(Ordering::Relaxed),
            drain_rounds: self.drain_rounds.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{EngineError, EngineErrorKind};

    #[test]
    fn failures_land_in_their_class() {
        let metrics = CompactionMetrics::new();
        for kind in [
            EngineErrorKind::Io,
            EngineErrorKind::Busy,
            EngineErrorKind::Busy,
            EngineErrorKind::Other,
        ] {
            metrics.record_failure(&CompactionError::from_engine(EngineError::new(kind, "x")));
        }
        metrics.record_scheduled();
        metrics.record_succeeded();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.failures_io, 1);
        assert_eq!(snapshot.failures_contention, 2);
        assert_eq!(snapshot.failures_rejected, 1);
        assert_eq!(snapshot.failures(), 4);
        assert_eq!(snapshot.tasks_scheduled, 1);
        assert_eq!(snapshot.tasks_succeeded, 1);
    }
}
