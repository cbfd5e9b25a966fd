//! Kapacity-driven compaction scheduling.
//!
//! The compactor watches flush and compaction events, decides which level overflowed its file
//! capacity, and hands merges of that level into the next one to a background executor. It can
//! also be driven synchronously until the whole tree satisfies its capacities.

/// Bulk-load driver that settles the tree and persists the capacity configuration.
mod driver;
/// Compaction errors and engine status classification.
pub mod error;
/// Scheduler counters.
mod metrics;
/// The kapacity compactor.
mod scheduler;
/// Compaction task value object.
mod task;

pub use driver::{describe_level, log_tree_state, BulkLoadDriver};
pub use error::CompactionError;
pub use metrics::{CompactionMetrics, CompactionMetricsSnapshot};
pub use scheduler::{CompactorOptions, DrainSummary, KapCompactor};
pub use task::CompactionTask;

use crate::engine::EventListener;

/// Compaction policy plugged into the engine's event stream.
pub trait Compactor: EventListener {
    /// Pick a task for `level`, or `None` if the level needs no work right now.
    fn pick_compaction(&self, level: usize) -> Option<CompactionTask>;

    /// Submit `task` to the background executor. Ownership moves to the running job.
    fn schedule_compaction(&self, task: CompactionTask);
}
