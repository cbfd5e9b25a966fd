//! Structured log events.
//!
//! Every event goes to the `kaplsm` target with two fields: `component`, which is one of
//! `"compaction"`, `"option"` or `"engine"`, and `event`, which names what happened. Task
//! events add `task_id` so one merge can be followed from `task_scheduled` to
//! `task_finished`, `task_contention` or `task_failed`.
//!
//! Installing a subscriber is left to the embedding application.

/// Target shared by all kaplsm events.
pub(crate) const KAPLSM_TARGET: &str = "kaplsm";

/// Info level: drain outcomes, retries, config I/O and tree dumps.
///
/// ```ignore
/// log_info!(
///     component = "compaction",
///     event = "task_retry_scheduled",
///     failed_task_id = %failed.id,
///     source_level = task.source_level,
/// );
/// ```
macro_rules! log_info {
    ($($field:tt)*) => {
        ::tracing::info!(target: $crate::observability::KAPLSM_TARGET, $($field)*)
    };
}

/// Debug level: per-task scheduling and merge installation.
macro_rules! log_debug {
    ($($field:tt)*) => {
        ::tracing::debug!(target: $crate::observability::KAPLSM_TARGET, $($field)*)
    };
}

macro_rules! log_warn {
    ($($field:tt)*) => {
        ::tracing::warn!(target: $crate::observability::KAPLSM_TARGET, $($field)*)
    };
}

/// Error level: merges that failed for a reason a retry cannot fix.
macro_rules! log_error {
    ($($field:tt)*) => {
        ::tracing::error!(target: $crate::observability::KAPLSM_TARGET, $($field)*)
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;
