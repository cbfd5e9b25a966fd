use thiserror::Error;

use crate::{
    engine::{EngineError, EngineErrorKind},
    option::ConfigError,
};

/// Errors surfaced by compaction jobs and drains.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// The merge primitive hit a storage failure. Never retried.
    #[error("compaction io error: {0}")]
    MergeIo(#[source] EngineError),
    /// The merge lost a race for its inputs. Retried once when the task asks for it.
    #[error("compaction contention: {0}")]
    MergeContention(#[source] EngineError),
    /// The engine refused the merge for a reason that cannot be classified. Never retried.
    #[error("compaction rejected: {0}")]
    MergeRejected(#[source] EngineError),
    /// A drain gave up before the tree satisfied every capacity.
    #[error("capacities still unsatisfied after {rounds} drain rounds")]
    DrainExhausted {
        /// Scheduling rounds attempted.
        rounds: usize,
    },
    /// Capacity configuration could not be loaded, saved or validated.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl CompactionError {
    /// Classify an engine status as I/O, contention or ambiguous.
    pub fn from_engine(err: EngineError) -> Self {
        match err.kind {
            EngineErrorKind::Io | EngineErrorKind::Corruption => Self::MergeIo(err),
            EngineErrorKind::Busy | EngineErrorKind::Aborted | EngineErrorKind::NotFound => {
                Self::MergeContention(err)
            }
            EngineErrorKind::InvalidArgument | EngineErrorKind::Other => Self::MergeRejected(err),
        }
    }

    /// Returns `true` if re-picking the source level may resolve the failure.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::MergeContention(_))
    }
}
