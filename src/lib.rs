#![deny(missing_docs)]
//! Kapacity compaction for LSM storage engines.
//!
//! Every level of the tree gets a maximum file count (its *kapacity*). Whenever a level holds
//! more files than that, the compactor merges its idle files into the next level, sizing the
//! outputs from the level's target file size. Merges run on a background [`executor`], and a
//! caller can [`drain`](KapCompactor::drain) the compactor until the whole tree settles.
//!
//! The storage engine is reached only through the [`engine::StorageEngine`] and
//! [`engine::EventListener`] contracts; [`engine::memory::MemoryEngine`] implements them in
//! process.

mod observability;

/// Capacity configuration and its on-disk form.
pub mod option;

/// Storage-engine contracts and the in-memory engine.
pub mod engine;

/// Background executors.
pub mod executor;

/// Kapacity compactor, tasks, errors and the bulk-load driver.
pub mod compaction;

pub use crate::{
    compaction::{
        BulkLoadDriver, CompactionError, CompactionTask, Compactor, CompactorOptions,
        DrainSummary, KapCompactor,
    },
    option::{CapacityOptions, ConfigError},
};
