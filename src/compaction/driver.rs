use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use super::{CompactionError, DrainSummary, KapCompactor};
use crate::{
    engine::{LevelMetadata, StorageEngine},
    executor::Executor,
    observability::log_info,
    option::CapacityOptions,
};

/// Render the file names of a level, or `EMPTY`.
pub fn describe_level(level: &LevelMetadata) -> String {
    if level.is_empty() {
        return "EMPTY".to_string();
    }
    level
        .files
        .iter()
        .map(|file| file.name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Log level, byte size and file names of every level of `cf_name`.
pub fn log_tree_state<S>(engine: &S, cf_name: &str)
where
    S: StorageEngine + ?Sized,
{
    let metadata = engine.column_family_metadata(cf_name);
    for level in &metadata.levels {
        log_info!(
            component = "compaction",
            event = "tree_state",
            cf_name = %metadata.name,
            level = level.level,
            bytes = level.size,
            files = level.len(),
            names = %describe_level(level),
        );
    }
}

/// Finishes a bulk load: settles the tree, then records the capacities it was built with.
pub struct BulkLoadDriver<S, E> {
    compactor: Arc<KapCompactor<S, E>>,
    db_dir: PathBuf,
}

impl<S, E> BulkLoadDriver<S, E>
where
    S: StorageEngine,
    E: Executor,
{
    /// Drive `compactor` for the store rooted at `db_dir`.
    pub fn new(compactor: Arc<KapCompactor<S, E>>, db_dir: impl Into<PathBuf>) -> Self {
        Self {
            compactor,
            db_dir: db_dir.into(),
        }
    }

    /// The driven compactor.
    pub fn compactor(&self) -> &Arc<KapCompactor<S, E>> {
        &self.compactor
    }

    /// Store directory the configuration is written to.
    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Drain to quiescence, then dump the tree state.
    pub async fn settle(&self) -> Result<DrainSummary, CompactionError> {
        let summary = self.compactor.drain().await?;
        log_tree_state(self.compactor.engine().as_ref(), self.compactor.cf_name());
        Ok(summary)
    }

    /// Write the capacity configuration under the store directory and return its path.
    pub fn persist_options(&self) -> Result<PathBuf, CompactionError> {
        let path = CapacityOptions::config_path(&self.db_dir);
        self.compactor.capacity_options().save(&path)?;
        Ok(path)
    }

    /// [`settle`](Self::settle) then [`persist_options`](Self::persist_options).
    pub async fn finish(self) -> Result<DrainSummary, CompactionError> {
        let summary = self.settle().await?;
        self.persist_options()?;
        Ok(summary)
    }
}
