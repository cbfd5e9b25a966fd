//! In-memory engine that models level metadata and merges without storing data.
//!
//! Useful for exercising compaction policies: it tracks files and their sizes per level,
//! honours the being-compacted flag, splits merge outputs by the requested size limit and
//! delivers flush/compaction events to its listeners.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError, Weak,
    },
    time::Duration,
};

use super::{
    ColumnFamilyMetadata, CompactFuture, CompactOptions, CompactionJobInfo, EngineError,
    EngineErrorKind, EventListener, FileMetadata, FlushJobInfo, LevelMetadata, StorageEngine,
    DEFAULT_COLUMN_FAMILY,
};
use crate::observability::log_debug;

#[derive(Debug, Clone)]
struct MemFile {
    name: String,
    size: u64,
    being_compacted: bool,
}

#[derive(Debug, Default)]
struct TreeState {
    levels: Vec<Vec<MemFile>>,
    admitted: Vec<Vec<String>>,
}

impl TreeState {
    fn locate(&self, name: &str) -> Option<(usize, usize)> {
        self.levels.iter().enumerate().find_map(|(level, files)| {
            files
                .iter()
                .position(|file| file.name == name)
                .map(|idx| (level, idx))
        })
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-process [`StorageEngine`] holding only file metadata.
pub struct MemoryEngine {
    cf_name: String,
    state: Mutex<TreeState>,
    listeners: Mutex<Vec<Weak<dyn EventListener>>>,
    faults: Mutex<VecDeque<EngineErrorKind>>,
    merge_delay: Option<Duration>,
    l0_stop_writes_trigger: usize,
    next_file_number: AtomicU64,
    merges_completed: AtomicU64,
    merges_rejected: AtomicU64,
}

impl MemoryEngine {
    /// Create an empty tree with `num_levels` levels.
    pub fn new(num_levels: usize) -> Self {
        Self {
            cf_name: DEFAULT_COLUMN_FAMILY.to_string(),
            state: Mutex::new(TreeState {
                levels: vec![Vec::new(); num_levels.max(1)],
                admitted: Vec::new(),
            }),
            listeners: Mutex::new(Vec::new()),
            faults: Mutex::new(VecDeque::new()),
            merge_delay: None,
            l0_stop_writes_trigger: usize::MAX,
            next_file_number: AtomicU64::new(1),
            merges_completed: AtomicU64::new(0),
            merges_rejected: AtomicU64::new(0),
        }
    }

    /// Serve the given column family name.
    pub fn with_cf_name(mut self, cf_name: impl Into<String>) -> Self {
        self.cf_name = cf_name.into();
        self
    }

    /// Keep every merge in flight for `delay` before installing its outputs.
    pub fn with_merge_delay(mut self, delay: Duration) -> Self {
        self.merge_delay = Some(delay);
        self
    }

    /// Report `triggered_writes_stop` once level 0 holds at least `trigger` files.
    pub fn with_l0_stop_writes_trigger(mut self, trigger: usize) -> Self {
        self.l0_stop_writes_trigger = trigger.max(1);
        self
    }

    /// Column family served by this engine.
    pub fn cf_name(&self) -> &str {
        &self.cf_name
    }

    /// Register a listener. Only a weak reference is kept.
    pub fn add_listener<L>(&self, listener: &Arc<L>)
    where
        L: EventListener + 'static,
    {
        let listener: Arc<dyn EventListener> = listener.clone();
        lock(&self.listeners).push(Arc::downgrade(&listener));
    }

    /// Make the next merge fail with `kind` before it touches any input.
    pub fn inject_failure(&self, kind: EngineErrorKind) {
        lock(&self.faults).push_back(kind);
    }

    /// Simulate a memory buffer flush of `size` bytes and deliver the flush event.
    pub fn flush(&self, size: u64) -> String {
        let name = self.next_file_name();
        let triggered_writes_stop = {
            let mut state = lock(&self.state);
            state.levels[0].insert(
                0,
                MemFile {
                    name: name.clone(),
                    size,
                    being_compacted: false,
                },
            );
            state.levels[0].len() >= self.l0_stop_writes_trigger
        };
        let info = FlushJobInfo {
            cf_name: self.cf_name.clone(),
            file_name: name.clone(),
            triggered_writes_stop,
        };
        for listener in self.live_listeners() {
            listener.on_flush_completed(&info);
        }
        name
    }

    /// Place a file directly into `level` without delivering any event.
    ///
    /// Returns `None` if the tree has no such level.
    pub fn ingest(&self, level: usize, size: u64) -> Option<String> {
        let mut state = lock(&self.state);
        let files = state.levels.get_mut(level)?;
        let name = self.next_file_name();
        files.push(MemFile {
            name: name.clone(),
            size,
            being_compacted: false,
        });
        Some(name)
    }

    /// Flip the being-compacted flag of a file, as a concurrent engine job would.
    ///
    /// Returns `false` if the file does not exist.
    pub fn set_being_compacted(&self, name: &str, being_compacted: bool) -> bool {
        let mut state = lock(&self.state);
        match state.locate(name) {
            Some((level, idx)) => {
                state.levels[level][idx].being_compacted = being_compacted;
                true
            }
            None => false,
        }
    }

    /// Number of files per level.
    pub fn file_counts(&self) -> Vec<usize> {
        lock(&self.state).levels.iter().map(Vec::len).collect()
    }

    /// Input sets of every merge that was admitted, in admission order.
    pub fn admitted_merges(&self) -> Vec<Vec<String>> {
        lock(&self.state).admitted.clone()
    }

    /// Number of merges whose outputs were installed.
    pub fn merges_completed(&self) -> u64 {
        self.merges_completed.load(Ordering::Relaxed)
    }

    /// Number of merges rejected before running.
    pub fn merges_rejected(&self) -> u64 {
        self.merges_rejected.load(Ordering::Relaxed)
    }

    fn next_file_name(&self) -> String {
        let number = self.next_file_number.fetch_add(1, Ordering::Relaxed);
        format!("{number:06}.sst")
    }

    fn live_listeners(&self) -> Vec<Arc<dyn EventListener>> {
        let mut listeners = lock(&self.listeners);
        listeners.retain(|listener| listener.strong_count() > 0);
        listeners.iter().filter_map(Weak::upgrade).collect()
    }

    fn reject(&self, kind: EngineErrorKind, message: impl Into<String>) -> EngineError {
        self.merges_rejected.fetch_add(1, Ordering::Relaxed);
        EngineError::new(kind, message)
    }

    /// Validate and claim the inputs. Returns the lowest input level and total input bytes.
    fn admit(
        &self,
        cf_name: &str,
        input_files: &[String],
        output_level: usize,
    ) -> Result<(usize, u64), EngineError> {
        if let Some(kind) = lock(&self.faults).pop_front() {
            return Err(self.reject(kind, "injected failure"));
        }
        if cf_name != self.cf_name {
            return Err(self.reject(
                EngineErrorKind::InvalidArgument,
                format!("unknown column family {cf_name}"),
            ));
        }
        if input_files.is_empty() {
            return Err(self.reject(EngineErrorKind::InvalidArgument, "no input files"));
        }

        let mut state = lock(&self.state);
        if output_level >= state.levels.len() {
            return Err(self.reject(
                EngineErrorKind::InvalidArgument,
                format!("output level {output_level} out of range"),
            ));
        }
        let mut positions = Vec::with_capacity(input_files.len());
        for name in input_files {
            let Some((level, idx)) = state.locate(name) else {
                return Err(self.reject(EngineErrorKind::NotFound, format!("{name} not found")));
            };
            if state.levels[level][idx].being_compacted {
                return Err(self.reject(
                    EngineErrorKind::Busy,
                    format!("{name} is being compacted"),
                ));
            }
            positions.push((level, idx));
        }

        let mut base_level = usize::MAX;
        let mut total = 0u64;
        for (level, idx) in positions {
            let file = &mut state.levels[level][idx];
            file.being_compacted = true;
            total = total.saturating_add(file.size);
            base_level = base_level.min(level);
        }
        state.admitted.push(input_files.to_vec());
        Ok((base_level, total))
    }

    fn install(
        &self,
        options: &CompactOptions,
        input_files: &[String],
        base_input_level: usize,
        output_level: usize,
        total: u64,
    ) -> CompactionJobInfo {
        let limit = options.output_file_size_limit;
        let outputs = if limit == 0 || limit == u64::MAX {
            1
        } else {
            total.div_ceil(limit).max(1)
        };
        let per_file = total / outputs;

        let mut state = lock(&self.state);
        for files in state.levels.iter_mut() {
            files.retain(|file| !input_files.contains(&file.name));
        }
        let mut output_files = Vec::with_capacity(outputs as usize);
        for i in 0..outputs {
            let size = if i + 1 == outputs {
                total - per_file * (outputs - 1)
            } else {
                per_file
            };
            let name = self.next_file_name();
            state.levels[output_level].push(MemFile {
                name: name.clone(),
                size,
                being_compacted: false,
            });
            output_files.push(name);
        }
        drop(state);

        self.merges_completed.fetch_add(1, Ordering::Relaxed);
        log_debug!(
            component = "engine",
            event = "merge_installed",
            inputs = input_files.len(),
            outputs = output_files.len(),
            output_level = output_level,
        );
        CompactionJobInfo {
            cf_name: self.cf_name.clone(),
            base_input_level,
            output_level,
            input_files: input_files.to_vec(),
            output_files,
        }
    }
}

impl StorageEngine for MemoryEngine {
    fn column_family_metadata(&self, cf_name: &str) -> ColumnFamilyMetadata {
        if cf_name != self.cf_name {
            return ColumnFamilyMetadata {
                name: cf_name.to_string(),
                levels: Vec::new(),
            };
        }
        let state = lock(&self.state);
        let levels = state
            .levels
            .iter()
            .enumerate()
            .map(|(level, files)| LevelMetadata {
                level,
                size: files.iter().map(|file| file.size).sum(),
                files: files
                    .iter()
                    .map(|file| FileMetadata {
                        name: file.name.clone(),
                        size: file.size,
                        being_compacted: file.being_compacted,
                    })
                    .collect(),
            })
            .collect();
        ColumnFamilyMetadata {
            name: self.cf_name.clone(),
            levels,
        }
    }

    fn compact_files<'a>(
        &'a self,
        options: &'a CompactOptions,
        cf_name: &'a str,
        input_files: &'a [String],
        output_level: usize,
    ) -> CompactFuture<'a> {
        Box::pin(async move {
            let (base_input_level, total) = self.admit(cf_name, input_files, output_level)?;
            if let Some(delay) = self.merge_delay {
                tokio::time::sleep(delay).await;
            }
            let info = self.install(options, input_files, base_input_level, output_level, total);
            for listener in self.live_listeners() {
                listener.on_compaction_completed(&info);
            }
            Ok(())
        })
    }
}
