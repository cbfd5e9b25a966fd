//! Kapacity compactor: picks over-capacity levels and runs their merges in the background.
//!
//! Every decision re-reads level metadata from the engine. A file is never picked while the
//! engine flags it as being compacted, nor while it is an input of a task this compactor has
//! scheduled but not yet finished.

use std::{
    collections::HashSet,
    future::Future,
    pin::{pin, Pin},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use tokio::sync::Notify;

use super::{
    metrics::{CompactionMetrics, CompactionMetricsSnapshot},
    task::CompactionTask,
    CompactionError, Compactor,
};
use crate::{
    engine::{
        ColumnFamilyMetadata, CompactOptions, CompactionJobInfo, Compression, EventListener,
        FlushJobInfo, StorageEngine, DEFAULT_COLUMN_FAMILY,
    },
    executor::Executor,
    observability::{log_debug, log_error, log_info, log_warn},
    option::{CapacityOptions, ConfigError},
};

/// Scheduler knobs that are not part of the persisted capacity configuration.
#[derive(Clone, Debug)]
pub struct CompactorOptions {
    pub(crate) cf_name: String,
    pub(crate) compression: Compression,
    pub(crate) max_drain_rounds: usize,
    pub(crate) poll_interval: Duration,
}

impl Default for CompactorOptions {
    fn default() -> Self {
        Self {
            cf_name: DEFAULT_COLUMN_FAMILY.to_string(),
            compression: Compression::None,
            max_drain_rounds: 1024,
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl CompactorOptions {
    /// Column family whose levels are enforced.
    pub fn cf_name(self, cf_name: impl Into<String>) -> Self {
        CompactorOptions {
            cf_name: cf_name.into(),
            ..self
        }
    }

    /// Engine-wide compression copied into every task.
    pub fn compression(self, compression: Compression) -> Self {
        CompactorOptions {
            compression,
            ..self
        }
    }

    /// Scheduling rounds a drain may run before giving up.
    pub fn max_drain_rounds(self, max_drain_rounds: usize) -> Self {
        CompactorOptions {
            max_drain_rounds,
            ..self
        }
    }

    /// Back-off used while a drain finds nothing it can schedule, and by blocking waits.
    pub fn poll_interval(self, poll_interval: Duration) -> Self {
        CompactorOptions {
            poll_interval,
            ..self
        }
    }
}

/// Result of a drain that reached a settled tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrainSummary {
    /// Scheduling rounds it took to settle.
    pub rounds: usize,
}

/// Compactor enforcing a maximum file count per level.
///
/// Register it with the engine to react to flush/compaction events, or call
/// [`KapCompactor::drain`] to drive it until the tree is settled.
pub struct KapCompactor<S, E> {
    inner: Arc<CompactorInner<S, E>>,
}

struct CompactorInner<S, E> {
    engine: Arc<S>,
    executor: E,
    capacity: CapacityOptions,
    options: CompactorOptions,
    outstanding: AtomicUsize,
    idle: Notify,
    /// Inputs of tasks that were scheduled and have not finished yet.
    pending: Mutex<HashSet<String>>,
    metrics: CompactionMetrics,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S, E> KapCompactor<S, E>
where
    S: StorageEngine,
    E: Executor,
{
    /// Build a compactor enforcing `capacity` on `engine`, running merges on `executor`.
    pub fn new(
        engine: Arc<S>,
        executor: E,
        capacity: CapacityOptions,
        options: CompactorOptions,
    ) -> Result<Self, ConfigError> {
        capacity.validate()?;
        Ok(Self {
            inner: Arc::new(CompactorInner {
                engine,
                executor,
                capacity,
                options,
                outstanding: AtomicUsize::new(0),
                idle: Notify::new(),
                pending: Mutex::new(HashSet::new()),
                metrics: CompactionMetrics::new(),
            }),
        })
    }

    /// Engine the compactor reads from and merges through.
    pub fn engine(&self) -> &Arc<S> {
        &self.inner.engine
    }

    /// Capacity configuration being enforced.
    pub fn capacity_options(&self) -> &CapacityOptions {
        &self.inner.capacity
    }

    /// Column family being enforced.
    pub fn cf_name(&self) -> &str {
        &self.inner.options.cf_name
    }

    /// Pick and schedule a task for every level that needs one, lowest level first.
    ///
    /// Returns `true` if at least one task was submitted.
    pub fn schedule_across_levels(&self) -> bool {
        self.inner.schedule_across_levels()
    }

    /// Returns `true` if no level holds more files than its capacity.
    pub fn check_capacities_satisfied(&self) -> bool {
        self.inner.capacities_satisfied(&self.inner.metadata())
    }

    /// Tasks submitted but not yet completed.
    pub fn outstanding_task_count(&self) -> usize {
        self.inner.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until no task is outstanding.
    pub async fn wait_until_idle(&self) {
        self.inner.wait_until_idle().await
    }

    /// Block the calling thread until no task is outstanding, polling every `poll_interval`.
    ///
    /// Must not be called from a runtime worker thread that also runs the merges.
    pub fn wait_until_idle_blocking(&self) {
        while self.outstanding_task_count() > 0 {
            std::thread::sleep(self.inner.options.poll_interval);
        }
    }

    /// Schedule, wait and re-check until every level satisfies its capacity with nothing
    /// outstanding.
    ///
    /// Gives up with [`CompactionError::DrainExhausted`] after `max_drain_rounds` rounds.
    pub async fn drain(&self) -> Result<DrainSummary, CompactionError> {
        let inner = &self.inner;
        let mut rounds = 0;
        loop {
            inner.wait_until_idle().await;
            if inner.capacities_satisfied(&inner.metadata()) {
                log_info!(
                    component = "compaction",
                    event = "drain_finished",
                    rounds = rounds,
                );
                return Ok(DrainSummary { rounds });
            }
            if rounds >= inner.options.max_drain_rounds {
                log_warn!(
                    component = "compaction",
                    event = "drain_exhausted",
                    rounds = rounds,
                );
                return Err(CompactionError::DrainExhausted { rounds });
            }
            rounds += 1;
            inner.metrics.record_drain_round();
            let scheduled = inner.schedule_across_levels();
            log_debug!(
                component = "compaction",
                event = "drain_round",
                round = rounds,
                scheduled = scheduled,
                outstanding = inner.outstanding.load(Ordering::SeqCst),
            );
            if !scheduled {
                tokio::time::sleep(inner.options.poll_interval).await;
            }
        }
    }

    /// Point-in-time copy of the scheduler counters.
    pub fn metrics(&self) -> CompactionMetricsSnapshot {
        self.inner.metrics.snapshot()
    }
}

impl<S, E> Compactor for KapCompactor<S, E>
where
    S: StorageEngine,
    E: Executor,
{
    fn pick_compaction(&self, level: usize) -> Option<CompactionTask> {
        self.inner.pick(level)
    }

    fn schedule_compaction(&self, task: CompactionTask) {
        self.inner.schedule(task)
    }
}

impl<S, E> EventListener for KapCompactor<S, E>
where
    S: StorageEngine,
    E: Executor,
{
    fn on_flush_completed(&self, info: &FlushJobInfo) {
        self.inner.on_flush_completed(info)
    }

    fn on_compaction_completed(&self, info: &CompactionJobInfo) {
        self.inner.on_compaction_completed(info)
    }
}

impl<S, E> CompactorInner<S, E>
where
    S: StorageEngine,
    E: Executor,
{
    fn metadata(&self) -> ColumnFamilyMetadata {
        self.engine.column_family_metadata(&self.options.cf_name)
    }

    fn num_levels(&self) -> usize {
        self.metadata().levels.len()
    }

    fn capacities_satisfied(&self, metadata: &ColumnFamilyMetadata) -> bool {
        metadata
            .levels
            .iter()
            .all(|level| level.len() as u64 <= self.capacity.kapacity(level.level))
    }

    fn pick(&self, level: usize) -> Option<CompactionTask> {
        self.pick_excluding(level, &lock(&self.pending))
    }

    /// Pick `level` and reserve its inputs in one step, so concurrent pickers never share them.
    fn claim(&self, level: usize) -> Option<CompactionTask> {
        let mut pending = lock(&self.pending);
        let task = self.pick_excluding(level, &pending)?;
        pending.extend(task.input_files.iter().cloned());
        Some(task)
    }

    fn release(&self, input_files: &[String]) {
        let mut pending = lock(&self.pending);
        for name in input_files {
            pending.remove(name);
        }
    }

    fn pick_excluding(&self, level: usize, pending: &HashSet<String>) -> Option<CompactionTask> {
        let metadata = self.metadata();
        let files = &metadata.levels.get(level)?.files;
        let kapacity = self.capacity.kapacity(level);
        if files.len() as u64 <= kapacity {
            return None;
        }
        if level + 1 >= metadata.levels.len() {
            log_debug!(
                component = "compaction",
                event = "last_level_over_capacity",
                level = level,
                files = files.len(),
                kapacity = kapacity,
            );
            return None;
        }
        let input_files: Vec<String> = files
            .iter()
            .filter(|file| !file.being_compacted && !pending.contains(&file.name))
            .map(|file| file.name.clone())
            .collect();
        if input_files.is_empty() {
            log_debug!(
                component = "compaction",
                event = "pick_inputs_busy",
                level = level,
                files = files.len(),
            );
            return None;
        }
        let compact_options = CompactOptions {
            compression: self.options.compression,
            output_file_size_limit: self.capacity.output_file_size(level),
        };
        CompactionTask::new(
            self.options.cf_name.clone(),
            level,
            level + 1,
            input_files,
            compact_options,
        )
    }

    fn schedule(self: &Arc<Self>, task: CompactionTask) {
        lock(&self.pending).extend(task.input_files.iter().cloned());
        let outstanding = self.outstanding.fetch_add(1, Ordering::SeqCst) + 1;
        self.metrics.record_scheduled();
        log_debug!(
            component = "compaction",
            event = "task_scheduled",
            task_id = %task.id,
            source_level = task.source_level,
            output_level = task.output_level,
            inputs = task.input_files.len(),
            output_file_size_limit = task.compact_options.output_file_size_limit,
            retry_on_fail = task.retry_on_fail,
            outstanding = outstanding,
        );
        self.executor.spawn(Arc::clone(self).run(task));
    }

    /// Background entry point: merge, maybe re-pick, then release the task.
    fn run(self: Arc<Self>, task: CompactionTask) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let result = self
                .engine
                .compact_files(
                    &task.compact_options,
                    &task.cf_name,
                    &task.input_files,
                    task.output_level,
                )
                .await;
            self.release(&task.input_files);
            match result {
                Ok(()) => {
                    self.metrics.record_succeeded();
                    log_debug!(
                        component = "compaction",
                        event = "task_finished",
                        task_id = %task.id,
                        source_level = task.source_level,
                        output_level = task.output_level,
                    );
                }
                Err(err) => {
                    let err = CompactionError::from_engine(err);
                    self.metrics.record_failure(&err);
                    self.report_failure(&task, &err);
                    if err.is_retryable() && task.retry_on_fail {
                        self.retry(&task);
                    }
                }
            }
            // Retries are submitted first so the counter never reads zero with relief pending.
            self.finish_one();
        })
    }

    fn report_failure(&self, task: &CompactionTask, err: &CompactionError) {
        match err {
            CompactionError::MergeContention(_) => log_warn!(
                component = "compaction",
                event = "task_contention",
                task_id = %task.id,
                source_level = task.source_level,
                retry_on_fail = task.retry_on_fail,
                error = %err,
            ),
            _ => log_error!(
                component = "compaction",
                event = "task_failed",
                task_id = %task.id,
                source_level = task.source_level,
                error = %err,
            ),
        }
    }

    fn retry(self: &Arc<Self>, failed: &CompactionTask) {
        let Some(task) = self.claim(failed.source_level) else {
            return;
        };
        self.metrics.record_retry();
        log_info!(
            component = "compaction",
            event = "task_retry_scheduled",
            failed_task_id = %failed.id,
            task_id = %task.id,
            source_level = task.source_level,
        );
        self.schedule(task);
    }

    fn finish_one(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn wait_until_idle(&self) {
        loop {
            let mut notified = pin!(self.idle.notified());
            notified.as_mut().enable();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            notified.await;
        }
    }

    fn schedule_across_levels(self: &Arc<Self>) -> bool {
        let mut scheduled = false;
        for level in 0..self.num_levels().saturating_sub(1) {
            if let Some(task) = self.claim(level) {
                self.schedule(task);
                scheduled = true;
            }
        }
        scheduled
    }

    fn on_flush_completed(self: &Arc<Self>, info: &FlushJobInfo) {
        if info.cf_name != self.options.cf_name {
            return;
        }
        self.metrics.record_flush_event();
        // Oldest levels first, so existing deep backlogs are relieved before new ones pile up.
        for level in (0..self.num_levels()).rev() {
            if let Some(task) = self.claim(level) {
                self.schedule(task.with_retry_on_fail(info.triggered_writes_stop));
            }
        }
    }

    fn on_compaction_completed(self: &Arc<Self>, info: &CompactionJobInfo) {
        if info.cf_name != self.options.cf_name {
            return;
        }
        self.metrics.record_compaction_event();
        self.schedule_across_levels();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::{memory::MemoryEngine, CompactFuture, EngineErrorKind},
        executor::tokio::TokioExecutor,
    };

    const MIB: u64 = 1 << 20;

    type MemCompactor = KapCompactor<MemoryEngine, TokioExecutor>;

    fn compactor(engine: &Arc<MemoryEngine>, capacity: CapacityOptions) -> MemCompactor {
        KapCompactor::new(
            Arc::clone(engine),
            TokioExecutor::try_current().expect("runtime"),
            capacity,
            CompactorOptions::default().poll_interval(Duration::from_millis(5)),
        )
        .expect("compactor")
    }

    fn fill(engine: &MemoryEngine, level: usize, files: usize) -> Vec<String> {
        (0..files)
            .map(|_| engine.ingest(level, MIB).expect("level"))
            .collect()
    }

    #[tokio::test]
    async fn pick_only_over_capacity() {
        let engine = Arc::new(MemoryEngine::new(3));
        let capacity = CapacityOptions::default().kapacities(vec![2]);
        let compactor = compactor(&engine, capacity.clone());
        fill(&engine, 0, 2);
        assert!(compactor.pick_compaction(0).is_none());

        fill(&engine, 0, 1);
        let task = compactor.pick_compaction(0).expect("task");
        assert_eq!(task.source_level, 0);
        assert_eq!(task.output_level, 1);
        assert_eq!(task.input_files.len(), 3);
        assert_eq!(
            task.compact_options.output_file_size_limit,
            capacity.target_file_size(0)
        );
        assert!(!task.retry_on_fail);
        assert!(compactor.pick_compaction(1).is_none());
    }

    #[tokio::test]
    async fn pick_never_reuses_busy_files() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        let names = fill(&engine, 0, 3);
        engine.set_being_compacted(&names[1], true);
        let task = compactor.pick_compaction(0).expect("task");
        assert_eq!(task.input_files, vec![names[0].clone(), names[2].clone()]);

        for name in &names {
            engine.set_being_compacted(name, true);
        }
        assert!(compactor.pick_compaction(0).is_none());
    }

    #[tokio::test]
    async fn last_level_has_no_destination() {
        let engine = Arc::new(MemoryEngine::new(2));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 1, 3);
        assert!(compactor.pick_compaction(1).is_none());
        assert!(!compactor.schedule_across_levels());
        assert!(!compactor.check_capacities_satisfied());
    }

    #[tokio::test]
    async fn compression_and_fixed_size_flow_into_tasks() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = KapCompactor::new(
            Arc::clone(&engine),
            TokioExecutor::try_current().expect("runtime"),
            CapacityOptions::default().fixed_file_size(3 * MIB),
            CompactorOptions::default().compression(Compression::Zstd),
        )
        .expect("compactor");
        fill(&engine, 0, 2);
        let task = compactor.pick_compaction(0).expect("task");
        assert_eq!(task.compact_options.compression, Compression::Zstd);
        assert_eq!(task.compact_options.output_file_size_limit, 3 * MIB);
    }

    #[tokio::test]
    async fn invalid_capacity_is_rejected() {
        let engine = Arc::new(MemoryEngine::new(3));
        let result = KapCompactor::new(
            engine,
            TokioExecutor::try_current().expect("runtime"),
            CapacityOptions::default().kapacities(vec![0]),
            CompactorOptions::default(),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_converges_from_level0_overflow() {
        let engine = Arc::new(MemoryEngine::new(6));
        let capacity = CapacityOptions::default()
            .size_ratio(2)
            .kapacities(vec![1])
            .buffer_size(MIB);
        let compactor = compactor(&engine, capacity.clone());
        fill(&engine, 0, 5);
        assert!(!compactor.check_capacities_satisfied());

        let summary = compactor.drain().await.expect("drain");
        assert!(summary.rounds >= 1);
        assert_eq!(compactor.outstanding_task_count(), 0);
        assert!(compactor.check_capacities_satisfied());
        for (level, files) in engine.file_counts().into_iter().enumerate() {
            assert!(files as u64 <= capacity.kapacity(level), "level {level}");
        }
        let total: u64 = engine
            .column_family_metadata(DEFAULT_COLUMN_FAMILY)
            .levels
            .iter()
            .map(|level| level.size)
            .sum();
        assert_eq!(total, 5 * MIB);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn drain_gives_up_when_capacity_cannot_converge() {
        let engine = Arc::new(MemoryEngine::new(2));
        let compactor = KapCompactor::new(
            Arc::clone(&engine),
            TokioExecutor::try_current().expect("runtime"),
            CapacityOptions::default(),
            CompactorOptions::default()
                .max_drain_rounds(3)
                .poll_interval(Duration::from_millis(1)),
        )
        .expect("compactor");
        fill(&engine, 1, 2);
        let err = compactor.drain().await.expect_err("unsatisfiable");
        assert!(matches!(err, CompactionError::DrainExhausted { rounds: 3 }));
        assert_eq!(compactor.metrics().drain_rounds, 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn contention_failure_retries_once() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);
        engine.inject_failure(EngineErrorKind::Busy);
        let task = compactor.pick_compaction(0).expect("task");
        compactor.schedule_compaction(task.with_retry_on_fail(true));
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.failures_contention, 1);
        assert_eq!(metrics.retries_scheduled, 1);
        assert_eq!(metrics.tasks_scheduled, 2);
        assert_eq!(metrics.tasks_succeeded, 1);
        assert_eq!(engine.file_counts()[0], 0);
        assert_eq!(compactor.outstanding_task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn retried_task_is_not_retried_again() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);
        engine.inject_failure(EngineErrorKind::Aborted);
        engine.inject_failure(EngineErrorKind::Busy);
        let task = compactor.pick_compaction(0).expect("task");
        compactor.schedule_compaction(task.with_retry_on_fail(true));
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.failures_contention, 2);
        assert_eq!(metrics.retries_scheduled, 1);
        assert_eq!(metrics.tasks_scheduled, 2);
        assert_eq!(engine.file_counts()[0], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn io_failure_is_never_retried() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);
        engine.inject_failure(EngineErrorKind::Io);
        let task = compactor.pick_compaction(0).expect("task");
        compactor.schedule_compaction(task.with_retry_on_fail(true));
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.failures_io, 1);
        assert_eq!(metrics.retries_scheduled, 0);
        assert_eq!(metrics.tasks_scheduled, 1);
        assert_eq!(engine.file_counts()[0], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn contention_without_retry_flag_is_dropped() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);
        engine.inject_failure(EngineErrorKind::Busy);
        let task = compactor.pick_compaction(0).expect("task");
        compactor.schedule_compaction(task);
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.failures_contention, 1);
        assert_eq!(metrics.retries_scheduled, 0);
        assert_eq!(engine.file_counts()[0], 2);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ambiguous_failure_is_never_retried() {
        let engine = Arc::new(MemoryEngine::new(3));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);
        engine.inject_failure(EngineErrorKind::Other);
        let task = compactor.pick_compaction(0).expect("task");
        compactor.schedule_compaction(task.with_retry_on_fail(true));
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.failures_rejected, 1);
        assert_eq!(metrics.retries_scheduled, 0);
    }

    struct JitterEngine {
        inner: MemoryEngine,
    }

    impl StorageEngine for JitterEngine {
        fn column_family_metadata(&self, cf_name: &str) -> ColumnFamilyMetadata {
            self.inner.column_family_metadata(cf_name)
        }

        fn compact_files<'a>(
            &'a self,
            options: &'a CompactOptions,
            cf_name: &'a str,
            input_files: &'a [String],
            output_level: usize,
        ) -> CompactFuture<'a> {
            Box::pin(async move {
                tokio::time::sleep(Duration::from_millis(fastrand::u64(0..20))).await;
                self.inner
                    .compact_files(options, cf_name, input_files, output_level)
                    .await
            })
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_after_all_tasks_complete_in_any_order() {
        let engine = Arc::new(JitterEngine {
            inner: MemoryEngine::new(3),
        });
        let names: Vec<String> = (0..16)
            .map(|_| engine.inner.ingest(0, MIB).expect("level"))
            .collect();
        let compactor = KapCompactor::new(
            Arc::clone(&engine),
            TokioExecutor::try_current().expect("runtime"),
            CapacityOptions::default().kapacities(vec![16, 16]),
            CompactorOptions::default(),
        )
        .expect("compactor");

        for name in names {
            let task = CompactionTask::new(
                DEFAULT_COLUMN_FAMILY,
                0,
                1,
                vec![name],
                CompactOptions::default(),
            )
            .expect("task");
            compactor.schedule_compaction(task);
        }
        compactor.wait_until_idle().await;
        assert_eq!(compactor.outstanding_task_count(), 0);
        assert_eq!(compactor.metrics().tasks_succeeded, 16);
        assert_eq!(engine.inner.file_counts(), vec![0, 16, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn flush_under_write_stop_marks_task_retryable() {
        let engine = Arc::new(MemoryEngine::new(4).with_l0_stop_writes_trigger(2));
        let compactor = Arc::new(compactor(&engine, CapacityOptions::default()));
        engine.add_listener(&compactor);

        engine.flush(MIB);
        assert_eq!(compactor.outstanding_task_count(), 0);
        engine.inject_failure(EngineErrorKind::Busy);
        engine.flush(MIB);
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.flush_events, 2);
        assert_eq!(metrics.failures_contention, 1);
        assert_eq!(metrics.retries_scheduled, 1);
        assert!(compactor.check_capacities_satisfied());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn events_for_other_column_families_are_ignored() {
        let engine = Arc::new(MemoryEngine::new(3).with_cf_name("other"));
        let compactor = compactor(&engine, CapacityOptions::default());
        compactor.on_flush_completed(&FlushJobInfo {
            cf_name: "other".into(),
            file_name: "000001.sst".into(),
            triggered_writes_stop: false,
        });
        assert_eq!(compactor.metrics().flush_events, 0);
        assert_eq!(compactor.outstanding_task_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_wait_returns_once_idle() {
        let engine = Arc::new(MemoryEngine::new(3).with_merge_delay(Duration::from_millis(20)));
        let compactor = Arc::new(compactor(&engine, CapacityOptions::default()));
        fill(&engine, 0, 2);
        assert!(compactor.schedule_across_levels());
        assert_eq!(compactor.outstanding_task_count(), 1);

        let waiter = Arc::clone(&compactor);
        tokio::task::spawn_blocking(move || waiter.wait_until_idle_blocking())
            .await
            .expect("join");
        assert_eq!(compactor.outstanding_task_count(), 0);
        assert_eq!(engine.file_counts(), vec![0, 1, 0]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn back_to_back_rounds_never_share_inputs() {
        let engine = Arc::new(MemoryEngine::new(3).with_merge_delay(Duration::from_millis(20)));
        let compactor = compactor(&engine, CapacityOptions::default());
        fill(&engine, 0, 2);

        assert!(compactor.schedule_across_levels());
        assert!(!compactor.schedule_across_levels());
        assert_eq!(compactor.outstanding_task_count(), 1);
        compactor.wait_until_idle().await;

        let metrics = compactor.metrics();
        assert_eq!(metrics.tasks_scheduled, 1);
        assert_eq!(metrics.failures_contention, 0);
        assert_eq!(engine.admitted_merges().len(), 1);
        assert_eq!(engine.merges_rejected(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn pick_skips_inputs_of_unfinished_tasks() {
        let engine = Arc::new(MemoryEngine::new(3).with_merge_delay(Duration::from_millis(20)));
        let compactor = compactor(&engine, CapacityOptions::default().kapacities(vec![2]));
        let names = fill(&engine, 0, 4);
        let task = CompactionTask::new(
            DEFAULT_COLUMN_FAMILY,
            0,
            1,
            vec![names[0].clone()],
            CompactOptions::default(),
        )
        .expect("task");
        compactor.schedule_compaction(task);

        let picked = compactor.pick_compaction(0).expect("task");
        assert_eq!(picked.input_files, names[1..].to_vec());
        compactor.wait_until_idle().await;

        let picked = compactor.pick_compaction(0).expect("task");
        assert_eq!(picked.input_files, names[1..].to_vec());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn completion_events_cascade_into_deeper_levels() {
        let engine = Arc::new(MemoryEngine::new(4));
        let compactor = Arc::new(compactor(
            &engine,
            CapacityOptions::default().kapacities(vec![1, 1]),
        ));
        engine.add_listener(&compactor);

        engine.flush(MIB);
        engine.flush(MIB);
        compactor.wait_until_idle().await;
        assert_eq!(engine.file_counts(), vec![0, 1, 0, 0]);

        engine.flush(MIB);
        engine.flush(MIB);
        compactor.wait_until_idle().await;
        assert_eq!(engine.file_counts(), vec![0, 0, 1, 0]);

        let metrics = compactor.metrics();
        assert_eq!(metrics.drain_rounds, 0);
        assert_eq!(metrics.tasks_succeeded, 3);
        assert_eq!(metrics.compaction_events, 3);
        let relieved = engine.admitted_merges();
        assert_eq!(relieved.len(), 3);
        assert_eq!(relieved[2].len(), 2);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn flush_relieves_deeper_levels_first() {
        let engine = Arc::new(MemoryEngine::new(4));
        let compactor = Arc::new(compactor(&engine, CapacityOptions::default()));
        engine.add_listener(&compactor);
        let deep = fill(&engine, 1, 2);
        let shallow = fill(&engine, 0, 1);

        let flushed = engine.flush(MIB);
        assert_eq!(compactor.outstanding_task_count(), 2);
        compactor.wait_until_idle().await;

        let admitted = engine.admitted_merges();
        assert_eq!(admitted[0], deep);
        assert_eq!(admitted[1], vec![flushed, shallow[0].clone()]);
    }
}
