#![cfg(feature = "tokio")]

use std::{collections::HashSet, sync::Arc, time::Duration};

use kaplsm::{
    compaction::BulkLoadDriver,
    engine::{memory::MemoryEngine, StorageEngine},
    executor::tokio::TokioExecutor,
    CapacityOptions, CompactorOptions, KapCompactor,
};

const MIB: u64 = 1 << 20;

fn compactor(
    engine: &Arc<MemoryEngine>,
    capacity: CapacityOptions,
    options: CompactorOptions,
) -> Arc<KapCompactor<MemoryEngine, TokioExecutor>> {
    Arc::new(
        KapCompactor::new(
            Arc::clone(engine),
            TokioExecutor::try_current().expect("runtime"),
            capacity,
            options.poll_interval(Duration::from_millis(5)),
        )
        .expect("compactor"),
    )
}

fn total_bytes(engine: &MemoryEngine) -> u64 {
    engine
        .column_family_metadata(engine.cf_name())
        .levels
        .iter()
        .map(|level| level.size)
        .sum()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flush_cascade_settles_without_double_merging() {
    let engine = Arc::new(MemoryEngine::new(10).with_merge_delay(Duration::from_millis(2)));
    let capacity = CapacityOptions::default()
        .size_ratio(2)
        .kapacities(vec![2, 2, 2])
        .buffer_size(MIB);
    let compactor = compactor(&engine, capacity.clone(), CompactorOptions::default());
    engine.add_listener(&compactor);

    for _ in 0..20 {
        engine.flush(MIB);
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    compactor.drain().await.expect("drain");

    assert!(compactor.check_capacities_satisfied());
    assert_eq!(compactor.outstanding_task_count(), 0);
    for (level, files) in engine.file_counts().into_iter().enumerate() {
        assert!(files as u64 <= capacity.kapacity(level), "level {level}");
    }
    assert_eq!(total_bytes(&engine), 20 * MIB);

    let mut seen = HashSet::new();
    for inputs in engine.admitted_merges() {
        for name in inputs {
            assert!(seen.insert(name.clone()), "{name} merged twice");
        }
    }
    let metrics = compactor.metrics();
    assert_eq!(metrics.flush_events, 20);
    assert_eq!(metrics.tasks_succeeded, engine.merges_completed());
    assert_eq!(
        metrics.tasks_scheduled,
        metrics.tasks_succeeded + metrics.failures()
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bulk_load_persists_and_reopens() {
    let dir = tempfile::tempdir().expect("tempdir");
    let engine = Arc::new(MemoryEngine::new(6));
    for _ in 0..8 {
        engine.ingest(0, MIB).expect("level");
    }
    let capacity = CapacityOptions::default()
        .size_ratio(4)
        .kapacities(vec![1, 3])
        .num_keys(8 * 2048)
        .entry_size(512)
        .fixed_file_size(8 * MIB);
    let loader = compactor(&engine, capacity.clone(), CompactorOptions::default());
    BulkLoadDriver::new(Arc::clone(&loader), dir.path())
        .finish()
        .await
        .expect("finish");
    assert!(loader.check_capacities_satisfied());

    let reopened = CapacityOptions::load_from_dir(dir.path()).expect("reload");
    assert_eq!(reopened, capacity);
    let compactor = compactor(&engine, reopened, CompactorOptions::default());
    assert!(compactor.check_capacities_satisfied());
    assert_eq!(compactor.drain().await.expect("drain").rounds, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn named_column_family_is_enforced() {
    let engine = Arc::new(MemoryEngine::new(4).with_cf_name("users"));
    for _ in 0..3 {
        engine.ingest(0, MIB).expect("level");
    }
    let compactor = compactor(
        &engine,
        CapacityOptions::default(),
        CompactorOptions::default().cf_name("users"),
    );
    assert_eq!(compactor.cf_name(), "users");
    compactor.drain().await.expect("drain");
    assert_eq!(engine.file_counts()[0], 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn dropped_compactor_stops_reacting() {
    let engine = Arc::new(MemoryEngine::new(3));
    let compactor = compactor(&engine, CapacityOptions::default(), CompactorOptions::default());
    engine.add_listener(&compactor);
    drop(compactor);

    engine.flush(MIB);
    engine.flush(MIB);
    assert_eq!(engine.file_counts(), vec![2, 0, 0]);
    assert!(engine.admitted_merges().is_empty());
}
