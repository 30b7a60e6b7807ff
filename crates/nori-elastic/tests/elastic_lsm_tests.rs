//! End-to-end tests for the elastic layer over the in-memory engine.
//!
//! Covers:
//! - Point operations resolve through completions (async and blocking)
//! - Scans honor record limits, start keys and upper bounds
//! - Partitions route to the right key space
//! - Engines without background hooks are rejected
//! - Shutdown drains or abandons queued work and rejects new calls

use bytes::Bytes;
use nori_elastic::memory::{MemoryEngine, MemoryEngineOptions};
use nori_elastic::{
    ElasticConfig, ElasticLsm, Error, KvIter, OpenEngine, Partition, PartitionDescriptor,
    ReadOptions, ShutdownPolicy, StorageEngine, TaskKind, WriteOptions,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn open_db(config: ElasticConfig) -> (ElasticLsm, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let db = ElasticLsm::open::<MemoryEngine>(
        MemoryEngineOptions::default(),
        config,
        temp_dir.path(),
        &[PartitionDescriptor::new("events")],
    )
    .unwrap();
    (db, temp_dir)
}

fn small_config() -> ElasticConfig {
    ElasticConfig {
        max_background_threads: 8,
        ..Default::default()
    }
}

// ============================================================================
// Point operations
// ============================================================================

#[tokio::test]
async fn test_put_get_delete_roundtrip() {
    let (db, _dir) = open_db(small_config());
    let w = WriteOptions::default();
    let r = ReadOptions::default();

    db.put(&w, "alpha", "1").unwrap().await.unwrap();
    assert_eq!(
        db.get(&r, "alpha").unwrap().await.unwrap(),
        Some(Bytes::from("1"))
    );

    db.update(&w, "alpha", "2").unwrap().await.unwrap();
    assert_eq!(
        db.get(&r, "alpha").unwrap().await.unwrap(),
        Some(Bytes::from("2"))
    );

    db.delete(&w, "alpha").unwrap().await.unwrap();
    assert_eq!(db.get(&r, "alpha").unwrap().await.unwrap(), None);

    let stats = db.stats();
    assert_eq!(stats.task(TaskKind::Put).completed, 1);
    assert_eq!(stats.task(TaskKind::Update).completed, 1);
    assert_eq!(stats.task(TaskKind::Delete).completed, 1);
    assert_eq!(stats.task(TaskKind::Get).completed, 3);

    db.shutdown();
}

#[test]
fn test_get_blocking() {
    let (db, _dir) = open_db(small_config());

    db.put(&WriteOptions::default(), "k", "v").unwrap().wait().unwrap();
    assert_eq!(
        db.get_blocking(&ReadOptions::default(), "k").unwrap(),
        Some(Bytes::from("v"))
    );
    assert_eq!(db.get_blocking(&ReadOptions::default(), "missing").unwrap(), None);
}

#[tokio::test]
async fn test_many_concurrent_writes_all_complete() {
    let (db, _dir) = open_db(small_config());
    let w = WriteOptions::default();

    let completions: Vec<_> = (0..1000)
        .map(|i| {
            db.put(&w, format!("key_{:04}", i), format!("value_{}", i))
                .unwrap()
        })
        .collect();
    for completion in completions {
        completion.await.unwrap();
    }

    for i in (0..1000).step_by(97) {
        let value = db
            .get(&ReadOptions::default(), format!("key_{:04}", i))
            .unwrap()
            .await
            .unwrap();
        assert_eq!(value, Some(Bytes::from(format!("value_{}", i))));
    }

    let sizes = db.pool_sizes();
    assert!((2..=8).contains(&sizes.transactional));
    assert!((2..=8).contains(&sizes.analytical));
    assert!((2..=8).contains(&sizes.compaction));
    assert_eq!(sizes.flush, 1);
    assert_eq!(db.stats().put.completed, 1000);
}

// ============================================================================
// Scans
// ============================================================================

#[tokio::test]
async fn test_scan_limit_visits_records_in_order() {
    let (db, _dir) = open_db(small_config());
    let w = WriteOptions::default();
    for i in 0..10 {
        db.put(&w, format!("k{}", i), format!("v{}", i))
            .unwrap()
            .await
            .unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let visited = db
        .scan(&ReadOptions::default(), "k0", 3, move |key, value| {
            sink.lock().unwrap().push((key.to_vec(), value.to_vec()));
        })
        .unwrap()
        .await
        .unwrap();

    assert_eq!(visited, 3);
    let seen = seen.lock().unwrap();
    assert_eq!(
        *seen,
        vec![
            (b"k0".to_vec(), b"v0".to_vec()),
            (b"k1".to_vec(), b"v1".to_vec()),
            (b"k2".to_vec(), b"v2".to_vec()),
        ]
    );
    assert_eq!(db.stats().scanned_records, 3);
}

#[tokio::test]
async fn test_scan_starts_mid_range_and_stops_at_end() {
    let (db, _dir) = open_db(small_config());
    for i in 0..10 {
        db.put(&WriteOptions::default(), format!("k{}", i), "v")
            .unwrap()
            .await
            .unwrap();
    }

    let keys = Arc::new(Mutex::new(Vec::new()));
    let sink = keys.clone();
    let visited = db
        .scan(&ReadOptions::default(), "k7", 100, move |key, _| {
            sink.lock().unwrap().push(key.to_vec());
        })
        .unwrap()
        .await
        .unwrap();

    assert_eq!(visited, 3);
    assert_eq!(
        *keys.lock().unwrap(),
        vec![b"k7".to_vec(), b"k8".to_vec(), b"k9".to_vec()]
    );
}

#[tokio::test]
async fn test_scan_respects_upper_bound_and_zero_limit() {
    let (db, _dir) = open_db(small_config());
    for key in ["a", "b", "c", "d"] {
        db.put(&WriteOptions::default(), key, "v")
            .unwrap()
            .await
            .unwrap();
    }

    let bounded = db
        .scan(&ReadOptions::with_upper_bound("c"), "a", 10, |_, _| {})
        .unwrap()
        .await
        .unwrap();
    assert_eq!(bounded, 2);

    let none = db
        .scan(&ReadOptions::default(), "a", 0, |_, _| {})
        .unwrap()
        .await
        .unwrap();
    assert_eq!(none, 0);
}

#[tokio::test]
async fn test_panicking_scan_callbacks_do_not_wedge_lane() {
    let (db, _dir) = open_db(ElasticConfig {
        max_background_threads: 2,
        min_analytical_threads: 2,
        ..Default::default()
    });
    db.put(&WriteOptions::default(), "k", "v")
        .unwrap()
        .await
        .unwrap();

    // One panic per analytical thread
    for _ in 0..2 {
        let result = db
            .scan(&ReadOptions::default(), "", 10, |_, _| {
                panic!("callback failure")
            })
            .unwrap()
            .await;
        assert!(matches!(result, Err(Error::Engine(_))));
    }

    let visited = tokio::time::timeout(
        Duration::from_secs(5),
        db.scan(&ReadOptions::default(), "", 10, |_, _| {}).unwrap(),
    )
    .await
    .expect("scan stranded after callback panics")
    .unwrap();
    assert_eq!(visited, 1);

    let stats = db.stats();
    assert_eq!(stats.scan.failed, 2);
    assert_eq!(stats.scan.completed, 1);
    assert_eq!(db.pending_tasks(), 0);
}

// ============================================================================
// Partitions
// ============================================================================

#[tokio::test]
async fn test_partitions_route_operations() {
    let (db, _dir) = open_db(small_config());
    let events = db.partition("events").unwrap();
    let w = WriteOptions::default();
    let r = ReadOptions::default();

    db.put_in(&w, &events, "k", "in-events").unwrap().await.unwrap();
    db.put(&w, "k", "in-default").unwrap().await.unwrap();

    assert_eq!(
        db.get_in(&r, &events, "k").unwrap().await.unwrap(),
        Some(Bytes::from("in-events"))
    );
    assert_eq!(
        db.get(&r, "k").unwrap().await.unwrap(),
        Some(Bytes::from("in-default"))
    );

    db.delete_in(&w, &events, "k").unwrap().await.unwrap();
    assert_eq!(db.get_in(&r, &events, "k").unwrap().await.unwrap(), None);
    assert!(db.get(&r, "k").unwrap().await.unwrap().is_some());

    assert!(matches!(
        db.partition("nope"),
        Err(Error::PartitionNotFound(_))
    ));
}

#[tokio::test]
async fn test_unknown_partition_fails_task_not_call() {
    let (db, _dir) = open_db(small_config());
    let bogus = Partition::new(42, "bogus");

    let completion = db
        .put_in(&WriteOptions::default(), &bogus, "k", "v")
        .unwrap();
    assert!(matches!(completion.await, Err(Error::PartitionNotFound(_))));
    assert_eq!(db.stats().put.failed, 1);
}

// ============================================================================
// Construction
// ============================================================================

/// Engine that serves reads and writes but exposes no background hooks.
struct ForegroundOnly;

impl StorageEngine for ForegroundOnly {
    fn put(
        &self,
        _: &WriteOptions,
        _: &Partition,
        _: &[u8],
        _: &[u8],
    ) -> nori_elastic::Result<()> {
        Ok(())
    }
    fn delete(&self, _: &WriteOptions, _: &Partition, _: &[u8]) -> nori_elastic::Result<()> {
        Ok(())
    }
    fn get(
        &self,
        _: &ReadOptions,
        _: &Partition,
        _: &[u8],
    ) -> nori_elastic::Result<Option<Bytes>> {
        Ok(None)
    }
    fn iter_from<'a>(
        &'a self,
        _: &ReadOptions,
        _: &Partition,
        _: &[u8],
    ) -> nori_elastic::Result<KvIter<'a>> {
        Ok(Box::new(std::iter::empty()))
    }
    fn default_partition(&self) -> Partition {
        Partition::new(0, "default")
    }
    fn partition(&self, _: &str) -> Option<Partition> {
        None
    }
}

#[test]
fn test_engine_without_background_work_is_rejected() {
    let result = ElasticLsm::with_engine(Arc::new(ForegroundOnly), ElasticConfig::default());
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[test]
fn test_invalid_config_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config = ElasticConfig {
        max_background_threads: 1,
        ..Default::default()
    };
    let result = ElasticLsm::open::<MemoryEngine>(
        MemoryEngineOptions::default(),
        config,
        temp_dir.path(),
        &[],
    );
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_with_engine_wraps_open_engine() {
    let engine = MemoryEngine::open(
        MemoryEngineOptions::default(),
        std::path::Path::new("unused"),
        &[],
    )
    .unwrap();
    let db = ElasticLsm::with_engine(Arc::new(engine), small_config()).unwrap();

    assert_eq!(db.default_partition().name(), "default");
    assert!(db.admission_snapshot().opened);
    let sizes = db.pool_sizes();
    assert_eq!(sizes.transactional, 2);
    assert_eq!(sizes.analytical, 2);
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_drain_shutdown_runs_queued_tasks() {
    let (db, _dir) = open_db(ElasticConfig {
        max_background_threads: 2,
        shutdown_policy: ShutdownPolicy::Drain,
        ..Default::default()
    });

    let completions: Vec<_> = (0..500)
        .map(|i| db.put(&WriteOptions::default(), format!("k{}", i), "v").unwrap())
        .collect();
    db.shutdown();

    for completion in completions {
        completion.wait().unwrap();
    }
    assert_eq!(db.stats().put.completed, 500);
    assert_eq!(db.pending_tasks(), 0);
}

#[test]
fn test_abandon_shutdown_fails_or_completes_every_task() {
    let (db, _dir) = open_db(ElasticConfig {
        max_background_threads: 2,
        shutdown_policy: ShutdownPolicy::Abandon,
        ..Default::default()
    });

    let completions: Vec<_> = (0..2000)
        .map(|i| db.put(&WriteOptions::default(), format!("k{}", i), "v").unwrap())
        .collect();
    db.shutdown();

    let mut completed = 0;
    let mut abandoned = 0;
    for completion in completions {
        match completion.wait() {
            Ok(()) => completed += 1,
            Err(Error::ShuttingDown) => abandoned += 1,
            Err(e) => panic!("unexpected error: {}", e),
        }
    }
    assert_eq!(completed + abandoned, 2000);

    let stats = db.stats();
    assert_eq!(stats.put.completed, completed);
    assert_eq!(stats.put.abandoned, abandoned);
}

#[test]
fn test_calls_after_shutdown_are_rejected() {
    let (db, _dir) = open_db(small_config());
    db.shutdown();
    db.shutdown();

    assert!(matches!(
        db.put(&WriteOptions::default(), "k", "v"),
        Err(Error::ShuttingDown)
    ));
    assert!(matches!(
        db.scan(&ReadOptions::default(), "", 1, |_, _| {}),
        Err(Error::ShuttingDown)
    ));
    assert!(db.admission_snapshot().shutting_down);
}
