//! nori-elastic: elastic task dispatch in front of an LSM engine.
//!
//! Client operations become tasks on lock-free queues. Worker pools sized
//! by backlog execute them against the engine and deliver each result on a
//! [`Completion`]. A companion admission controller decides how many
//! flush and compaction jobs the engine may run at once.
//!
//! # Architecture
//!
//! ```text
//!  put/delete/update/get              scan
//!          │                            │
//!          ▼                            ▼
//! ┌──────────────────┐        ┌──────────────────┐
//! │ transactional    │        │ analytical       │   lock-free MS queues
//! │ TaskQueue        │        │ TaskQueue        │
//! └────────┬─────────┘        └────────┬─────────┘
//!          │ activations               │ activations
//!          ▼                           ▼
//! ┌──────────────────┐        ┌──────────────────┐
//! │ transactional    │        │ analytical       │   elastic: min..=max,
//! │ pool             │        │ pool             │   doubles / halves
//! └────────┬─────────┘        └────────┬─────────┘
//!          └────────────┬──────────────┘
//!                       ▼
//!               StorageEngine (put/delete/get/iter_from)
//!                       │ request_flush / request_compaction
//!                       ▼
//!              ┌─────────────────────┐
//!              │ AdmissionController │──▶ flush pool (high, fixed)
//!              │ (BackgroundState)   │──▶ compaction pool (low, elastic)
//!              └─────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use nori_elastic::{ElasticConfig, ElasticLsm, ReadOptions, WriteOptions};
//! use nori_elastic::memory::{MemoryEngine, MemoryEngineOptions};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let db = ElasticLsm::open::<MemoryEngine>(
//!         MemoryEngineOptions::default(),
//!         ElasticConfig::default(),
//!         "/tmp/elastic",
//!         &[],
//!     )?;
//!
//!     db.put(&WriteOptions::default(), "key", "value")?.await?;
//!
//!     if let Some(value) = db.get(&ReadOptions::default(), "key")?.await? {
//!         println!("Value: {:?}", value);
//!     }
//!
//!     let visited = db
//!         .scan(&ReadOptions::default(), "a", 100, |key, _value| {
//!             println!("{:?}", key);
//!         })?
//!         .await?;
//!     println!("scanned {} records", visited);
//!
//!     db.shutdown();
//!     Ok(())
//! }
//! ```

pub mod admission;
pub mod completion;
pub mod config;
pub mod dispatcher;
pub mod elastic;
pub mod engine;
pub mod error;
pub mod memory;
pub mod observe;
pub mod pool;
pub mod queue;
pub mod stats;
pub mod task;

pub use admission::{
    AbortReason, AdmissionOutcome, AdmissionState, BackgroundState, CompactionBlock, Gate,
    JobLimits, JobPriority,
};
pub use completion::Completion;
pub use config::{ElasticConfig, ShutdownPolicy};
pub use elastic::PoolBounds;
pub use engine::{
    BackgroundWork, KvIter, OpenEngine, Partition, PartitionDescriptor, ReadOptions,
    StorageEngine, WriteOptions,
};
pub use error::{Error, Result};
pub use stats::StatsSnapshot;
pub use task::TaskKind;

use admission::AdmissionController;
use bytes::Bytes;
use dispatcher::{Dispatcher, LaneId};
use elastic::ElasticPool;
use observe::{ElasticEvent, Meter, NoopMeter, PoolEvt, PoolKind};
use pool::WorkerPool;
use stats::ElasticStats;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use task::{AnalyticalTask, Task, TransactionalTask};

/// Current thread counts of the four pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizes {
    pub transactional: usize,
    pub analytical: usize,
    pub compaction: usize,
    pub flush: usize,
}

/// Elastic execution layer wrapping one engine.
///
/// Every operation returns as soon as the task is queued. The outer
/// `Result` only reports whether the task was accepted; the engine's own
/// result arrives on the returned [`Completion`].
pub struct ElasticLsm {
    engine: Arc<dyn StorageEngine>,
    config: ElasticConfig,
    dispatcher: Arc<Dispatcher>,
    admission: Arc<AdmissionController>,
    flush_pool: Arc<WorkerPool>,
    compaction_pool: Arc<ElasticPool>,
    stats: Arc<ElasticStats>,
    meter: Arc<dyn Meter>,
    shutting_down: AtomicBool,
}

impl ElasticLsm {
    /// Opens an engine of type `E` at `path` and wraps it.
    pub fn open<E: OpenEngine>(
        engine_options: E::Options,
        config: ElasticConfig,
        path: impl AsRef<Path>,
        partitions: &[PartitionDescriptor],
    ) -> Result<Self> {
        config.validate()?;
        let engine = E::open(engine_options, path.as_ref(), partitions)?;
        Self::with_engine(Arc::new(engine), config)
    }

    /// Wraps an already opened engine.
    pub fn with_engine(engine: Arc<dyn StorageEngine>, config: ElasticConfig) -> Result<Self> {
        Self::with_meter(engine, config, Arc::new(NoopMeter))
    }

    /// Like [`ElasticLsm::with_engine`], reporting through `meter`.
    pub fn with_meter(
        engine: Arc<dyn StorageEngine>,
        config: ElasticConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        config.validate()?;
        if engine.background().is_none() {
            return Err(Error::InvalidArgument(
                "engine does not expose background work".to_string(),
            ));
        }

        let stats = Arc::new(ElasticStats::new());
        let flush_pool = Arc::new(WorkerPool::new(
            format!("{}-flush", config.thread_name_prefix),
            config.flush_threads,
        )?);
        let compaction_pool = Arc::new(ElasticPool::new(
            "compaction",
            config.compaction_bounds(),
            &config.thread_name_prefix,
        )?);

        let admission = Arc::new(AdmissionController::new(
            Arc::clone(&engine),
            Arc::clone(&flush_pool),
            Arc::clone(&compaction_pool),
            Arc::clone(&stats),
            Arc::clone(&meter),
        )?);
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&engine),
            &config,
            Arc::clone(&admission),
            Arc::clone(&stats),
            Arc::clone(&meter),
        )?);

        tracing::info!(
            max_threads = config.max_background_threads,
            min_transactional = config.min_transactional_threads,
            min_analytical = config.min_analytical_threads,
            min_compaction = config.min_compaction_threads,
            flush_threads = config.flush_threads,
            "Opened elastic layer"
        );

        let db = Self {
            engine,
            config,
            dispatcher,
            admission,
            flush_pool,
            compaction_pool,
            stats,
            meter,
            shutting_down: AtomicBool::new(false),
        };

        // Demand recorded while the engine was opening
        db.admission.maybe_schedule();
        Ok(db)
    }

    fn accept(&self, kind: TaskKind) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            self.stats.record_abandoned(kind);
            return Err(Error::ShuttingDown);
        }
        Ok(())
    }

    pub fn put(
        &self,
        options: &WriteOptions,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion<()>> {
        self.put_in(options, &self.engine.default_partition(), key, value)
    }

    pub fn put_in(
        &self,
        options: &WriteOptions,
        partition: &Partition,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion<()>> {
        self.accept(TaskKind::Put)?;
        let (done, completion) = completion::channel();
        self.dispatcher.enqueue(Task::Transactional(TransactionalTask::Put {
            options: options.clone(),
            partition: partition.clone(),
            key: key.into(),
            value: value.into(),
            done,
        }));
        Ok(completion)
    }

    pub fn delete(&self, options: &WriteOptions, key: impl Into<Bytes>) -> Result<Completion<()>> {
        self.delete_in(options, &self.engine.default_partition(), key)
    }

    pub fn delete_in(
        &self,
        options: &WriteOptions,
        partition: &Partition,
        key: impl Into<Bytes>,
    ) -> Result<Completion<()>> {
        self.accept(TaskKind::Delete)?;
        let (done, completion) = completion::channel();
        self.dispatcher.enqueue(Task::Transactional(TransactionalTask::Delete {
            options: options.clone(),
            partition: partition.clone(),
            key: key.into(),
            done,
        }));
        Ok(completion)
    }

    /// Overwrites `key`. Executes as a put but is counted separately.
    pub fn update(
        &self,
        options: &WriteOptions,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion<()>> {
        self.update_in(options, &self.engine.default_partition(), key, value)
    }

    pub fn update_in(
        &self,
        options: &WriteOptions,
        partition: &Partition,
        key: impl Into<Bytes>,
        value: impl Into<Bytes>,
    ) -> Result<Completion<()>> {
        self.accept(TaskKind::Update)?;
        let (done, completion) = completion::channel();
        self.dispatcher.enqueue(Task::Transactional(TransactionalTask::Update {
            options: options.clone(),
            partition: partition.clone(),
            key: key.into(),
            value: value.into(),
            done,
        }));
        Ok(completion)
    }

    pub fn get(
        &self,
        options: &ReadOptions,
        key: impl Into<Bytes>,
    ) -> Result<Completion<Option<Bytes>>> {
        self.get_in(options, &self.engine.default_partition(), key)
    }

    pub fn get_in(
        &self,
        options: &ReadOptions,
        partition: &Partition,
        key: impl Into<Bytes>,
    ) -> Result<Completion<Option<Bytes>>> {
        self.accept(TaskKind::Get)?;
        let (done, completion) = completion::channel();
        self.dispatcher.enqueue(Task::Transactional(TransactionalTask::Get {
            options: options.clone(),
            partition: partition.clone(),
            key: key.into(),
            done,
        }));
        Ok(completion)
    }

    /// Queues a get and blocks until it completes. Not for async contexts.
    pub fn get_blocking(
        &self,
        options: &ReadOptions,
        key: impl Into<Bytes>,
    ) -> Result<Option<Bytes>> {
        self.get(options, key)?.wait()
    }

    /// Calls `callback` for up to `record_limit` records starting at
    /// `start_key`, in ascending key order, on a worker thread. Resolves
    /// with the number of records visited.
    pub fn scan<F>(
        &self,
        options: &ReadOptions,
        start_key: impl Into<Bytes>,
        record_limit: usize,
        callback: F,
    ) -> Result<Completion<usize>>
    where
        F: FnMut(&[u8], &[u8]) + Send + 'static,
    {
        self.scan_in(
            options,
            &self.engine.default_partition(),
            start_key,
            record_limit,
            callback,
        )
    }

    pub fn scan_in<F>(
        &self,
        options: &ReadOptions,
        partition: &Partition,
        start_key: impl Into<Bytes>,
        record_limit: usize,
        callback: F,
    ) -> Result<Completion<usize>>
    where
        F: FnMut(&[u8], &[u8]) + Send + 'static,
    {
        self.accept(TaskKind::Scan)?;
        let (done, completion) = completion::channel();
        self.dispatcher.enqueue(Task::Analytical(AnalyticalTask::Scan {
            options: options.clone(),
            partition: partition.clone(),
            start_key: start_key.into(),
            record_limit,
            callback: Box::new(callback),
            done,
        }));
        Ok(completion)
    }

    pub fn default_partition(&self) -> Partition {
        self.engine.default_partition()
    }

    pub fn partition(&self, name: &str) -> Result<Partition> {
        self.engine
            .partition(name)
            .ok_or_else(|| Error::PartitionNotFound(name.to_string()))
    }

    pub fn engine(&self) -> &Arc<dyn StorageEngine> {
        &self.engine
    }

    pub fn config(&self) -> &ElasticConfig {
        &self.config
    }

    pub fn pool_sizes(&self) -> PoolSizes {
        PoolSizes {
            transactional: self.dispatcher.pool_threads(LaneId::Transactional),
            analytical: self.dispatcher.pool_threads(LaneId::Analytical),
            compaction: self.compaction_pool.current_threads(),
            flush: self.flush_pool.threads(),
        }
    }

    /// Tasks queued and not yet picked up by a worker.
    pub fn pending_tasks(&self) -> usize {
        self.dispatcher.pending(LaneId::Transactional) + self.dispatcher.pending(LaneId::Analytical)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn admission_snapshot(&self) -> AdmissionState {
        self.engine
            .background()
            .map(|bg| bg.state().snapshot())
            .unwrap_or_default()
    }

    /// Runs the admission controller now, e.g. after resuming paused work.
    pub fn maybe_schedule_background_work(&self) -> AdmissionOutcome {
        self.admission.maybe_schedule()
    }

    /// Stops accepting work and joins every pool. Queued tasks run or fail
    /// per [`ShutdownPolicy`]. Idempotent; also runs on drop. Must not be
    /// called from a scan callback.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }

        let policy = self.config.shutdown_policy;
        tracing::info!(
            ?policy,
            pending = self.pending_tasks(),
            "Shutting down elastic layer"
        );

        if let Some(bg) = self.engine.background() {
            bg.state().begin_shutdown();
        }

        let mut abandoned = match policy {
            ShutdownPolicy::Drain => 0,
            ShutdownPolicy::Abandon => self.dispatcher.abandon_queued(),
        };
        abandoned += self.dispatcher.shutdown();

        self.flush_pool.shutdown();
        self.compaction_pool.shutdown();

        self.meter.emit(ElasticEvent::Pool(PoolEvt {
            pool: "all",
            kind: PoolKind::Shutdown { abandoned },
        }));
        tracing::info!(abandoned, "Elastic layer shut down");
    }
}

impl Drop for ElasticLsm {
    fn drop(&mut self) {
        self.shutdown();
    }
}
