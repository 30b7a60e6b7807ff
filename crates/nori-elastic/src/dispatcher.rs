//! Task dispatch onto the elastic pools.
//!
//! Each lane pairs a lock-free [`TaskQueue`] with an [`ElasticPool`]. Work
//! is driven by *activations*: pool jobs that run one task and then either
//! resubmit themselves or go idle.
//!
//! ```text
//!  client ──push──▶ TaskQueue ──try_pop──▶ activation ──▶ engine
//!     │                                        │
//!     └──wake (if a slot is free)──▶ pool ◀────┘ resubmit while non-empty
//! ```
//!
//! A lane never has more activations in flight than its pool has threads.
//! A producer only wakes an activation when a slot is free; an activation
//! that goes idle releases its slot and then re-checks the queue. Both
//! sides use `SeqCst`, so either the producer sees the released slot or
//! the releasing activation sees the new task. Nothing is stranded.

use crate::admission::AdmissionController;
use crate::completion::Responder;
use crate::config::ElasticConfig;
use crate::elastic::{ElasticPool, Resize};
use crate::engine::{Partition, ReadOptions, StorageEngine};
use crate::error::{Error, Result};
use crate::observe::{
    Counter, ElasticEvent, Gauge, Histogram, Meter, TaskEvt, TaskOutcome,
    TASK_LATENCY_BUCKETS_MS,
};
use crate::queue::TaskQueue;
use crate::stats::ElasticStats;
use crate::task::{AnalyticalTask, ScanCallback, Task, TaskKind, TransactionalTask};
use crossbeam_utils::CachePadded;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaneId {
    Transactional,
    Analytical,
}

struct Lane {
    queue: TaskQueue<Task>,
    pool: ElasticPool,
    /// Activations submitted or running. Bounded by the pool size.
    activations: CachePadded<AtomicUsize>,
    threads_gauge: Box<dyn Gauge>,
    latency: Box<dyn Histogram>,
    failed: Box<dyn Counter>,
}

impl Lane {
    fn new(
        pool: ElasticPool,
        labels: &'static [(&'static str, &'static str)],
        meter: &dyn Meter,
    ) -> Self {
        let threads_gauge = meter.gauge("elastic_pool_threads", labels);
        threads_gauge.set(pool.current_threads() as i64);

        Self {
            queue: TaskQueue::new(),
            pool,
            activations: CachePadded::new(AtomicUsize::new(0)),
            threads_gauge,
            latency: meter.histo("elastic_task_latency_ms", TASK_LATENCY_BUCKETS_MS, labels),
            failed: meter.counter("elastic_tasks_failed_total", labels),
        }
    }
}

pub struct Dispatcher {
    engine: Arc<dyn StorageEngine>,
    transactional: Lane,
    analytical: Lane,
    admission: Arc<AdmissionController>,
    stats: Arc<ElasticStats>,
    meter: Arc<dyn Meter>,
    closed: AtomicBool,
}

impl Dispatcher {
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        config: &ElasticConfig,
        admission: Arc<AdmissionController>,
        stats: Arc<ElasticStats>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        let prefix = &config.thread_name_prefix;
        let transactional = Lane::new(
            ElasticPool::new("transactional", config.transactional_bounds(), prefix)?,
            &[("pool", "transactional")],
            meter.as_ref(),
        );
        let analytical = Lane::new(
            ElasticPool::new("analytical", config.analytical_bounds(), prefix)?,
            &[("pool", "analytical")],
            meter.as_ref(),
        );

        Ok(Self {
            engine,
            transactional,
            analytical,
            admission,
            stats,
            meter,
            closed: AtomicBool::new(false),
        })
    }

    fn lane(&self, id: LaneId) -> &Lane {
        match id {
            LaneId::Transactional => &self.transactional,
            LaneId::Analytical => &self.analytical,
        }
    }

    /// Queues `task` on its lane and wakes an activation if a slot is free.
    pub fn enqueue(self: &Arc<Self>, task: Task) {
        let id = match &task {
            Task::Transactional(_) => LaneId::Transactional,
            Task::Analytical(_) => LaneId::Analytical,
        };
        let kind = task.kind();

        self.lane(id).queue.push(task);
        self.stats.record_enqueued(kind);
        tracing::trace!(task = %kind, "Enqueued task");

        self.wake(id);

        // Lost the race with shutdown: nobody will run what we just queued
        if self.closed.load(Ordering::SeqCst) {
            self.abandon_queued();
        }
    }

    /// Reserves an activation slot and submits an activation. Returns false
    /// if every slot is taken or the pool is gone.
    fn wake(self: &Arc<Self>, id: LaneId) -> bool {
        let lane = self.lane(id);
        let mut active = lane.activations.load(Ordering::SeqCst);
        loop {
            if active >= lane.pool.current_threads() {
                return false;
            }
            match lane.activations.compare_exchange(
                active,
                active + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => active = actual,
            }
        }

        let this = Arc::clone(self);
        if let Err(e) = lane.pool.submit(Box::new(move || this.activate(id))) {
            lane.activations.fetch_sub(1, Ordering::SeqCst);
            tracing::trace!(pool = lane.pool.name(), error = %e, "Activation rejected");
            return false;
        }
        true
    }

    fn release(self: &Arc<Self>, id: LaneId) {
        let lane = self.lane(id);
        lane.activations.fetch_sub(1, Ordering::SeqCst);
        if !lane.queue.is_empty() {
            self.wake(id);
        }
    }

    /// One dispatcher step: resize, run at most one task, then resubmit or
    /// go idle.
    fn activate(self: &Arc<Self>, id: LaneId) {
        let lane = self.lane(id);
        let pending = lane.queue.len();

        match lane.pool.adjust(pending) {
            Ok(Resize::Unchanged) => {}
            Ok(resize @ Resize::Grew { from, to }) | Ok(resize @ Resize::Shrank { from, to }) => {
                self.stats.record_resize();
                lane.threads_gauge.set(to as i64);
                self.meter
                    .emit(ElasticEvent::pool_resized(lane.pool.name(), from, to));

                // New threads are idle until someone submits to them
                let extra = resize.added().min(pending.saturating_sub(1));
                for _ in 0..extra {
                    if !self.wake(id) {
                        break;
                    }
                }
            }
            Err(e) => {
                tracing::warn!(pool = lane.pool.name(), error = %e, "Failed to resize pool");
            }
        }

        let Some(task) = lane.queue.try_pop() else {
            tracing::trace!(pool = lane.pool.name(), "Activation found no work");
            self.release(id);
            return;
        };

        let kind = task.kind();
        self.execute(lane, task);
        if kind.is_write() {
            self.admission.maybe_schedule();
        }

        if lane.queue.is_empty() {
            self.release(id);
            return;
        }

        // Keep the slot and continue as a fresh job so other work interleaves
        let this = Arc::clone(self);
        if lane.pool.submit(Box::new(move || this.activate(id))).is_err() {
            self.release(id);
        }
    }

    fn execute(&self, lane: &Lane, task: Task) {
        let kind = task.kind();
        let started = Instant::now();

        match task {
            Task::Transactional(TransactionalTask::Put {
                options,
                partition,
                key,
                value,
                done,
            })
            | Task::Transactional(TransactionalTask::Update {
                options,
                partition,
                key,
                value,
                done,
            }) => {
                let result = guarded(kind, || self.engine.put(&options, &partition, &key, &value));
                self.respond(lane, kind, started, done, result);
            }
            Task::Transactional(TransactionalTask::Delete {
                options,
                partition,
                key,
                done,
            }) => {
                let result = guarded(kind, || self.engine.delete(&options, &partition, &key));
                self.respond(lane, kind, started, done, result);
            }
            Task::Transactional(TransactionalTask::Get {
                options,
                partition,
                key,
                done,
            }) => {
                let result = guarded(kind, || self.engine.get(&options, &partition, &key));
                self.respond(lane, kind, started, done, result);
            }
            Task::Analytical(AnalyticalTask::Scan {
                options,
                partition,
                start_key,
                record_limit,
                mut callback,
                done,
            }) => {
                let result = guarded(kind, || {
                    self.scan(&options, &partition, &start_key, record_limit, &mut callback)
                });
                if let Ok(records) = result {
                    self.stats.record_scanned(records);
                }
                self.respond(lane, kind, started, done, result);
            }
        }
    }

    /// Feeds up to `record_limit` records at or after `start_key` to the
    /// callback, stopping early at the end of the range or at the read
    /// options' upper bound.
    fn scan(
        &self,
        options: &ReadOptions,
        partition: &Partition,
        start_key: &[u8],
        record_limit: usize,
        callback: &mut ScanCallback,
    ) -> Result<usize> {
        if record_limit == 0 {
            return Ok(0);
        }

        let iter = self.engine.iter_from(options, partition, start_key)?;
        let mut delivered = 0;
        for entry in iter {
            let (key, value) = entry?;
            if let Some(upper) = &options.upper_bound {
                if key[..] >= upper[..] {
                    break;
                }
            }

            callback(&key[..], &value[..]);
            delivered += 1;
            if delivered == record_limit {
                break;
            }
        }
        Ok(delivered)
    }

    fn respond<T>(
        &self,
        lane: &Lane,
        kind: TaskKind,
        started: Instant,
        done: Responder<T>,
        result: Result<T>,
    ) {
        let outcome = match &result {
            Ok(_) => {
                let elapsed = started.elapsed();
                self.stats.record_completed(kind);
                lane.latency.observe(elapsed.as_secs_f64() * 1000.0);
                TaskOutcome::Completed {
                    micros: elapsed.as_micros() as u64,
                }
            }
            Err(e) => {
                self.stats.record_failed(kind);
                lane.failed.inc(1);
                tracing::warn!(task = %kind, error = %e, "Task failed");
                TaskOutcome::Failed
            }
        };
        self.meter.emit(ElasticEvent::Task(TaskEvt { kind, outcome }));

        if !done.send(result) {
            tracing::trace!(task = %kind, "Caller dropped completion before result");
        }
    }

    /// Fails every queued task with `ShuttingDown`. Returns how many.
    pub fn abandon_queued(&self) -> usize {
        let mut abandoned = 0;
        for lane in [&self.transactional, &self.analytical] {
            while let Some(task) = lane.queue.try_pop() {
                let kind = task.kind();
                self.stats.record_abandoned(kind);
                self.meter.emit(ElasticEvent::Task(TaskEvt {
                    kind,
                    outcome: TaskOutcome::Abandoned,
                }));
                task.fail(Error::ShuttingDown);
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Lets both lanes finish their in-flight activations, joins their
    /// workers and fails anything that slipped in afterwards.
    pub fn shutdown(&self) -> usize {
        self.transactional.pool.shutdown();
        self.analytical.pool.shutdown();
        self.closed.store(true, Ordering::SeqCst);
        self.abandon_queued()
    }

    pub fn pending(&self, id: LaneId) -> usize {
        self.lane(id).queue.len()
    }

    pub fn pool_threads(&self, id: LaneId) -> usize {
        self.lane(id).pool.current_threads()
    }

    pub fn active_activations(&self, id: LaneId) -> usize {
        self.lane(id).activations.load(Ordering::SeqCst)
    }
}

/// Runs an engine call or scan. A panic in the engine or in a scan
/// callback becomes a task error; the activation still releases or
/// resubmits its slot.
fn guarded<T>(kind: TaskKind, f: impl FnOnce() -> Result<T>) -> Result<T> {
    panic::catch_unwind(AssertUnwindSafe(f))
        .unwrap_or_else(|_| Err(Error::engine(format!("{} task panicked", kind))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::channel;
    use crate::engine::{OpenEngine, PartitionDescriptor, WriteOptions};
    use crate::memory::{MemoryEngine, MemoryEngineOptions};
    use crate::observe::NoopMeter;
    use crate::pool::WorkerPool;
    use bytes::Bytes;
    use std::path::Path;
    use std::time::Duration;

    fn dispatcher(config: &ElasticConfig) -> (Arc<Dispatcher>, Arc<dyn StorageEngine>) {
        let engine: Arc<dyn StorageEngine> = Arc::new(
            MemoryEngine::open(
                MemoryEngineOptions::default(),
                Path::new("unused"),
                &[PartitionDescriptor::default()],
            )
            .unwrap(),
        );
        let stats = Arc::new(ElasticStats::new());
        let meter: Arc<dyn Meter> = Arc::new(NoopMeter);
        let admission = Arc::new(
            AdmissionController::new(
                engine.clone(),
                Arc::new(WorkerPool::new("test-flush", 1).unwrap()),
                Arc::new(
                    ElasticPool::new("compaction", config.compaction_bounds(), "test").unwrap(),
                ),
                stats.clone(),
                meter.clone(),
            )
            .unwrap(),
        );
        let dispatcher =
            Arc::new(Dispatcher::new(engine.clone(), config, admission, stats, meter).unwrap());
        (dispatcher, engine)
    }

    fn put_task(partition: &Partition, key: &str) -> (Task, crate::Completion<()>) {
        let (done, completion) = channel();
        let task = Task::Transactional(TransactionalTask::Put {
            options: WriteOptions::default(),
            partition: partition.clone(),
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: Bytes::from_static(b"v"),
            done,
        });
        (task, completion)
    }

    #[test]
    fn test_burst_grows_pool_and_drains() {
        let config = ElasticConfig {
            max_background_threads: 8,
            min_transactional_threads: 2,
            ..Default::default()
        };
        let (dispatcher, engine) = dispatcher(&config);
        let partition = engine.default_partition();

        let completions: Vec<_> = (0..200)
            .map(|i| {
                let (task, completion) = put_task(&partition, &format!("key{:04}", i));
                dispatcher.enqueue(task);
                completion
            })
            .collect();

        for completion in completions {
            completion.wait().unwrap();
        }

        let threads = dispatcher.pool_threads(LaneId::Transactional);
        assert!((2..=8).contains(&threads));
        assert_eq!(dispatcher.pending(LaneId::Transactional), 0);

        let deadline = Instant::now() + Duration::from_secs(5);
        while dispatcher.active_activations(LaneId::Transactional) > 0 && Instant::now() < deadline
        {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(dispatcher.active_activations(LaneId::Transactional), 0);

        let value = engine
            .get(&ReadOptions::default(), &partition, b"key0199")
            .unwrap();
        assert_eq!(value, Some(Bytes::from_static(b"v")));

        dispatcher.shutdown();
    }

    #[test]
    fn test_abandon_fails_queued_tasks() {
        let (dispatcher, engine) = dispatcher(&ElasticConfig::default());
        let partition = engine.default_partition();

        // Queue directly, bypassing wake, so nothing runs the task
        let (task, completion) = put_task(&partition, "k");
        dispatcher.transactional.queue.push(task);

        assert_eq!(dispatcher.abandon_queued(), 1);
        assert!(matches!(completion.wait(), Err(Error::ShuttingDown)));
        dispatcher.shutdown();
    }

    #[test]
    fn test_enqueue_after_shutdown_is_failed() {
        let (dispatcher, engine) = dispatcher(&ElasticConfig::default());
        let partition = engine.default_partition();
        dispatcher.shutdown();

        let (task, completion) = put_task(&partition, "late");
        dispatcher.enqueue(task);
        assert!(matches!(completion.wait(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_guarded_turns_panic_into_error() {
        let result: Result<usize> = guarded(TaskKind::Scan, || panic!("callback failure"));
        assert!(matches!(result, Err(Error::Engine(msg)) if msg == "scan task panicked"));

        assert_eq!(guarded(TaskKind::Get, || Ok(7)).unwrap(), 7);
    }
}
