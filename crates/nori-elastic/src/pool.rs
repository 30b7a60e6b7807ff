//! Resizable OS-thread pool.
//!
//! Runs dispatcher activations and background flush/compaction jobs. The
//! job queue is a plain `VecDeque` behind a `parking_lot` mutex; jobs are
//! short-lived closures and the lock is never held while one runs.
//!
//! Resizing only moves a target. Growing spawns the missing workers
//! immediately; shrinking lets surplus workers retire the next time they
//! look for work, so a running job is never interrupted.

use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Unit of work executed on a pool thread.
pub type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolState {
    queue: VecDeque<Job>,
    /// Desired number of workers.
    target: usize,
    /// Workers spawned and not yet retired.
    live: usize,
    shutting_down: bool,
    next_worker_id: usize,
}

struct Shared {
    name: String,
    state: Mutex<PoolState>,
    work_available: Condvar,
}

pub struct WorkerPool {
    shared: Arc<Shared>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates a pool named `name` with `threads` workers. Zero is allowed
    /// and yields a pool that rejects submissions until it is grown.
    pub fn new(name: impl Into<String>, threads: usize) -> Result<Self> {
        let pool = Self {
            shared: Arc::new(Shared {
                name: name.into(),
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    target: 0,
                    live: 0,
                    shutting_down: false,
                    next_worker_id: 0,
                }),
                work_available: Condvar::new(),
            }),
            handles: Mutex::new(Vec::new()),
        };
        pool.set_threads(threads)?;
        Ok(pool)
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Queues `job` for execution.
    ///
    /// Submissions are still accepted while the pool drains during shutdown
    /// so running jobs can hand off follow-up work; they are rejected once
    /// every worker has exited.
    pub fn submit(&self, job: Job) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.live == 0 {
            if state.shutting_down {
                return Err(Error::ShuttingDown);
            }
            return Err(Error::InvalidArgument(format!(
                "pool {} has no threads",
                self.shared.name
            )));
        }
        state.queue.push_back(job);
        drop(state);

        self.shared.work_available.notify_one();
        Ok(())
    }

    /// Moves the worker target to `threads`.
    ///
    /// Ignored once shutdown has begun.
    pub fn set_threads(&self, threads: usize) -> Result<()> {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return Ok(());
        }

        state.target = threads;
        if state.live > threads {
            drop(state);
            // Idle surplus workers wake up and retire
            self.shared.work_available.notify_all();
            return Ok(());
        }

        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());

        while state.live < threads {
            let id = state.next_worker_id;
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("{}-{}", self.shared.name, id))
                .spawn(move || worker_loop(shared))?;

            state.next_worker_id += 1;
            state.live += 1;
            handles.push(handle);
        }

        Ok(())
    }

    /// Current worker target.
    pub fn threads(&self) -> usize {
        self.shared.state.lock().target
    }

    /// Workers that have not retired yet. Lags `threads()` after a shrink.
    pub fn live_threads(&self) -> usize {
        self.shared.state.lock().live
    }

    /// Jobs waiting for a worker.
    pub fn queued_jobs(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    /// Stops accepting resizes, lets the workers drain the job queue and
    /// joins them. Idempotent. Called from one of this pool's own workers,
    /// it joins every other worker.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutting_down = true;
        }
        self.shared.work_available.notify_all();

        let handles = std::mem::take(&mut *self.handles.lock());
        let current = thread::current().id();
        for handle in handles {
            // A worker dropping the last reference to its own pool
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::error!(pool = %self.shared.name, "Worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("WorkerPool")
            .field("name", &self.shared.name)
            .field("target", &state.target)
            .field("live", &state.live)
            .field("queued", &state.queue.len())
            .finish()
    }
}

fn worker_loop(shared: Arc<Shared>) {
    loop {
        let job = {
            let mut state = shared.state.lock();
            loop {
                if state.live > state.target {
                    state.live -= 1;
                    return;
                }
                if let Some(job) = state.queue.pop_front() {
                    break job;
                }
                if state.shutting_down {
                    state.live -= 1;
                    return;
                }
                shared.work_available.wait(&mut state);
            }
        };

        // A panicking job drops its completion sender; the worker survives.
        if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!(pool = %shared.name, "Job panicked");
        }
    }
}
