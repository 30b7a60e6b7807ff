//! Elastic pool sizing.
//!
//! Each elastic pool doubles when its backlog outgrows it and halves when
//! the backlog falls under half its size:
//!
//! ```text
//! pending > current && current < max        → current = clamp(current * 2)
//! pending < current / 2 && current > min    → current = clamp(current / 2)
//! otherwise                                 → unchanged
//! ```
//!
//! The rule is applied once per dispatcher activation, so a burst of ten
//! tasks against a 2-thread pool with max 8 reaches 8 threads after two
//! activations. There is no hysteresis: a backlog oscillating around the
//! thresholds resizes the pool on every activation.

use crate::error::Result;
use crate::pool::{Job, WorkerPool};
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Inclusive thread-count bounds for one elastic pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolBounds {
    pub min: usize,
    pub max: usize,
}

impl PoolBounds {
    pub fn new(min: usize, max: usize) -> Self {
        debug_assert!(min <= max, "min {} exceeds max {}", min, max);
        Self { min, max }
    }

    pub fn clamp(&self, threads: usize) -> usize {
        threads.max(self.min).min(self.max)
    }

    pub fn contains(&self, threads: usize) -> bool {
        (self.min..=self.max).contains(&threads)
    }
}

/// Outcome of one [`ElasticPool::adjust`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resize {
    Unchanged,
    Grew { from: usize, to: usize },
    Shrank { from: usize, to: usize },
}

impl Resize {
    /// Threads added by a grow, zero otherwise.
    pub fn added(&self) -> usize {
        match *self {
            Resize::Grew { from, to } => to - from,
            _ => 0,
        }
    }
}

/// Next pool size for the given backlog. Pure; see the module docs.
pub fn next_size(current: usize, pending: usize, bounds: PoolBounds) -> usize {
    if pending > current && current < bounds.max {
        bounds.clamp(current.saturating_mul(2))
    } else if pending < current / 2 && current > bounds.min {
        bounds.clamp(current / 2)
    } else {
        current
    }
}

/// A [`WorkerPool`] whose size follows [`next_size`].
///
/// `current` is the authoritative size and is updated by CAS, so
/// concurrent activations never apply the same step twice. The worker pool
/// is then resized to whatever `current` holds at that moment, under
/// `resize_lock`, so the last writer always wins.
pub struct ElasticPool {
    name: &'static str,
    bounds: PoolBounds,
    current: CachePadded<AtomicUsize>,
    resize_lock: Mutex<()>,
    pool: WorkerPool,
}

impl ElasticPool {
    /// Starts the pool at `bounds.min` threads named `{prefix}-{name}-{n}`.
    pub fn new(name: &'static str, bounds: PoolBounds, thread_prefix: &str) -> Result<Self> {
        let pool = WorkerPool::new(format!("{}-{}", thread_prefix, name), bounds.min)?;
        Ok(Self {
            name,
            bounds,
            current: CachePadded::new(AtomicUsize::new(bounds.min)),
            resize_lock: Mutex::new(()),
            pool,
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn bounds(&self) -> PoolBounds {
        self.bounds
    }

    pub fn current_threads(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    /// Applies the sizing rule for `pending` queued items.
    pub fn adjust(&self, pending: usize) -> Result<Resize> {
        let mut current = self.current.load(Ordering::SeqCst);
        loop {
            let next = next_size(current, pending, self.bounds);
            if next == current {
                return Ok(Resize::Unchanged);
            }

            match self
                .current
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => {
                    self.apply_current()?;
                    tracing::info!(
                        pool = self.name,
                        from = current,
                        to = next,
                        pending,
                        "Resized elastic pool"
                    );
                    return Ok(if next > current {
                        Resize::Grew { from: current, to: next }
                    } else {
                        Resize::Shrank { from: current, to: next }
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    fn apply_current(&self) -> Result<()> {
        let _guard = self.resize_lock.lock();
        self.pool.set_threads(self.current.load(Ordering::SeqCst))
    }

    pub fn submit(&self, job: Job) -> Result<()> {
        self.pool.submit(job)
    }

    pub fn worker_pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Drains and joins the underlying workers.
    pub fn shutdown(&self) {
        self.pool.shutdown();
    }
}

impl std::fmt::Debug for ElasticPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticPool")
            .field("name", &self.name)
            .field("bounds", &self.bounds)
            .field("current", &self.current_threads())
            .finish()
    }
}
