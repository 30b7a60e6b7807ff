//! Always-on counters.
//!
//! Relaxed atomics, cheap enough to bump on every task. Read them through
//! [`ElasticStats::snapshot`].

use crate::task::TaskKind;
use std::sync::atomic::{AtomicU64, Ordering};

const KINDS: usize = TaskKind::ALL.len();

/// Per-kind task counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskCounts {
    pub enqueued: u64,
    pub completed: u64,
    pub failed: u64,
    /// Rejected or failed with `ShuttingDown` without reaching the engine.
    pub abandoned: u64,
}

/// Point-in-time copy of [`ElasticStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub put: TaskCounts,
    pub delete: TaskCounts,
    pub update: TaskCounts,
    pub get: TaskCounts,
    pub scan: TaskCounts,
    /// Records delivered to scan callbacks.
    pub scanned_records: u64,
    pub pool_resizes: u64,
    pub jobs_scheduled: u64,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub admission_aborts: u64,
}

impl StatsSnapshot {
    pub fn task(&self, kind: TaskKind) -> &TaskCounts {
        match kind {
            TaskKind::Put => &self.put,
            TaskKind::Delete => &self.delete,
            TaskKind::Update => &self.update,
            TaskKind::Get => &self.get,
            TaskKind::Scan => &self.scan,
        }
    }

    pub fn tasks_completed(&self) -> u64 {
        TaskKind::ALL.iter().map(|k| self.task(*k).completed).sum()
    }

    pub fn tasks_failed(&self) -> u64 {
        TaskKind::ALL.iter().map(|k| self.task(*k).failed).sum()
    }
}

#[derive(Debug, Default)]
pub struct ElasticStats {
    enqueued: [AtomicU64; KINDS],
    completed: [AtomicU64; KINDS],
    failed: [AtomicU64; KINDS],
    abandoned: [AtomicU64; KINDS],
    scanned_records: AtomicU64,
    pool_resizes: AtomicU64,
    jobs_scheduled: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    admission_aborts: AtomicU64,
}

impl ElasticStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_enqueued(&self, kind: TaskKind) {
        self.enqueued[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_completed(&self, kind: TaskKind) {
        self.completed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self, kind: TaskKind) {
        self.failed[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_abandoned(&self, kind: TaskKind) {
        self.abandoned[kind.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_scanned(&self, records: usize) {
        self.scanned_records
            .fetch_add(records as u64, Ordering::Relaxed);
    }

    pub fn record_resize(&self) {
        self.pool_resizes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_scheduled(&self) {
        self.jobs_scheduled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_completed(&self) {
        self.jobs_completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_admission_abort(&self) {
        self.admission_aborts.fetch_add(1, Ordering::Relaxed);
    }

    fn task_counts(&self, kind: TaskKind) -> TaskCounts {
        let i = kind.index();
        TaskCounts {
            enqueued: self.enqueued[i].load(Ordering::Relaxed),
            completed: self.completed[i].load(Ordering::Relaxed),
            failed: self.failed[i].load(Ordering::Relaxed),
            abandoned: self.abandoned[i].load(Ordering::Relaxed),
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            put: self.task_counts(TaskKind::Put),
            delete: self.task_counts(TaskKind::Delete),
            update: self.task_counts(TaskKind::Update),
            get: self.task_counts(TaskKind::Get),
            scan: self.task_counts(TaskKind::Scan),
            scanned_records: self.scanned_records.load(Ordering::Relaxed),
            pool_resizes: self.pool_resizes.load(Ordering::Relaxed),
            jobs_scheduled: self.jobs_scheduled.load(Ordering::Relaxed),
            jobs_completed: self.jobs_completed.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            admission_aborts: self.admission_aborts.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_land_in_matching_kind() {
        let stats = ElasticStats::new();
        stats.record_enqueued(TaskKind::Put);
        stats.record_enqueued(TaskKind::Put);
        stats.record_completed(TaskKind::Put);
        stats.record_failed(TaskKind::Get);
        stats.record_abandoned(TaskKind::Scan);

        let snap = stats.snapshot();
        assert_eq!(snap.put.enqueued, 2);
        assert_eq!(snap.put.completed, 1);
        assert_eq!(snap.get.failed, 1);
        assert_eq!(snap.scan.abandoned, 1);
        assert_eq!(snap.delete, TaskCounts::default());
        assert_eq!(snap.tasks_completed(), 1);
        assert_eq!(snap.tasks_failed(), 1);
    }

    #[test]
    fn test_job_counters() {
        let stats = ElasticStats::new();
        stats.record_job_scheduled();
        stats.record_job_scheduled();
        stats.record_job_completed();
        stats.record_job_failed();
        stats.record_admission_abort();
        stats.record_resize();

        let snap = stats.snapshot();
        assert_eq!(snap.jobs_scheduled, 2);
        assert_eq!(snap.jobs_completed, 1);
        assert_eq!(snap.jobs_failed, 1);
        assert_eq!(snap.admission_aborts, 1);
        assert_eq!(snap.pool_resizes, 1);
    }
}
