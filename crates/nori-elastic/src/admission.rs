//! Flush/compaction admission control.
//!
//! The engine records demand (`request_flush`, `request_compaction`) in a
//! [`BackgroundState`] it owns. The [`AdmissionController`] turns that
//! demand into jobs on the high-priority (flush) and low-priority
//! (compaction) pools, within the engine's [`JobLimits`] and subject to the
//! engine's pause, error, recovery and shutdown flags.
//!
//! # Gate
//!
//! The flags collapse into a single [`Gate`], checked in this order:
//!
//! ```text
//! NotOpened > ShuttingDown > HardError > Paused      → abort, schedule nothing
//! CompactionPaused > Recovering > ExclusiveManual    → flushes only
//! Open                                               → flushes and compactions
//! ```
//!
//! # Budgets
//!
//! - With a flush pool: flushes run there while fewer than `max_flushes`
//!   are scheduled.
//! - Without one: flushes borrow the compaction pool and share the
//!   `max_flushes` budget with scheduled compactions.
//! - Compactions (including bottom-level ones the engine runs itself) are
//!   capped at `max_compactions`.
//!
//! Decisions are made under the state mutex; jobs are submitted after it is
//! released. Each finished job decrements its counter and re-runs the
//! controller, so freed budget is picked up immediately.

use crate::elastic::{ElasticPool, Resize};
use crate::engine::{BackgroundWork, StorageEngine};
use crate::error::{Error, Result};
use crate::observe::{AdmissionEvt, Counter, ElasticEvent, JobEvt, JobStage, Meter};
use crate::pool::{Job, WorkerPool};
use crate::stats::ElasticStats;
use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Concurrency budget for background jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobLimits {
    pub max_flushes: usize,
    pub max_compactions: usize,
}

impl JobLimits {
    pub fn new(max_flushes: usize, max_compactions: usize) -> Self {
        Self {
            max_flushes,
            max_compactions,
        }
    }

    /// Splits a total job budget: a quarter for flushes, the rest for
    /// compactions, at least one of each.
    pub fn from_max_background_jobs(max_jobs: usize) -> Self {
        let max_flushes = (max_jobs / 4).max(1);
        let max_compactions = max_jobs.saturating_sub(max_flushes).max(1);
        Self::new(max_flushes, max_compactions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Flush,
    Compaction,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Flush => "flush",
            JobKind::Compaction => "compaction",
        }
    }
}

/// Pool a job was scheduled on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobPriority {
    High,
    Low,
}

/// Admission flags and counters. Lives under [`BackgroundState`]'s mutex;
/// cloned out by [`BackgroundState::snapshot`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AdmissionState {
    pub unscheduled_flushes: usize,
    pub unscheduled_compactions: usize,
    pub scheduled_flushes_high: usize,
    pub scheduled_flushes_low: usize,
    pub scheduled_compactions: usize,
    pub scheduled_bottom_compactions: usize,

    pub opened: bool,
    pub bg_work_paused: usize,
    pub bg_compaction_paused: usize,
    pub hard_error_stopped: bool,
    pub recovery_in_progress: bool,
    pub shutting_down: bool,
    pub exclusive_manual_compactions: usize,
}

/// Admission mode derived from the flags, highest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    NotOpened,
    ShuttingDown,
    /// Background work stopped by a hard error, no recovery running.
    HardError,
    Paused,
    CompactionPaused,
    /// Hard error with recovery in progress: recovery flushes may run.
    Recovering,
    ExclusiveManualCompaction,
    Open,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    NotOpened,
    ShuttingDown,
    HardError,
    Paused,
}

/// Why compactions were withheld while flushes were still admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionBlock {
    Paused,
    Recovering,
    ExclusiveManualCompaction,
}

/// Jobs admitted by one controller run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Scheduled {
    pub high_priority_flushes: usize,
    pub low_priority_flushes: usize,
    pub compactions: usize,
    pub compactions_blocked: Option<CompactionBlock>,
}

impl Scheduled {
    pub fn total(&self) -> usize {
        self.high_priority_flushes + self.low_priority_flushes + self.compactions
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Aborted(AbortReason),
    Scheduled(Scheduled),
}

impl AdmissionOutcome {
    pub fn scheduled(&self) -> Option<&Scheduled> {
        match self {
            AdmissionOutcome::Scheduled(s) => Some(s),
            AdmissionOutcome::Aborted(_) => None,
        }
    }
}

impl AdmissionState {
    pub fn gate(&self) -> Gate {
        if !self.opened {
            Gate::NotOpened
        } else if self.shutting_down {
            Gate::ShuttingDown
        } else if self.hard_error_stopped && !self.recovery_in_progress {
            Gate::HardError
        } else if self.bg_work_paused > 0 {
            Gate::Paused
        } else if self.bg_compaction_paused > 0 {
            Gate::CompactionPaused
        } else if self.hard_error_stopped {
            Gate::Recovering
        } else if self.exclusive_manual_compactions > 0 {
            Gate::ExclusiveManualCompaction
        } else {
            Gate::Open
        }
    }

    fn scheduled_flushes(&self) -> usize {
        self.scheduled_flushes_high + self.scheduled_flushes_low
    }

    /// Unscheduled jobs waiting for admission.
    pub fn backlog(&self) -> usize {
        self.unscheduled_flushes + self.unscheduled_compactions
    }

    /// Jobs admitted and not yet finished.
    pub fn scheduled_jobs(&self) -> usize {
        self.scheduled_flushes() + self.scheduled_compactions + self.scheduled_bottom_compactions
    }

    /// Moves as much demand as the budgets allow from unscheduled to
    /// scheduled and reports what the caller must submit.
    pub fn plan(&mut self, limits: JobLimits, flush_pool_has_threads: bool) -> AdmissionOutcome {
        let compactions_blocked = match self.gate() {
            Gate::NotOpened => return AdmissionOutcome::Aborted(AbortReason::NotOpened),
            Gate::ShuttingDown => return AdmissionOutcome::Aborted(AbortReason::ShuttingDown),
            Gate::HardError => return AdmissionOutcome::Aborted(AbortReason::HardError),
            Gate::Paused => return AdmissionOutcome::Aborted(AbortReason::Paused),
            Gate::CompactionPaused => Some(CompactionBlock::Paused),
            Gate::Recovering => Some(CompactionBlock::Recovering),
            Gate::ExclusiveManualCompaction => Some(CompactionBlock::ExclusiveManualCompaction),
            Gate::Open => None,
        };

        let mut scheduled = Scheduled {
            compactions_blocked,
            ..Default::default()
        };

        if flush_pool_has_threads {
            while self.unscheduled_flushes > 0 && self.scheduled_flushes() < limits.max_flushes {
                self.unscheduled_flushes -= 1;
                self.scheduled_flushes_high += 1;
                scheduled.high_priority_flushes += 1;
            }
        } else {
            while self.unscheduled_flushes > 0
                && self.scheduled_flushes() + self.scheduled_compactions < limits.max_flushes
            {
                self.unscheduled_flushes -= 1;
                self.scheduled_flushes_low += 1;
                scheduled.low_priority_flushes += 1;
            }
        }

        if compactions_blocked.is_some() {
            return AdmissionOutcome::Scheduled(scheduled);
        }

        while self.scheduled_compactions + self.scheduled_bottom_compactions
            < limits.max_compactions
            && self.unscheduled_compactions > 0
        {
            self.unscheduled_compactions -= 1;
            self.scheduled_compactions += 1;
            scheduled.compactions += 1;
        }

        AdmissionOutcome::Scheduled(scheduled)
    }

    fn finish(&mut self, kind: JobKind, priority: JobPriority) {
        let counter = match (kind, priority) {
            (JobKind::Flush, JobPriority::High) => &mut self.scheduled_flushes_high,
            (JobKind::Flush, JobPriority::Low) => &mut self.scheduled_flushes_low,
            (JobKind::Compaction, _) => &mut self.scheduled_compactions,
        };
        debug_assert!(*counter > 0, "finished more {:?} jobs than scheduled", kind);
        *counter = counter.saturating_sub(1);
    }
}

/// Engine-owned admission state.
///
/// All mutation goes through one mutex. `background_task_count` is
/// mirrored into an atomic so the compaction pool can size itself without
/// taking the lock.
#[derive(Debug, Default)]
pub struct BackgroundState {
    inner: Mutex<AdmissionState>,
    backlog: CachePadded<AtomicUsize>,
}

impl BackgroundState {
    pub fn new() -> Self {
        Self::default()
    }

    fn update<R>(&self, f: impl FnOnce(&mut AdmissionState) -> R) -> R {
        let mut state = self.inner.lock();
        let result = f(&mut state);
        self.backlog.store(state.backlog(), Ordering::SeqCst);
        result
    }

    /// Marks the engine as fully opened. Nothing is scheduled before this.
    pub fn mark_opened(&self) {
        self.update(|s| s.opened = true);
    }

    pub fn request_flush(&self) {
        self.update(|s| s.unscheduled_flushes += 1);
    }

    pub fn request_compaction(&self) {
        self.update(|s| s.unscheduled_compactions += 1);
    }

    /// Pauses all background scheduling. Nests.
    pub fn pause_background_work(&self) {
        self.update(|s| s.bg_work_paused += 1);
    }

    pub fn continue_background_work(&self) -> Result<()> {
        self.update(|s| {
            if s.bg_work_paused == 0 {
                return Err(Error::InvalidArgument(
                    "background work is not paused".to_string(),
                ));
            }
            s.bg_work_paused -= 1;
            Ok(())
        })
    }

    /// Pauses compaction scheduling only. Nests.
    pub fn pause_compaction(&self) {
        self.update(|s| s.bg_compaction_paused += 1);
    }

    pub fn continue_compaction(&self) -> Result<()> {
        self.update(|s| {
            if s.bg_compaction_paused == 0 {
                return Err(Error::InvalidArgument(
                    "compaction is not paused".to_string(),
                ));
            }
            s.bg_compaction_paused -= 1;
            Ok(())
        })
    }

    pub fn set_hard_error(&self, stopped: bool) {
        self.update(|s| s.hard_error_stopped = stopped);
    }

    pub fn set_recovery_in_progress(&self, in_progress: bool) {
        self.update(|s| s.recovery_in_progress = in_progress);
    }

    pub fn begin_exclusive_manual_compaction(&self) {
        self.update(|s| s.exclusive_manual_compactions += 1);
    }

    pub fn end_exclusive_manual_compaction(&self) {
        self.update(|s| {
            s.exclusive_manual_compactions = s.exclusive_manual_compactions.saturating_sub(1)
        });
    }

    /// Bottom-level compactions are run by the engine itself but count
    /// against `max_compactions`.
    pub fn begin_bottom_compaction(&self) {
        self.update(|s| s.scheduled_bottom_compactions += 1);
    }

    pub fn end_bottom_compaction(&self) {
        self.update(|s| {
            s.scheduled_bottom_compactions = s.scheduled_bottom_compactions.saturating_sub(1)
        });
    }

    pub fn begin_shutdown(&self) {
        self.update(|s| s.shutting_down = true);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.lock().shutting_down
    }

    /// Unscheduled flushes plus compactions. Lock-free, may be stale.
    pub fn background_task_count(&self) -> usize {
        self.backlog.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> AdmissionState {
        self.inner.lock().clone()
    }

    pub fn plan(&self, limits: JobLimits, flush_pool_has_threads: bool) -> AdmissionOutcome {
        self.update(|s| s.plan(limits, flush_pool_has_threads))
    }

    pub(crate) fn job_finished(&self, kind: JobKind, priority: JobPriority) {
        self.update(|s| s.finish(kind, priority));
    }

    /// Returns an admitted job to the unscheduled backlog when it could not
    /// be submitted.
    pub(crate) fn job_rejected(&self, kind: JobKind, priority: JobPriority) {
        self.update(|s| {
            s.finish(kind, priority);
            match kind {
                JobKind::Flush => s.unscheduled_flushes += 1,
                JobKind::Compaction => s.unscheduled_compactions += 1,
            }
        });
    }
}

/// Schedules flush and compaction jobs for one engine.
pub struct AdmissionController {
    engine: Arc<dyn StorageEngine>,
    flush_pool: Arc<WorkerPool>,
    compaction_pool: Arc<ElasticPool>,
    stats: Arc<ElasticStats>,
    meter: Arc<dyn Meter>,
    aborts: Box<dyn Counter>,
    failed_jobs: Box<dyn Counter>,
}

impl AdmissionController {
    /// Fails with `InvalidArgument` if the engine exposes no background
    /// hooks.
    pub fn new(
        engine: Arc<dyn StorageEngine>,
        flush_pool: Arc<WorkerPool>,
        compaction_pool: Arc<ElasticPool>,
        stats: Arc<ElasticStats>,
        meter: Arc<dyn Meter>,
    ) -> Result<Self> {
        if engine.background().is_none() {
            return Err(Error::InvalidArgument(
                "engine does not expose background work".to_string(),
            ));
        }
        let aborts = meter.counter("elastic_admission_aborts_total", &[]);
        let failed_jobs = meter.counter("elastic_jobs_failed_total", &[]);
        Ok(Self {
            engine,
            flush_pool,
            compaction_pool,
            stats,
            meter,
            aborts,
            failed_jobs,
        })
    }

    fn background(&self) -> Option<&dyn BackgroundWork> {
        self.engine.background()
    }

    /// Unscheduled background jobs, used as the compaction pool's backlog.
    pub fn backlog(&self) -> usize {
        self.background()
            .map(|bg| bg.state().background_task_count())
            .unwrap_or(0)
    }

    /// Runs one admission pass and submits the admitted jobs.
    pub fn maybe_schedule(self: &Arc<Self>) -> AdmissionOutcome {
        let Some(bg) = self.background() else {
            return AdmissionOutcome::Aborted(AbortReason::NotOpened);
        };
        let state = bg.state();

        match self.compaction_pool.adjust(state.background_task_count()) {
            Ok(Resize::Unchanged) => {}
            Ok(Resize::Grew { from, to }) | Ok(Resize::Shrank { from, to }) => {
                self.stats.record_resize();
                self.meter
                    .emit(ElasticEvent::pool_resized(self.compaction_pool.name(), from, to));
            }
            Err(e) => {
                tracing::warn!(
                    pool = self.compaction_pool.name(),
                    error = %e,
                    "Failed to resize pool"
                );
            }
        }

        let limits = bg.job_limits();
        let outcome = state.plan(limits, self.flush_pool.threads() > 0);

        let scheduled = match outcome {
            AdmissionOutcome::Aborted(reason) => {
                self.stats.record_admission_abort();
                self.aborts.inc(1);
                self.meter
                    .emit(ElasticEvent::Admission(AdmissionEvt::Aborted { reason }));
                tracing::debug!(?reason, "Background scheduling aborted");
                return outcome;
            }
            AdmissionOutcome::Scheduled(scheduled) => scheduled,
        };

        if scheduled.total() > 0 || scheduled.compactions_blocked.is_some() {
            tracing::debug!(
                high_flushes = scheduled.high_priority_flushes,
                low_flushes = scheduled.low_priority_flushes,
                compactions = scheduled.compactions,
                blocked = ?scheduled.compactions_blocked,
                max_flushes = limits.max_flushes,
                max_compactions = limits.max_compactions,
                "Admitted background jobs"
            );
        }

        for _ in 0..scheduled.high_priority_flushes {
            self.submit_job(JobKind::Flush, JobPriority::High);
        }
        for _ in 0..scheduled.low_priority_flushes {
            self.submit_job(JobKind::Flush, JobPriority::Low);
        }
        for _ in 0..scheduled.compactions {
            self.submit_job(JobKind::Compaction, JobPriority::Low);
        }

        outcome
    }

    fn submit_job(self: &Arc<Self>, kind: JobKind, priority: JobPriority) {
        let controller = Arc::clone(self);
        let job: Job = Box::new(move || controller.run_job(kind, priority));

        let submitted = match priority {
            JobPriority::High => self.flush_pool.submit(job),
            JobPriority::Low => self.compaction_pool.submit(job),
        };

        match submitted {
            Ok(()) => {
                self.stats.record_job_scheduled();
                self.meter.emit(ElasticEvent::Job(JobEvt {
                    kind,
                    priority,
                    stage: JobStage::Scheduled,
                }));
            }
            Err(e) => {
                tracing::warn!(
                    job = kind.as_str(),
                    ?priority,
                    error = %e,
                    "Could not submit background job"
                );
                if let Some(bg) = self.background() {
                    bg.state().job_rejected(kind, priority);
                }
            }
        }
    }

    fn run_job(self: &Arc<Self>, kind: JobKind, priority: JobPriority) {
        let Some(bg) = self.background() else {
            return;
        };

        let result = match kind {
            JobKind::Flush => bg.run_flush(priority),
            JobKind::Compaction => bg.run_compaction(priority),
        };
        bg.state().job_finished(kind, priority);

        let stage = match &result {
            Ok(()) => {
                self.stats.record_job_completed();
                tracing::debug!(job = kind.as_str(), ?priority, "Background job finished");
                JobStage::Finished
            }
            Err(e) => {
                self.stats.record_job_failed();
                self.failed_jobs.inc(1);
                tracing::error!(
                    job = kind.as_str(),
                    ?priority,
                    error = %e,
                    "Background job failed"
                );
                JobStage::Failed
            }
        };
        self.meter.emit(ElasticEvent::Job(JobEvt {
            kind,
            priority,
            stage,
        }));

        self.maybe_schedule();
    }
}
