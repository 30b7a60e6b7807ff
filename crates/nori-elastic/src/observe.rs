//! Vendor-neutral metrics hooks.
//!
//! The elastic layer reports through a [`Meter`]; exporters live in the
//! embedding application. [`NoopMeter`] is the default.

use crate::admission::{AbortReason, JobKind, JobPriority};
use crate::task::TaskKind;

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: ElasticEvent);
}

/// Task latency buckets in milliseconds.
pub const TASK_LATENCY_BUCKETS_MS: &[f64] = &[0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 50.0, 100.0, 500.0];

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: ElasticEvent) {}
}

/// Typed events (keys and values are never included).
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq)]
pub enum ElasticEvent {
    Pool(PoolEvt),
    Task(TaskEvt),
    Job(JobEvt),
    Admission(AdmissionEvt),
}

impl ElasticEvent {
    pub fn pool_resized(pool: &'static str, from: usize, to: usize) -> Self {
        ElasticEvent::Pool(PoolEvt {
            pool,
            kind: PoolKind::Resized { from, to },
        })
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PoolEvt {
    pub pool: &'static str,
    pub kind: PoolKind,
}
#[derive(Clone, Debug, PartialEq)]
pub enum PoolKind {
    Resized { from: usize, to: usize },
    Shutdown { abandoned: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskEvt {
    pub kind: TaskKind,
    pub outcome: TaskOutcome,
}
#[derive(Clone, Debug, PartialEq)]
pub enum TaskOutcome {
    Completed { micros: u64 },
    Failed,
    Abandoned,
}

#[derive(Clone, Debug, PartialEq)]
pub struct JobEvt {
    pub kind: JobKind,
    pub priority: JobPriority,
    pub stage: JobStage,
}
#[derive(Clone, Debug, PartialEq)]
pub enum JobStage {
    Scheduled,
    Finished,
    Failed,
}

#[derive(Clone, Debug, PartialEq)]
pub enum AdmissionEvt {
    Aborted { reason: AbortReason },
}
