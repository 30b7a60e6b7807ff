//! The storage engine seam.
//!
//! The elastic layer never looks inside the engine. It needs point
//! writes and reads, a positioned iterator, partition lookup and, for
//! admission control, access to the engine's background job state.

use crate::admission::{BackgroundState, JobLimits, JobPriority};
use crate::error::Result;
use bytes::Bytes;
use std::path::Path;
use std::sync::Arc;

/// Name of the partition every engine must provide.
pub const DEFAULT_PARTITION: &str = "default";

/// Handle to a named key space inside the engine.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    id: u32,
    name: Arc<str>,
}

impl Partition {
    pub fn new(id: u32, name: impl Into<Arc<str>>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Partition requested at open time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDescriptor {
    pub name: String,
}

impl PartitionDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Default for PartitionDescriptor {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITION)
    }
}

#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    /// Sync the write-ahead log before acknowledging.
    pub sync: bool,
    pub disable_wal: bool,
}

#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    /// Exclusive upper bound for iteration. Scans stop before this key.
    pub upper_bound: Option<Bytes>,
    pub verify_checksums: bool,
}

impl ReadOptions {
    pub fn with_upper_bound(upper_bound: impl Into<Bytes>) -> Self {
        Self {
            upper_bound: Some(upper_bound.into()),
            ..Default::default()
        }
    }
}

/// Ascending `(key, value)` iterator returned by [`StorageEngine::iter_from`].
pub type KvIter<'a> = Box<dyn Iterator<Item = Result<(Bytes, Bytes)>> + 'a>;

/// Client-facing operations of an LSM engine.
pub trait StorageEngine: Send + Sync + 'static {
    fn put(
        &self,
        options: &WriteOptions,
        partition: &Partition,
        key: &[u8],
        value: &[u8],
    ) -> Result<()>;

    fn delete(&self, options: &WriteOptions, partition: &Partition, key: &[u8]) -> Result<()>;

    fn get(
        &self,
        options: &ReadOptions,
        partition: &Partition,
        key: &[u8],
    ) -> Result<Option<Bytes>>;

    /// Iterator over live records with key `>= start`, in ascending order.
    fn iter_from<'a>(
        &'a self,
        options: &ReadOptions,
        partition: &Partition,
        start: &[u8],
    ) -> Result<KvIter<'a>>;

    fn default_partition(&self) -> Partition;

    fn partition(&self, name: &str) -> Option<Partition>;

    /// Background scheduling hooks. Engines that return `None` cannot be
    /// wrapped by [`crate::ElasticLsm`].
    fn background(&self) -> Option<&dyn BackgroundWork> {
        None
    }
}

/// Flush/compaction side of an engine, driven by the admission controller.
///
/// The engine owns the [`BackgroundState`] and records demand there
/// (`request_flush`, `request_compaction`); the controller decides when the
/// jobs run and calls back into `run_flush` / `run_compaction` on a pool
/// thread.
pub trait BackgroundWork: Send + Sync {
    fn state(&self) -> &BackgroundState;

    fn job_limits(&self) -> JobLimits;

    fn run_flush(&self, priority: JobPriority) -> Result<()>;

    fn run_compaction(&self, priority: JobPriority) -> Result<()>;
}

/// Engines that can be opened from a path and a partition list.
pub trait OpenEngine: StorageEngine + Sized {
    type Options;

    fn open(
        options: Self::Options,
        path: &Path,
        partitions: &[PartitionDescriptor],
    ) -> Result<Self>;
}
