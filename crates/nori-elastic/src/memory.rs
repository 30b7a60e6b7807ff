//! In-memory reference engine.
//!
//! Each partition is a `crossbeam_skiplist::SkipMap` write buffer holding
//! puts and tombstones. There is no persistence: a "flush" only seals the
//! buffered byte count and a "compaction" purges tombstones. That is enough
//! to exercise the admission loop end to end:
//!
//! ```text
//! put/delete ──▶ buffered bytes ≥ write_buffer_bytes ──▶ request_flush
//! run_flush  ──▶ every flushes_per_compaction flushes ──▶ request_compaction
//! run_compaction ──▶ drop tombstones
//! ```

use crate::admission::{BackgroundState, JobLimits, JobPriority};
use crate::engine::{
    BackgroundWork, KvIter, OpenEngine, Partition, PartitionDescriptor, ReadOptions,
    StorageEngine, WriteOptions, DEFAULT_PARTITION,
};
use crate::error::{Error, Result};
use bytes::Bytes;
use crossbeam_skiplist::SkipMap;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryEngineOptions {
    /// Buffered bytes per partition that trigger a flush request (default: 4 MiB)
    #[serde(default = "default_write_buffer_bytes")]
    pub write_buffer_bytes: usize,

    /// Flushes between compaction requests (default: 4)
    #[serde(default = "default_flushes_per_compaction")]
    pub flushes_per_compaction: usize,

    /// Total background job budget (default: 2)
    #[serde(default = "default_max_background_jobs")]
    pub max_background_jobs: usize,
}

fn default_write_buffer_bytes() -> usize {
    4 * 1024 * 1024
}

fn default_flushes_per_compaction() -> usize {
    4
}

fn default_max_background_jobs() -> usize {
    2
}

impl Default for MemoryEngineOptions {
    fn default() -> Self {
        Self {
            write_buffer_bytes: default_write_buffer_bytes(),
            flushes_per_compaction: default_flushes_per_compaction(),
            max_background_jobs: default_max_background_jobs(),
        }
    }
}

#[derive(Debug, Clone)]
enum Entry {
    Put(Bytes),
    Delete,
}

const ENTRY_OVERHEAD: usize = std::mem::size_of::<Entry>();

struct PartitionData {
    handle: Partition,
    entries: SkipMap<Bytes, Entry>,
    /// Bytes written since the last flush.
    buffered_bytes: AtomicUsize,
    flush_requested: AtomicBool,
}

pub struct MemoryEngine {
    options: MemoryEngineOptions,
    partitions: Vec<PartitionData>,
    background: BackgroundState,
    flushes: AtomicU64,
    compactions: AtomicU64,
    flushes_since_compaction: AtomicUsize,
    tombstones_purged: AtomicU64,
}

impl MemoryEngine {
    /// Builds an engine with the given partitions (the default partition is
    /// added if missing) and marks it opened.
    pub fn new(options: MemoryEngineOptions, partitions: &[PartitionDescriptor]) -> Result<Self> {
        if options.write_buffer_bytes == 0 {
            return Err(Error::InvalidArgument(
                "write_buffer_bytes must be > 0".to_string(),
            ));
        }

        let mut names: Vec<&str> = vec![DEFAULT_PARTITION];
        for descriptor in partitions {
            if descriptor.name.is_empty() {
                return Err(Error::InvalidArgument(
                    "partition name cannot be empty".to_string(),
                ));
            }
            if descriptor.name == DEFAULT_PARTITION {
                continue;
            }
            if names.contains(&descriptor.name.as_str()) {
                return Err(Error::InvalidArgument(format!(
                    "duplicate partition {}",
                    descriptor.name
                )));
            }
            names.push(&descriptor.name);
        }

        let partitions = names
            .iter()
            .enumerate()
            .map(|(id, name)| PartitionData {
                handle: Partition::new(id as u32, *name),
                entries: SkipMap::new(),
                buffered_bytes: AtomicUsize::new(0),
                flush_requested: AtomicBool::new(false),
            })
            .collect::<Vec<_>>();

        let engine = Self {
            options,
            partitions,
            background: BackgroundState::new(),
            flushes: AtomicU64::new(0),
            compactions: AtomicU64::new(0),
            flushes_since_compaction: AtomicUsize::new(0),
            tombstones_purged: AtomicU64::new(0),
        };
        engine.background.mark_opened();

        tracing::info!(partitions = engine.partitions.len(), "Opened memory engine");
        Ok(engine)
    }

    fn data(&self, partition: &Partition) -> Result<&PartitionData> {
        self.partitions
            .get(partition.id() as usize)
            .filter(|data| data.handle == *partition)
            .ok_or_else(|| Error::PartitionNotFound(partition.name().to_string()))
    }

    fn account(&self, data: &PartitionData, bytes: usize) {
        let buffered = data.buffered_bytes.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if buffered >= self.options.write_buffer_bytes
            && !data.flush_requested.swap(true, Ordering::AcqRel)
        {
            tracing::debug!(
                partition = data.handle.name(),
                buffered,
                "Write buffer full, requesting flush"
            );
            self.background.request_flush();
        }
    }

    /// Requests a flush regardless of buffer size.
    pub fn request_manual_flush(&self, partition: &Partition) -> Result<()> {
        let data = self.data(partition)?;
        if !data.flush_requested.swap(true, Ordering::AcqRel) {
            self.background.request_flush();
        }
        Ok(())
    }

    pub fn flush_count(&self) -> u64 {
        self.flushes.load(Ordering::Relaxed)
    }

    pub fn compaction_count(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub fn tombstones_purged(&self) -> u64 {
        self.tombstones_purged.load(Ordering::Relaxed)
    }

    /// Entries in the partition's buffer, tombstones included.
    pub fn entry_count(&self, partition: &Partition) -> Result<usize> {
        Ok(self.data(partition)?.entries.len())
    }

    pub fn buffered_bytes(&self, partition: &Partition) -> Result<usize> {
        Ok(self.data(partition)?.buffered_bytes.load(Ordering::Relaxed))
    }
}

impl StorageEngine for MemoryEngine {
    fn put(
        &self,
        _options: &WriteOptions,
        partition: &Partition,
        key: &[u8],
        value: &[u8],
    ) -> Result<()> {
        let data = self.data(partition)?;
        data.entries.insert(
            Bytes::copy_from_slice(key),
            Entry::Put(Bytes::copy_from_slice(value)),
        );
        self.account(data, key.len() + value.len() + ENTRY_OVERHEAD);
        Ok(())
    }

    fn delete(&self, _options: &WriteOptions, partition: &Partition, key: &[u8]) -> Result<()> {
        let data = self.data(partition)?;
        data.entries.insert(Bytes::copy_from_slice(key), Entry::Delete);
        self.account(data, key.len() + ENTRY_OVERHEAD);
        Ok(())
    }

    fn get(
        &self,
        _options: &ReadOptions,
        partition: &Partition,
        key: &[u8],
    ) -> Result<Option<Bytes>> {
        let data = self.data(partition)?;
        Ok(data.entries.get(key).and_then(|entry| match entry.value() {
            Entry::Put(value) => Some(value.clone()),
            Entry::Delete => None,
        }))
    }

    fn iter_from<'a>(
        &'a self,
        options: &ReadOptions,
        partition: &Partition,
        start: &[u8],
    ) -> Result<KvIter<'a>> {
        let data = self.data(partition)?;
        let upper = options.upper_bound.clone();

        let iter = data
            .entries
            .range::<Bytes, _>(Bytes::copy_from_slice(start)..)
            .take_while(move |entry| upper.as_ref().map_or(true, |u| entry.key() < u))
            .filter_map(|entry| match entry.value() {
                Entry::Put(value) => Some(Ok((entry.key().clone(), value.clone()))),
                Entry::Delete => None,
            });
        Ok(Box::new(iter))
    }

    fn default_partition(&self) -> Partition {
        self.partitions[0].handle.clone()
    }

    fn partition(&self, name: &str) -> Option<Partition> {
        self.partitions
            .iter()
            .find(|data| data.handle.name() == name)
            .map(|data| data.handle.clone())
    }

    fn background(&self) -> Option<&dyn BackgroundWork> {
        Some(self)
    }
}

impl BackgroundWork for MemoryEngine {
    fn state(&self) -> &BackgroundState {
        &self.background
    }

    fn job_limits(&self) -> JobLimits {
        JobLimits::from_max_background_jobs(self.options.max_background_jobs)
    }

    fn run_flush(&self, priority: JobPriority) -> Result<()> {
        let Some(data) = self
            .partitions
            .iter()
            .find(|data| data.flush_requested.swap(false, Ordering::AcqRel))
        else {
            return Ok(());
        };

        let sealed = data.buffered_bytes.load(Ordering::Relaxed);
        data.buffered_bytes.fetch_sub(sealed, Ordering::Relaxed);
        let flushes = self.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(
            partition = data.handle.name(),
            bytes = sealed,
            ?priority,
            flushes,
            "Flushed write buffer"
        );

        let since = self.flushes_since_compaction.fetch_add(1, Ordering::AcqRel) + 1;
        if since >= self.options.flushes_per_compaction.max(1) {
            self.flushes_since_compaction.store(0, Ordering::Release);
            self.background.request_compaction();
        }
        Ok(())
    }

    fn run_compaction(&self, _priority: JobPriority) -> Result<()> {
        let mut purged = 0u64;
        for data in &self.partitions {
            for entry in data.entries.iter() {
                // Entry::remove only drops this exact node, never a newer write
                if matches!(entry.value(), Entry::Delete) && entry.remove() {
                    purged += 1;
                }
            }
        }

        self.tombstones_purged.fetch_add(purged, Ordering::Relaxed);
        let compactions = self.compactions.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::debug!(purged, compactions, "Compacted write buffers");
        Ok(())
    }
}

impl OpenEngine for MemoryEngine {
    type Options = MemoryEngineOptions;

    fn open(
        options: Self::Options,
        _path: &Path,
        partitions: &[PartitionDescriptor],
    ) -> Result<Self> {
        Self::new(options, partitions)
    }
}
