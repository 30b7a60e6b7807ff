use crate::completion::Responder;
use crate::engine::{Partition, ReadOptions, WriteOptions};
use crate::error::Error;
use bytes::Bytes;

/// Per-record callback invoked by a scan, on the worker thread.
pub type ScanCallback = Box<dyn FnMut(&[u8], &[u8]) + Send + 'static>;

/// A queued client operation.
///
/// Tasks move by value: the issuing call creates one, the queue owns it
/// while pending and exactly one worker takes it out and consumes it.
pub enum Task {
    Transactional(TransactionalTask),
    Analytical(AnalyticalTask),
}

/// Point operations, served by the transactional pool.
pub enum TransactionalTask {
    Put {
        options: WriteOptions,
        partition: Partition,
        key: Bytes,
        value: Bytes,
        done: Responder<()>,
    },
    Delete {
        options: WriteOptions,
        partition: Partition,
        key: Bytes,
        done: Responder<()>,
    },
    Update {
        options: WriteOptions,
        partition: Partition,
        key: Bytes,
        value: Bytes,
        done: Responder<()>,
    },
    Get {
        options: ReadOptions,
        partition: Partition,
        key: Bytes,
        done: Responder<Option<Bytes>>,
    },
}

/// Range operations, served by the analytical pool.
pub enum AnalyticalTask {
    Scan {
        options: ReadOptions,
        partition: Partition,
        start_key: Bytes,
        record_limit: usize,
        callback: ScanCallback,
        done: Responder<usize>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    Put,
    Delete,
    Update,
    Get,
    Scan,
}

impl TaskKind {
    pub const ALL: [TaskKind; 5] = [
        TaskKind::Put,
        TaskKind::Delete,
        TaskKind::Update,
        TaskKind::Get,
        TaskKind::Scan,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Put => "put",
            TaskKind::Delete => "delete",
            TaskKind::Update => "update",
            TaskKind::Get => "get",
            TaskKind::Scan => "scan",
        }
    }

    /// Writes may leave the engine with flush work to schedule.
    pub fn is_write(&self) -> bool {
        matches!(self, TaskKind::Put | TaskKind::Delete | TaskKind::Update)
    }

    pub(crate) fn index(&self) -> usize {
        *self as usize
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Task {
    pub fn kind(&self) -> TaskKind {
        match self {
            Task::Transactional(TransactionalTask::Put { .. }) => TaskKind::Put,
            Task::Transactional(TransactionalTask::Delete { .. }) => TaskKind::Delete,
            Task::Transactional(TransactionalTask::Update { .. }) => TaskKind::Update,
            Task::Transactional(TransactionalTask::Get { .. }) => TaskKind::Get,
            Task::Analytical(AnalyticalTask::Scan { .. }) => TaskKind::Scan,
        }
    }

    /// Resolves the task's completion with `err` without running it.
    pub(crate) fn fail(self, err: Error) {
        match self {
            Task::Transactional(TransactionalTask::Put { done, .. })
            | Task::Transactional(TransactionalTask::Delete { done, .. })
            | Task::Transactional(TransactionalTask::Update { done, .. }) => {
                done.send(Err(err));
            }
            Task::Transactional(TransactionalTask::Get { done, .. }) => {
                done.send(Err(err));
            }
            Task::Analytical(AnalyticalTask::Scan { done, .. }) => {
                done.send(Err(err));
            }
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task").field("kind", &self.kind()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::completion::channel;

    #[test]
    fn test_kind_and_write_classification() {
        let (done, _completion) = channel();
        let task = Task::Transactional(TransactionalTask::Delete {
            options: WriteOptions::default(),
            partition: Partition::new(0, "default"),
            key: Bytes::from_static(b"k"),
            done,
        });
        assert_eq!(task.kind(), TaskKind::Delete);
        assert!(task.kind().is_write());
        assert!(!TaskKind::Get.is_write());
        assert!(!TaskKind::Scan.is_write());
    }

    #[test]
    fn test_fail_resolves_completion() {
        let (done, completion) = channel();
        let task = Task::Analytical(AnalyticalTask::Scan {
            options: ReadOptions::default(),
            partition: Partition::new(0, "default"),
            start_key: Bytes::new(),
            record_limit: 10,
            callback: Box::new(|_, _| {}),
            done,
        });

        task.fail(Error::ShuttingDown);
        assert!(matches!(completion.wait(), Err(Error::ShuttingDown)));
    }

    #[test]
    fn test_kind_indices_are_dense() {
        for (i, kind) in TaskKind::ALL.iter().enumerate() {
            assert_eq!(kind.index(), i);
        }
    }
}
