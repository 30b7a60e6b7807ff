use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The engine handle cannot hand its background scheduling to the
    /// admission controller, or a call argument was rejected.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Failure surfaced by the underlying engine's put/delete/get/iterator
    /// or by a background flush/compaction.
    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Partition not found: {0}")]
    PartitionNotFound(String),

    #[error("Shutdown in progress")]
    ShuttingDown,

    /// The worker dropped the task without reporting a result.
    #[error("Task dropped before completion")]
    TaskDropped,
}

impl Error {
    /// Convenience constructor for engine implementations.
    pub fn engine(msg: impl Into<String>) -> Self {
        Error::Engine(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
