//! Error types for procpool.

use crate::pool::protocol::RemoteFailure;
use crate::pool::signals::TerminationReason;
use thiserror::Error;

/// Main error type for procpool.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Process has already been started")]
    AlreadyStarted,

    #[error("Process has not been started")]
    NotStarted,

    #[error("Timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Pool failed: {0}")]
    PoolFailed(String),

    #[error("Worker process {pid} crashed: {reason}")]
    WorkerCrashed { pid: u32, reason: TerminationReason },

    #[error("Remote failure: {0}")]
    Remote(RemoteFailure),

    #[error("Failed to spawn worker: {0}")]
    Spawn(String),

    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid task arguments: {0}")]
    InvalidArguments(String),

    #[error("Worker protocol violation: {0}")]
    Protocol(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl PoolError {
    /// The remote failure carried by this error, if the task itself failed.
    pub fn remote(&self) -> Option<&RemoteFailure> {
        match self {
            Self::Remote(failure) => Some(failure),
            _ => None,
        }
    }
}

/// Result type alias for procpool operations.
pub type Result<T> = std::result::Result<T, PoolError>;
