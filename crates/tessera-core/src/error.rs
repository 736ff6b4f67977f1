//! Error types for tessera-core.

use thiserror::Error;

/// Result type for tessera-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tessera-core.
///
/// Cache misses, lock timeouts and uncacheable units are not errors: they are
/// ordinary control flow and never show up here.
#[derive(Debug, Error)]
pub enum Error {
    /// Work was submitted while the pool was not running.
    #[error("worker pool is closed")]
    PoolClosed,

    /// The worker process executing a unit died or was killed.
    #[error("worker {pid} crashed: {message}")]
    WorkerCrashed { pid: u32, message: String },

    /// The requested unit is not in the current registry.
    #[error("unit not found: {0}")]
    UnitNotFound(String),

    /// A unit with this name is already registered.
    #[error("duplicate unit: {0}")]
    DuplicateUnit(String),

    /// The unit ran and reported a failure (including panics).
    #[error("execution error: {0}")]
    Execution(String),

    /// The call was cancelled because its pool was shut down.
    #[error("execution aborted")]
    Aborted,

    /// Failed to spawn or initialize a worker process.
    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    /// IPC communication error with a worker process.
    #[error("IPC error: {0}")]
    Ipc(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// File watching error.
    #[error("file watch error: {0}")]
    Watch(String),

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Invalid operation for the current state (e.g. starting a running pool).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    /// Whether this error came from the worker side rather than the coordinator.
    ///
    /// Such failures are scoped to a single call and leave the pool usable.
    pub fn is_worker_failure(&self) -> bool {
        matches!(
            self,
            Error::WorkerCrashed { .. } | Error::Execution(_) | Error::Aborted
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        if e.is_data() || e.is_syntax() || e.is_eof() {
            Error::Deserialization(e.to_string())
        } else {
            Error::Serialization(e.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_failures() {
        assert!(Error::Aborted.is_worker_failure());
        assert!(Error::Execution("boom".to_string()).is_worker_failure());
        assert!(
            Error::WorkerCrashed {
                pid: 1,
                message: "killed".to_string()
            }
            .is_worker_failure()
        );
        assert!(!Error::PoolClosed.is_worker_failure());
    }

    #[test]
    fn test_display() {
        assert_eq!(Error::PoolClosed.to_string(), "worker pool is closed");
        assert_eq!(
            Error::UnitNotFound("ndvi".to_string()).to_string(),
            "unit not found: ndvi"
        );
    }
}
