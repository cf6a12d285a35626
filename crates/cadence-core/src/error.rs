use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur while driving a training loop.
#[derive(Debug, Error)]
pub enum CadenceError {
    /// A monitored metric was not present in the logs of the current step.
    #[error("monitored metric {key:?} not found in logs")]
    MissingMetric {
        /// The metric name that was looked up.
        key: String,
    },

    /// No history entry contains the requested key.
    #[error("key {key:?} not found in any history entry")]
    MissingHistoryKey {
        /// The key passed to `History::collect`.
        key: String,
    },

    /// A schedule or patience period cannot be used.
    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    /// A checkpoint for this step or a later one is already on disk.
    #[error("checkpoint already exists at or after {path:?}")]
    CheckpointExists {
        /// The path that would have been written.
        path: PathBuf,
    },

    /// Filesystem error while reading or writing checkpoints or history.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Checkpoint index or history serialization failed.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// A user-supplied step function or hook failed.
    #[error(transparent)]
    Callback(#[from] anyhow::Error),
}

/// Result type alias for loop operations.
pub type Result<T> = std::result::Result<T, CadenceError>;
