//! Error types shared across the proxy

use crate::lifecycle::Status;
use std::path::PathBuf;
use thiserror::Error;

/// Failures of backend lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// `start()` was called while the backend was not offline
    #[error("start requested while backend is {status}")]
    Misuse { status: Status },

    /// The backend or restore process could not be created
    #[error("failed to spawn '{executable}': {reason}")]
    Spawn { executable: String, reason: String },

    #[error(transparent)]
    Filesystem(#[from] CheckpointError),
}

impl LifecycleError {
    pub fn spawn(executable: impl Into<String>, err: anyhow::Error) -> Self {
        LifecycleError::Spawn {
            executable: executable.into(),
            reason: format!("{:#}", err),
        }
    }
}

/// Failures reading or writing checkpoint state on disk
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid checkpoint record at {}: {source}", path.display())]
    Record {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl CheckpointError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure was a missing file or directory
    pub fn is_not_found(&self) -> bool {
        matches!(self, CheckpointError::Io { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Failures framing or parsing packets
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame of {size} bytes exceeds limit of {max}")]
    TooLarge { size: usize, max: usize },

    #[error("connection closed while waiting for '{expected}'")]
    Closed { expected: String },
}
