//! Error type shared by every persistence backend.

use std::path::PathBuf;
use std::time::Duration;

/// Errors surfaced by persistence operations.
#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("persistence not initialized (backend connection not ready)")]
    NotInitialized,

    #[error("failed to connect to backend socket at {path}: {source}")]
    ConnectionUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("backend returned error: {0}")]
    Remote(String),

    #[error("no value for key {key:?} in group {group:?}")]
    NotFound { group: String, key: String },

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("request {request_id} timed out after {timeout:?}")]
    TimedOut { request_id: u64, timeout: Duration },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("invalid group name {0:?}")]
    InvalidGroup(String),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("runtime error: {0}")]
    Runtime(String),
}

impl From<serde_json::Error> for PersistError {
    fn from(e: serde_json::Error) -> Self {
        PersistError::Serialization(e.to_string())
    }
}

impl PersistError {
    /// Whether the failure came from the remote backend being out of reach
    /// rather than from the operation itself.
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            Self::NotInitialized
                | Self::ConnectionUnavailable { .. }
                | Self::BackendUnavailable(_)
                | Self::TimedOut { .. }
        )
    }
}
