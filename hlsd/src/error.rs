//! Application-wide error types.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    /// Unknown or malformed session id. Caller error, not retried.
    #[error("Invalid session: {id}")]
    InvalidSession { id: String },

    /// Concurrency cap reached. Transient, the caller may retry later.
    #[error("Server is at full capacity ({running}/{cap} pipelines running)")]
    CapacityExceeded { running: usize, cap: usize },

    /// Tool spawn or media analysis failed. The session has been terminated.
    #[error("Failed to launch pipeline for session {id}: {reason}")]
    LaunchFailure { id: String, reason: String },

    /// The session has no preserved context to restart from.
    #[error("Session {id} has no context to restart")]
    NotRestartable { id: String },

    /// Graceful stop exceeded its grace period and was escalated to a kill.
    #[error("Pipeline for session {id} did not exit within {grace:?}")]
    ProcessTimeout { id: String, grace: Duration },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error while {op} {path}: {source}")]
    IoPath {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn invalid_session(id: impl Into<String>) -> Self {
        Self::InvalidSession { id: id.into() }
    }

    pub fn not_restartable(id: impl Into<String>) -> Self {
        Self::NotRestartable { id: id.into() }
    }

    pub fn launch_failure(id: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::LaunchFailure {
            id: id.into(),
            reason: reason.to_string(),
        }
    }

    pub fn io_path(op: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::IoPath {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Whether the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }
}
