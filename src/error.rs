//! Error types for the cluster-mode NFS core
//!
//! Provides structured error types for catalog lookups, remote copy jobs,
//! consistency-group snapshots and the collaborator boundary.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the core
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Collaborator Errors
    // =========================================================================
    #[error("Storage API call {operation} failed: {reason}")]
    Transport { operation: String, reason: String },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("Request rejected: {0}")]
    InvalidRequest(String),

    // =========================================================================
    // Copy Job Errors
    // =========================================================================
    #[error("Timeout waiting for copy of {file_name} (job {job}) after {timeout:?}")]
    CopyTimeout {
        job: String,
        file_name: String,
        timeout: Duration,
    },

    #[error("Error copying file {file_name}. {reason}.")]
    CopyFailed { file_name: String, reason: String },

    #[error("Error copying file {file_name}. The corresponding job {job} doesn't exist.")]
    CopyJobMissing { job: String, file_name: String },

    #[error("Wait for copy job {job} aborted by shutdown")]
    Aborted { job: String },

    // =========================================================================
    // Snapshot Errors
    // =========================================================================
    #[error("Group snapshot {snapshot} failed: {reason}")]
    GroupSnapshot { snapshot: String, reason: String },

    #[error("Snapshot {snapshot} on {container} is busy")]
    SnapshotBusy { container: String, snapshot: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Metrics registration error: {0}")]
    Metrics(#[from] prometheus::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Shorthand for a failed collaborator call
    pub fn transport(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::Transport {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Shorthand for a lookup miss
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Check if this error is a terminal outcome of a copy job
    pub fn is_terminal_copy(&self) -> bool {
        matches!(
            self,
            Error::CopyTimeout { .. } | Error::CopyFailed { .. } | Error::CopyJobMissing { .. }
        )
    }

    /// Check if this error is transient
    ///
    /// The core never retries these itself; the volume lifecycle manager
    /// decides whether to.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::SnapshotBusy { .. } | Error::Io(_)
        )
    }

    /// Check if this error is a lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}

/// Result type alias for the core
pub type Result<T> = std::result::Result<T, Error>;
