//! Common error types for SnapSync.

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for SnapSync operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Source folder, snapshot or comparison target is missing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A tree copy or merge could not complete.
    #[error("Copy failed for {}: {reason}", path.display())]
    Copy { path: PathBuf, reason: String },

    /// A snapshot directory could not be removed.
    #[error("Delete failed for {}: {reason}", path.display())]
    Delete { path: PathBuf, reason: String },

    /// Remote mirror operation failed.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Transport-level failure talking to a remote service.
    #[error("Network error: {0}")]
    Network(String),

    /// Credentials missing, expired or rejected.
    #[error("Authentication error: {0}")]
    Authentication(String),

    /// Access denied by the filesystem or a remote service.
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Configuration is incomplete or inconsistent.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Another run holds the backup root lock.
    #[error("Backup root is locked by another run: {}", path.display())]
    Locked { path: PathBuf },
}

impl Error {
    /// Build a `Copy` error from any displayable cause.
    pub fn copy(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::Copy {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Build a `Delete` error from any displayable cause.
    pub fn delete(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::Delete {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this is a copy failure.
    pub fn is_copy(&self) -> bool {
        matches!(self, Error::Copy { .. })
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
