/*!
Error types for the Vegh snapshot engine.
*/

use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Result type used throughout the Vegh core.
pub type Result<T> = std::result::Result<T, SnapError>;

/// Errors that can occur during snapshot operations.
#[derive(Error, Debug)]
pub enum SnapError {
    /// Missing or unreadable source, permission denied
    #[error("Resource error at {}: {source}", path.display())]
    Resource {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed ignore pattern or invalid option
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Bad magic, unsupported version, truncated data or manifest/payload mismatch
    #[error("Corrupt archive: {0}")]
    CorruptArchive(String),

    /// Recomputed payload digest differs from the stored one
    #[error("Integrity check failed: expected hash {expected}, got {actual}")]
    IntegrityCheckFailed { expected: String, actual: String },

    /// Transport failure that survived the retry policy
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Credentials rejected by the remote endpoint
    #[error("Authentication rejected: {0}")]
    Auth(String),

    /// A manifest path resolves outside the restore destination
    #[error("Path traversal rejected: {0}")]
    Traversal(String),

    /// I/O errors during file operations
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Transport conditions reported by the chunked uploader.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NetworkError {
    #[error("transfer timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connect(String),

    /// One request exceeded its own deadline; retried like a dropped connection
    #[error("request timed out after {0:?}")]
    RequestTimeout(Duration),

    #[error("server rejected request with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("chunk {chunk} failed after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        chunk: usize,
        attempts: usize,
        last_error: String,
    },

    #[error("transfer cancelled")]
    Cancelled,
}

impl SnapError {
    /// Create a new resource error for `path`
    pub fn resource<P: AsRef<Path>>(path: P, source: std::io::Error) -> Self {
        Self::Resource {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Create a new configuration error
    pub fn configuration<S: Into<String>>(msg: S) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a new corrupt archive error
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        Self::CorruptArchive(msg.into())
    }

    /// Create a new traversal error
    pub fn traversal<S: Into<String>>(msg: S) -> Self {
        Self::Traversal(msg.into())
    }

    /// Create a new authentication error
    pub fn auth<S: Into<String>>(msg: S) -> Self {
        Self::Auth(msg.into())
    }

    /// True for every condition that means the archive bytes cannot be trusted
    pub fn is_corrupt(&self) -> bool {
        matches!(
            self,
            Self::CorruptArchive(_) | Self::IntegrityCheckFailed { .. }
        )
    }

    /// True when the operation was cut short by the overall timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Network(NetworkError::Timeout(_)))
    }
}
