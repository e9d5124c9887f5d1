//! Error types for the Quiver library.
//!
//! All fallible operations return [`QuiverError`]. Corruption is reported
//! through a dedicated variant so tooling can tell an index that needs repair
//! apart from an ordinary disk failure.
//!
//! # Examples
//!
//! ```
//! use quiver::error::{QuiverError, Result};
//!
//! fn open_segment() -> Result<()> {
//!     Err(QuiverError::corrupt_index("checksum mismatch in _0.fnm"))
//! }
//!
//! let err = open_segment().unwrap_err();
//! assert!(err.is_corruption());
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Quiver operations.
#[derive(Error, Debug)]
pub enum QuiverError {
    /// I/O errors (file operations, short reads, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The index on disk is damaged: checksum mismatch, bad header,
    /// unknown codec or inconsistent metadata.
    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    /// No commit point could be found in the storage.
    #[error("Index not found: {0}")]
    IndexNotFound(String),

    /// Storage-related errors
    #[error("Storage error: {0}")]
    Storage(String),

    /// A caller broke a writer or reader contract.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation cancelled
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with QuiverError.
pub type Result<T> = std::result::Result<T, QuiverError>;

impl QuiverError {
    /// Create a new corrupt index error.
    pub fn corrupt_index<S: Into<String>>(msg: S) -> Self {
        QuiverError::CorruptIndex(msg.into())
    }

    /// Create a new index not found error.
    pub fn index_not_found<S: Into<String>>(msg: S) -> Self {
        QuiverError::IndexNotFound(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        QuiverError::Storage(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidOperation(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidArgument(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        QuiverError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new cancelled error.
    pub fn cancelled<S: Into<String>>(msg: S) -> Self {
        QuiverError::OperationCancelled(msg.into())
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        QuiverError::Other(msg.into())
    }

    /// Whether this error means the on-disk index is damaged.
    pub fn is_corruption(&self) -> bool {
        matches!(self, QuiverError::CorruptIndex(_))
    }

    /// Whether this error came from a cooperative abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, QuiverError::OperationCancelled(_))
    }

    /// Whether the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            QuiverError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            QuiverError::IndexNotFound(_) => true,
            _ => false,
        }
    }
}
