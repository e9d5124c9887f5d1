//! Storage abstraction trait and common types.

use std::io::{Read, Seek, Write};

use crate::error::{QuiverError, Result};

/// Describes why a file is being opened or created.
///
/// Implementations may use it to pick buffer sizes or caching strategies;
/// the codec formats only pass it through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoContext {
    /// No particular access pattern.
    #[default]
    Default,
    /// Writing a freshly flushed segment.
    Flush { num_docs: u32 },
    /// Reading or writing on behalf of a merge.
    Merge { estimated_docs: u32 },
    /// The file will be read sequentially exactly once.
    ReadOnce,
}

/// A flat directory of named files.
///
/// The index core never mutates a file after it has been closed: every change
/// is written under a new name and then published.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Open a file for random-access reading.
    fn open_input(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageInput>>;

    /// Create (or truncate) a file for sequential writing.
    fn create_output(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageOutput>>;

    /// Check if a file exists.
    fn file_exists(&self, name: &str) -> bool;

    /// Delete a file. Deleting a missing file is not an error.
    fn delete_file(&self, name: &str) -> Result<()>;

    /// List all files, sorted by name.
    fn list_files(&self) -> Result<Vec<String>>;

    /// Get the size of a file in bytes.
    fn file_size(&self, name: &str) -> Result<u64>;

    /// Atomically rename a file.
    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()>;

    /// Make the named files durable.
    fn sync(&self, names: &[String]) -> Result<()>;
}

/// A trait for reading data from storage.
pub trait StorageInput: Read + Seek + Send + std::fmt::Debug {
    /// Get the size of the input stream.
    fn size(&self) -> Result<u64>;

    /// Open an independent cursor over the same bytes.
    fn clone_input(&self) -> Result<Box<dyn StorageInput>>;
}

/// A trait for writing data to storage.
pub trait StorageOutput: Write + Send + std::fmt::Debug {
    /// Flush and sync the output to storage.
    fn flush_and_sync(&mut self) -> Result<()>;

    /// Number of bytes written so far.
    fn position(&self) -> u64;

    /// Close the output stream, publishing its content.
    fn close(&mut self) -> Result<()>;
}

impl StorageOutput for Box<dyn StorageOutput> {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.as_mut().flush_and_sync()
    }

    fn position(&self) -> u64 {
        self.as_ref().position()
    }

    fn close(&mut self) -> Result<()> {
        self.as_mut().close()
    }
}

impl StorageInput for Box<dyn StorageInput> {
    fn size(&self) -> Result<u64> {
        self.as_ref().size()
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        self.as_ref().clone_input()
    }
}

/// Error types specific to storage operations.
#[derive(Debug, Clone)]
pub enum StorageError {
    /// File not found.
    FileNotFound(String),

    /// I/O error.
    IoError(String),

    /// Output has already been closed.
    OutputClosed(String),
}

impl std::fmt::Display for StorageError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageError::FileNotFound(name) => write!(f, "File not found: {name}"),
            StorageError::IoError(msg) => write!(f, "I/O error: {msg}"),
            StorageError::OutputClosed(name) => write!(f, "Output already closed: {name}"),
        }
    }
}

impl std::error::Error for StorageError {}

impl From<StorageError> for QuiverError {
    fn from(err: StorageError) -> Self {
        match err {
            // Missing files keep their io kind so discovery can retry on them.
            StorageError::FileNotFound(name) => QuiverError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("File not found: {name}"),
            )),
            other => QuiverError::storage(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let err = StorageError::FileNotFound("_0.fnm".to_string());
        assert_eq!(err.to_string(), "File not found: _0.fnm");

        let err = StorageError::IoError("disk full".to_string());
        assert_eq!(err.to_string(), "I/O error: disk full");
    }

    #[test]
    fn test_file_not_found_maps_to_not_found() {
        let err: QuiverError = StorageError::FileNotFound("segments_1".to_string()).into();
        assert!(err.is_not_found());

        let err: QuiverError = StorageError::IoError("boom".to_string()).into();
        assert!(!err.is_not_found());
    }

    #[test]
    fn test_io_context_default() {
        assert_eq!(IoContext::default(), IoContext::Default);
    }
}
