//! Storage abstraction layer for Quiver.
//!
//! The index core only talks to a flat directory of named files through the
//! [`Storage`] trait. File and memory backends can be swapped without
//! touching the codecs.
//!
//! # Storage Types
//!
//! - [`FileStorage`](file::FileStorage): one directory on disk.
//! - [`MemoryStorage`](memory::MemoryStorage): in-memory, for tests and
//!   temporary indexes.
//! - [`TrackingStorage`](tracking::TrackingStorage): a wrapper recording which
//!   files were created, used to build a segment's file set.
//!
//! # Example
//!
//! ```
//! use std::io::Write;
//! use quiver::storage::{IoContext, Storage, StorageOutput};
//! use quiver::storage::memory::MemoryStorage;
//!
//! # fn main() -> quiver::error::Result<()> {
//! let storage = MemoryStorage::new();
//! let mut output = storage.create_output("_0.fnm", IoContext::Default)?;
//! output.write_all(b"bytes")?;
//! output.close()?;
//! assert!(storage.file_exists("_0.fnm"));
//! # Ok(())
//! # }
//! ```

pub mod file;
pub mod memory;
pub mod structured;
pub mod tracking;
pub mod traits;

pub use traits::{IoContext, Storage, StorageError, StorageInput, StorageOutput};
