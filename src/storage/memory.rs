//! In-memory storage implementation for testing and caching.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{IoContext, Storage, StorageError, StorageInput, StorageOutput};

type FileMap = Arc<Mutex<AHashMap<String, Arc<[u8]>>>>;

/// An in-memory storage implementation.
///
/// A file becomes visible to readers only when its output is closed (or
/// dropped), which mirrors the publish-on-close behavior of a filesystem
/// rename.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    files: FileMap,
}

impl MemoryStorage {
    /// Create a new, empty memory storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the number of files stored.
    pub fn file_count(&self) -> usize {
        self.files.lock().len()
    }

    /// Get the total size of all files.
    pub fn total_size(&self) -> u64 {
        self.files.lock().values().map(|data| data.len() as u64).sum()
    }

    /// Replace the content of a file. Used by tests to simulate damage.
    pub fn overwrite(&self, name: &str, data: Vec<u8>) {
        self.files.lock().insert(name.to_string(), Arc::from(data));
    }

    /// Get a copy of a file's content.
    pub fn read_all(&self, name: &str) -> Option<Vec<u8>> {
        self.files.lock().get(name).map(|data| data.to_vec())
    }
}

impl Storage for MemoryStorage {
    fn open_input(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageInput>> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;

        Ok(Box::new(MemoryInput::new(Arc::clone(data))))
    }

    fn create_output(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageOutput>> {
        Ok(Box::new(MemoryOutput {
            name: name.to_string(),
            buffer: Vec::new(),
            files: Arc::clone(&self.files),
            closed: false,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.files.lock().contains_key(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.files.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.files.lock().keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let files = self.files.lock();
        let data = files
            .get(name)
            .ok_or_else(|| StorageError::FileNotFound(name.to_string()))?;
        Ok(data.len() as u64)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        let mut files = self.files.lock();
        let data = files
            .remove(old_name)
            .ok_or_else(|| StorageError::FileNotFound(old_name.to_string()))?;
        files.insert(new_name.to_string(), data);
        Ok(())
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        Ok(())
    }
}

/// A memory-based input implementation.
#[derive(Debug)]
pub struct MemoryInput {
    cursor: Cursor<Arc<[u8]>>,
}

impl MemoryInput {
    fn new(data: Arc<[u8]>) -> Self {
        MemoryInput {
            cursor: Cursor::new(data),
        }
    }
}

impl Read for MemoryInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.cursor.read(buf)
    }
}

impl Seek for MemoryInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.cursor.seek(pos)
    }
}

impl StorageInput for MemoryInput {
    fn size(&self) -> Result<u64> {
        Ok(self.cursor.get_ref().len() as u64)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        Ok(Box::new(MemoryInput::new(Arc::clone(self.cursor.get_ref()))))
    }
}

/// A memory-based output implementation.
#[derive(Debug)]
pub struct MemoryOutput {
    name: String,
    buffer: Vec<u8>,
    files: FileMap,
    closed: bool,
}

impl Write for MemoryOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.closed {
            return Err(std::io::Error::other(
                StorageError::OutputClosed(self.name.clone()).to_string(),
            ));
        }

        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

impl StorageOutput for MemoryOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        Ok(())
    }

    fn position(&self) -> u64 {
        self.buffer.len() as u64
    }

    fn close(&mut self) -> Result<()> {
        if !self.closed {
            let data: Arc<[u8]> = Arc::from(std::mem::take(&mut self.buffer));
            self.files.lock().insert(self.name.clone(), data);
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for MemoryOutput {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_and_read_file() {
        let storage = MemoryStorage::new();

        let mut output = storage.create_output("test.bin", IoContext::Default).unwrap();
        output.write_all(b"Hello, Memory!").unwrap();
        assert_eq!(output.position(), 14);

        // Not visible before close
        assert!(!storage.file_exists("test.bin"));
        output.close().unwrap();
        assert!(storage.file_exists("test.bin"));

        let mut input = storage.open_input("test.bin", IoContext::Default).unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, Memory!");
        assert_eq!(input.size().unwrap(), 14);
        assert_eq!(storage.total_size(), 14);
    }

    #[test]
    fn test_file_operations() {
        let storage = MemoryStorage::new();
        assert!(!storage.file_exists("a"));

        let mut output = storage.create_output("a", IoContext::Default).unwrap();
        output.write_all(b"content").unwrap();
        output.close().unwrap();

        assert_eq!(storage.file_size("a").unwrap(), 7);
        storage.rename_file("a", "b").unwrap();
        assert!(!storage.file_exists("a"));
        assert_eq!(storage.list_files().unwrap(), vec!["b"]);

        storage.delete_file("b").unwrap();
        storage.delete_file("b").unwrap();
        assert_eq!(storage.file_count(), 0);
    }

    #[test]
    fn test_drop_publishes_output() {
        let storage = MemoryStorage::new();
        {
            let mut output = storage.create_output("dropped", IoContext::Default).unwrap();
            output.write_all(b"x").unwrap();
        }
        assert!(storage.file_exists("dropped"));
    }

    #[test]
    fn test_clone_input_is_independent() {
        let storage = MemoryStorage::new();
        let mut output = storage.create_output("f", IoContext::Default).unwrap();
        output.write_all(b"0123456789").unwrap();
        output.close().unwrap();

        let mut input1 = storage.open_input("f", IoContext::Default).unwrap();
        input1.seek(SeekFrom::Start(5)).unwrap();
        let mut input2 = input1.clone_input().unwrap();

        let mut buffer = [0u8; 3];
        input1.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"567");

        input2.read_exact(&mut buffer).unwrap();
        assert_eq!(&buffer, b"012");
    }

    #[test]
    fn test_file_not_found() {
        let storage = MemoryStorage::new();
        let err = storage.open_input("missing", IoContext::Default).unwrap_err();
        assert!(err.is_not_found());
        assert!(storage.file_size("missing").is_err());
    }
}
