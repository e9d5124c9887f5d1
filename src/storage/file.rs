//! File-based storage implementation.

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::{QuiverError, Result};
use crate::storage::traits::{IoContext, Storage, StorageError, StorageInput, StorageOutput};

const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// A file-based storage implementation rooted at one directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Buffer size for readers and writers.
    buffer_size: usize,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        // Create directory if it doesn't exist
        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| QuiverError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(QuiverError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        Ok(FileStorage {
            directory,
            buffer_size: DEFAULT_BUFFER_SIZE,
        })
    }

    /// Set the buffer size used by inputs and outputs.
    pub fn with_buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size.max(1);
        self
    }

    /// The root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Get the full path for a file name.
    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn map_io_error(name: &str, e: std::io::Error) -> StorageError {
        if e.kind() == std::io::ErrorKind::NotFound {
            StorageError::FileNotFound(name.to_string())
        } else {
            StorageError::IoError(format!("{name}: {e}"))
        }
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageInput>> {
        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| Self::map_io_error(name, e))?;

        // One-shot reads do not benefit from a large buffer.
        let buffer_size = match context {
            IoContext::ReadOnce => self.buffer_size.min(8 * 1024),
            _ => self.buffer_size,
        };

        Ok(Box::new(FileInput::new(path, file, buffer_size)?))
    }

    fn create_output(&self, name: &str, _context: IoContext) -> Result<Box<dyn StorageOutput>> {
        let path = self.file_path(name);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(format!("{name}: {e}")))?;

        Ok(Box::new(FileOutput {
            name: name.to_string(),
            writer: Some(BufWriter::with_capacity(self.buffer_size, file)),
            position: 0,
        }))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match std::fs::remove_file(self.file_path(name)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::IoError(format!("Failed to delete {name}: {e}")).into()),
        }
    }

    fn list_files(&self) -> Result<Vec<String>> {
        let mut files = Vec::new();

        for entry in
            std::fs::read_dir(&self.directory).map_err(|e| StorageError::IoError(e.to_string()))?
        {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_file() {
                if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                    files.push(name.to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| Self::map_io_error(name, e))?;
        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        std::fs::rename(self.file_path(old_name), self.file_path(new_name))
            .map_err(|e| Self::map_io_error(old_name, e))?;
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            let file = File::open(self.file_path(name)).map_err(|e| Self::map_io_error(name, e))?;
            file.sync_all()
                .map_err(|e| StorageError::IoError(format!("Failed to sync {name}: {e}")))?;
        }
        Ok(())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    path: PathBuf,
    reader: BufReader<File>,
    size: u64,
    buffer_size: usize,
}

impl FileInput {
    fn new(path: PathBuf, file: File, buffer_size: usize) -> Result<Self> {
        let size = file
            .metadata()
            .map_err(|e| QuiverError::storage(format!("Failed to get file metadata: {e}")))?
            .len();

        Ok(FileInput {
            path,
            reader: BufReader::with_capacity(buffer_size, file),
            size,
            buffer_size,
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn clone_input(&self) -> Result<Box<dyn StorageInput>> {
        // Files are immutable once published, so a fresh handle sees the same bytes.
        let file = File::open(&self.path)?;
        Ok(Box::new(FileInput::new(
            self.path.clone(),
            file,
            self.buffer_size,
        )?))
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    name: String,
    writer: Option<BufWriter<File>>,
    position: u64,
}

impl FileOutput {
    fn writer_mut(&mut self) -> std::io::Result<&mut BufWriter<File>> {
        self.writer.as_mut().ok_or_else(|| {
            std::io::Error::other(StorageError::OutputClosed(self.name.clone()).to_string())
        })
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer_mut()?.write(buf)?;
        self.position += bytes_written as u64;
        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self.writer.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer
                .flush()
                .map_err(|e| QuiverError::storage(format!("Failed to flush: {e}")))?;
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| QuiverError::storage(format!("Failed to sync: {e}")))?;
        }
        Ok(())
    }

    fn position(&self) -> u64 {
        self.position
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut writer) = self.writer.take() {
            writer
                .flush()
                .map_err(|e| QuiverError::storage(format!("Failed to flush {}: {e}", self.name)))?;
        }
        Ok(())
    }
}
