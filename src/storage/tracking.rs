//! A storage wrapper that remembers every file it created.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::Result;
use crate::storage::traits::{IoContext, Storage, StorageInput, StorageOutput};

/// Wraps another [`Storage`] and records the name of every output created
/// through it.
///
/// Segment writers and the merger use it to learn a new segment's file set
/// and to delete exactly those files when the write is aborted.
#[derive(Debug, Clone)]
pub struct TrackingStorage {
    inner: Arc<dyn Storage>,
    created: Arc<Mutex<BTreeSet<String>>>,
}

impl TrackingStorage {
    /// Create a new tracking wrapper.
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        TrackingStorage {
            inner,
            created: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Names of all files created so far, sorted.
    pub fn created_files(&self) -> Vec<String> {
        self.created.lock().iter().cloned().collect()
    }

    /// The wrapped storage.
    pub fn inner(&self) -> &Arc<dyn Storage> {
        &self.inner
    }

    /// Delete every file created through this wrapper.
    ///
    /// Failures are logged and skipped so one stuck file does not keep the
    /// rest around.
    pub fn delete_created(&self) {
        let names: Vec<String> = std::mem::take(&mut *self.created.lock())
            .into_iter()
            .collect();
        for name in names {
            if let Err(e) = self.inner.delete_file(&name) {
                log::warn!("Failed to delete {name} during cleanup: {e}");
            } else {
                log::debug!("Deleted partial file {name}");
            }
        }
    }
}

impl Storage for TrackingStorage {
    fn open_input(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(name, context)
    }

    fn create_output(&self, name: &str, context: IoContext) -> Result<Box<dyn StorageOutput>> {
        let output = self.inner.create_output(name, context)?;
        self.created.lock().insert(name.to_string());
        Ok(output)
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(name)
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(name)?;
        self.created.lock().remove(name);
        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.inner.list_files()
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(name)
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner.rename_file(old_name, new_name)?;
        let mut created = self.created.lock();
        if created.remove(old_name) {
            created.insert(new_name.to_string());
        }
        Ok(())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        self.inner.sync(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    fn write_file(storage: &dyn Storage, name: &str) {
        let mut output = storage.create_output(name, IoContext::Default).unwrap();
        output.write_all(b"data").unwrap();
        output.close().unwrap();
    }

    #[test]
    fn test_tracks_created_files() {
        let memory = Arc::new(MemoryStorage::new());
        write_file(memory.as_ref(), "existing");

        let tracking = TrackingStorage::new(memory.clone());
        write_file(&tracking, "_0.fdt");
        write_file(&tracking, "_0.fdx");

        assert_eq!(tracking.created_files(), vec!["_0.fdt", "_0.fdx"]);
        assert!(tracking.file_exists("existing"));
    }

    #[test]
    fn test_delete_created_leaves_other_files() {
        let memory = Arc::new(MemoryStorage::new());
        write_file(memory.as_ref(), "existing");

        let tracking = TrackingStorage::new(memory.clone());
        write_file(&tracking, "_1.tim");
        tracking.rename_file("_1.tim", "_1.tip").unwrap();
        assert_eq!(tracking.created_files(), vec!["_1.tip"]);

        tracking.delete_created();
        assert!(tracking.created_files().is_empty());
        assert_eq!(memory.list_files().unwrap(), vec!["existing"]);
    }
}
