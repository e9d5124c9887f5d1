//! A segment as tracked by a commit point: its descriptor plus the current
//! deletion generation.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::codec::Codec;
use crate::codec::live_docs::LiveDocs;
use crate::codec::segment_info::SegmentInfo;
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, DELETES_EXTENSION};
use crate::storage::{IoContext, Storage};

/// The unit tracked by the commit log.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentCommitInfo {
    /// The immutable segment descriptor.
    pub info: Arc<SegmentInfo>,
    del_count: u32,
    /// `-1` while the segment has never had deletions written.
    del_gen: i64,
}

impl SegmentCommitInfo {
    /// Wrap a freshly written segment with no deletions.
    pub fn new(info: Arc<SegmentInfo>) -> Self {
        SegmentCommitInfo {
            info,
            del_count: 0,
            del_gen: -1,
        }
    }

    /// Rebuild from values stored in a commit point.
    pub fn with_deletes(info: Arc<SegmentInfo>, del_count: u32, del_gen: i64) -> Result<Self> {
        if del_count > info.doc_count {
            return Err(QuiverError::corrupt_index(format!(
                "segment {}: del count {del_count} exceeds doc count {}",
                info.name, info.doc_count
            )));
        }
        if del_gen < -1 || (del_gen == -1 && del_count != 0) {
            return Err(QuiverError::corrupt_index(format!(
                "segment {}: invalid deletion generation {del_gen} with {del_count} deletions",
                info.name
            )));
        }
        Ok(SegmentCommitInfo {
            info,
            del_count,
            del_gen,
        })
    }

    pub fn del_count(&self) -> u32 {
        self.del_count
    }

    pub fn del_gen(&self) -> i64 {
        self.del_gen
    }

    pub fn has_deletions(&self) -> bool {
        self.del_gen != -1
    }

    /// Generation the next deletions write will use.
    pub fn next_del_gen(&self) -> i64 {
        if self.del_gen == -1 {
            1
        } else {
            self.del_gen + 1
        }
    }

    /// Move to the next deletion generation after its file was written.
    pub fn advance_del_gen(&mut self, new_del_count: u32) {
        self.del_gen = self.next_del_gen();
        self.del_count += new_del_count;
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> u32 {
        self.info.doc_count - self.del_count
    }

    /// Name of the current deletions file, if any.
    pub fn del_file_name(&self) -> Option<String> {
        file_names::file_name_from_generation(&self.info.name, DELETES_EXTENSION, self.del_gen)
    }

    /// Every file this commit of the segment references.
    pub fn files(&self) -> BTreeSet<String> {
        let mut files = self.info.files().clone();
        files.extend(self.del_file_name());
        files
    }

    /// Persist `live_docs` as a new deletion generation and advance.
    ///
    /// Returns `false` without writing when there are no new deletions.
    pub fn write_deletes(
        &mut self,
        storage: &dyn Storage,
        codec: &Codec,
        live_docs: &LiveDocs,
    ) -> Result<bool> {
        let deleted = live_docs.num_deleted();
        if deleted < self.del_count {
            return Err(QuiverError::invalid_operation(format!(
                "segment {}: live docs has {deleted} deletions, fewer than the committed {}",
                self.info.name, self.del_count
            )));
        }
        let new_del_count = deleted - self.del_count;
        if new_del_count == 0 {
            return Ok(false);
        }

        codec.live_docs_format()?.write_live_docs(
            storage,
            live_docs,
            self,
            new_del_count,
            IoContext::Default,
        )?;
        self.advance_del_gen(new_del_count);
        log::info!(
            "Segment {} now has {} deletions (generation {})",
            self.info.name,
            self.del_count,
            self.del_gen
        );
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IndexConfig;
    use crate::storage::memory::MemoryStorage;

    fn segment(doc_count: u32) -> SegmentCommitInfo {
        let mut info = SegmentInfo::new("_2", doc_count, "Quiver10");
        info.set_files(vec!["_2.si".to_string(), "_2.fnm".to_string()])
            .unwrap();
        SegmentCommitInfo::new(Arc::new(info))
    }

    #[test]
    fn test_generations() {
        let mut info = segment(10);
        assert!(!info.has_deletions());
        assert_eq!(info.del_file_name(), None);
        assert_eq!(info.next_del_gen(), 1);

        info.advance_del_gen(2);
        assert_eq!(info.del_gen(), 1);
        assert_eq!(info.num_docs(), 8);
        assert_eq!(info.del_file_name().unwrap(), "_2_1.del");

        let files: Vec<String> = info.files().into_iter().collect();
        assert_eq!(files, vec!["_2.fnm", "_2.si", "_2_1.del"]);
    }

    #[test]
    fn test_with_deletes_validation() {
        let info = segment(3).info;
        assert!(SegmentCommitInfo::with_deletes(info.clone(), 4, 1).is_err());
        assert!(SegmentCommitInfo::with_deletes(info.clone(), 1, -1).is_err());
        assert!(SegmentCommitInfo::with_deletes(info, 1, 2).is_ok());
    }

    #[test]
    fn test_write_deletes_is_copy_on_write() {
        let storage = MemoryStorage::new();
        let codec = Codec::quiver10(&IndexConfig::default());
        let mut info = segment(5);

        let mut live_docs = LiveDocs::new(5);
        assert!(!info.write_deletes(&storage, &codec, &live_docs).unwrap());

        live_docs.delete(1).unwrap();
        let before = info.clone();
        assert!(info.write_deletes(&storage, &codec, &live_docs).unwrap());
        assert_eq!(info.del_gen(), 1);
        assert_eq!(info.del_count(), 1);
        assert_eq!(before.del_gen(), -1);

        live_docs.delete(4).unwrap();
        let snapshot = info.clone();
        assert!(info.write_deletes(&storage, &codec, &live_docs).unwrap());
        assert_eq!(info.del_file_name().unwrap(), "_2_2.del");

        // The older generation still reads its own snapshot
        let format = codec.live_docs_format().unwrap();
        let old = format
            .read_live_docs(&storage, &snapshot, IoContext::Default)
            .unwrap();
        assert!(old.is_live(4));
        let new = format
            .read_live_docs(&storage, &info, IoContext::Default)
            .unwrap();
        assert!(!new.is_live(4));
    }
}
