//! Live documents: one bit per document ordinal, set when the document is
//! not deleted.
//!
//! Every write goes to a new generation file (`<segment>_<gen>.del`), so a
//! reader holding an older [`SegmentCommitInfo`] keeps seeing its snapshot.

use bit_vec::BitVec;

use crate::codec::codec_util;
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, DELETES_EXTENSION};
use crate::index::segment_commit_info::SegmentCommitInfo;
use crate::storage::{IoContext, Storage};

/// A mutable live-docs bitmap.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveDocs {
    bits: BitVec,
    num_live: u32,
}

impl LiveDocs {
    /// Create a bitmap where every document is live.
    pub fn new(size: u32) -> Self {
        LiveDocs {
            bits: BitVec::from_elem(size as usize, true),
            num_live: size,
        }
    }

    /// Wrap an existing bit vector (bit set = live).
    pub fn from_bits(bits: BitVec) -> Self {
        let num_live = bits.iter().filter(|&live| live).count() as u32;
        LiveDocs { bits, num_live }
    }

    /// Check if a document is live. Ordinals past the end are not.
    pub fn is_live(&self, doc: u32) -> bool {
        self.bits.get(doc as usize).unwrap_or(false)
    }

    /// Mark a document as deleted. Returns whether it was live before.
    pub fn delete(&mut self, doc: u32) -> Result<bool> {
        if doc as usize >= self.bits.len() {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} out of range [0, {})",
                self.bits.len()
            )));
        }

        let was_live = self.is_live(doc);
        if was_live {
            self.bits.set(doc as usize, false);
            self.num_live -= 1;
        }
        Ok(was_live)
    }

    /// Number of documents covered (live or not).
    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn num_live(&self) -> u32 {
        self.num_live
    }

    pub fn num_deleted(&self) -> u32 {
        self.len() - self.num_live
    }

    /// Access the underlying bits.
    pub fn bits(&self) -> &BitVec {
        &self.bits
    }
}

/// Persists live-docs bitmaps by generation.
pub trait LiveDocsFormat: Send + Sync {
    /// A fresh all-live bitmap.
    fn new_live_docs(&self, size: u32) -> LiveDocs {
        LiveDocs::new(size)
    }

    /// A mutable copy of an existing bitmap.
    fn new_live_docs_from(&self, existing: &LiveDocs) -> LiveDocs {
        existing.clone()
    }

    /// Load the bitmap of the segment's current deletion generation.
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        context: IoContext,
    ) -> Result<LiveDocs>;

    /// Persist `live_docs` as the segment's next deletion generation.
    ///
    /// `new_del_count` is the number of deletions not yet reflected in
    /// `info`. The caller advances `info` afterwards.
    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        live_docs: &LiveDocs,
        info: &SegmentCommitInfo,
        new_del_count: u32,
        context: IoContext,
    ) -> Result<()>;

    /// Files referenced by the segment's current deletion generation.
    fn files(&self, info: &SegmentCommitInfo) -> Vec<String>;
}

/// The standard `.del` format.
#[derive(Debug, Clone, Default)]
pub struct Quiver10LiveDocsFormat;

impl Quiver10LiveDocsFormat {
    pub const CODEC_NAME: &'static str = "Quiver10LiveDocs";
    pub const VERSION_START: u32 = 0;
    pub const VERSION_CURRENT: u32 = 0;
}

impl LiveDocsFormat for Quiver10LiveDocsFormat {
    fn read_live_docs(
        &self,
        storage: &dyn Storage,
        info: &SegmentCommitInfo,
        context: IoContext,
    ) -> Result<LiveDocs> {
        let file_name = file_names::file_name_from_generation(
            &info.info.name,
            DELETES_EXTENSION,
            info.del_gen(),
        )
        .ok_or_else(|| {
            QuiverError::invalid_operation(format!(
                "segment {} has no deletions to read",
                info.info.name
            ))
        })?;

        let mut input = codec_util::read_checked(storage, &file_name, context)?;
        codec_util::check_header(
            &mut input,
            Self::CODEC_NAME,
            Self::VERSION_START,
            Self::VERSION_CURRENT,
        )?;

        let size = input.read_varint_u32()?;
        let del_count = input.read_varint_u32()?;
        let bytes = input.read_bytes()?;

        if size != info.info.doc_count {
            return Err(QuiverError::corrupt_index(format!(
                "{file_name}: bitmap size {size} does not match doc count {}",
                info.info.doc_count
            )));
        }
        if bytes.len() != (size as usize).div_ceil(8) {
            return Err(QuiverError::corrupt_index(format!(
                "{file_name}: {} bitmap bytes for {size} docs",
                bytes.len()
            )));
        }

        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(size as usize);
        let live_docs = LiveDocs::from_bits(bits);

        if live_docs.num_deleted() != del_count || del_count != info.del_count() {
            return Err(QuiverError::corrupt_index(format!(
                "{file_name}: deleted count mismatch (bits={}, stored={del_count}, commit={})",
                live_docs.num_deleted(),
                info.del_count()
            )));
        }

        Ok(live_docs)
    }

    fn write_live_docs(
        &self,
        storage: &dyn Storage,
        live_docs: &LiveDocs,
        info: &SegmentCommitInfo,
        new_del_count: u32,
        context: IoContext,
    ) -> Result<()> {
        if live_docs.len() != info.info.doc_count {
            return Err(QuiverError::invalid_operation(format!(
                "live docs size {} does not match doc count {} of {}",
                live_docs.len(),
                info.info.doc_count,
                info.info.name
            )));
        }
        let expected_deleted = info.del_count() + new_del_count;
        if live_docs.num_deleted() != expected_deleted {
            return Err(QuiverError::invalid_operation(format!(
                "live docs has {} deletions but {expected_deleted} were expected",
                live_docs.num_deleted()
            )));
        }

        let generation = info.next_del_gen();
        let file_name =
            file_names::file_name_from_generation(&info.info.name, DELETES_EXTENSION, generation)
                .ok_or_else(|| QuiverError::other("negative deletion generation"))?;

        let mut output = codec_util::create_output(
            storage,
            &file_name,
            Self::CODEC_NAME,
            Self::VERSION_CURRENT,
            context,
        )?;
        output.write_varint(live_docs.len() as u64)?;
        output.write_varint(live_docs.num_deleted() as u64)?;
        output.write_bytes(&live_docs.bits().to_bytes())?;
        codec_util::finish_output(output)?;

        log::debug!(
            "Wrote {file_name} with {} deletions ({new_del_count} new)",
            live_docs.num_deleted()
        );
        Ok(())
    }

    fn files(&self, info: &SegmentCommitInfo) -> Vec<String> {
        file_names::file_name_from_generation(&info.info.name, DELETES_EXTENSION, info.del_gen())
            .into_iter()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::segment_info::SegmentInfo;
    use crate::storage::memory::MemoryStorage;
    use std::sync::Arc;

    fn commit_info(doc_count: u32) -> SegmentCommitInfo {
        SegmentCommitInfo::new(Arc::new(SegmentInfo::new("_0", doc_count, "Quiver10")))
    }

    #[test]
    fn test_live_docs_basics() {
        let mut live_docs = LiveDocs::new(10);
        assert_eq!(live_docs.num_live(), 10);
        assert!(live_docs.is_live(3));
        assert!(!live_docs.is_live(10));

        assert!(live_docs.delete(3).unwrap());
        assert!(!live_docs.delete(3).unwrap());
        assert!(live_docs.delete(10).is_err());
        assert!(!live_docs.is_live(3));
        assert_eq!(live_docs.num_deleted(), 1);
        assert_eq!(live_docs.len(), 10);

        let copy = Quiver10LiveDocsFormat.new_live_docs_from(&live_docs);
        assert_eq!(copy, live_docs);
    }

    #[test]
    fn test_write_read_generations() {
        let storage = MemoryStorage::new();
        let format = Quiver10LiveDocsFormat;
        let mut info = commit_info(13);

        let mut live_docs = format.new_live_docs(13);
        live_docs.delete(0).unwrap();
        live_docs.delete(12).unwrap();

        format
            .write_live_docs(&storage, &live_docs, &info, 2, IoContext::Default)
            .unwrap();
        assert!(storage.file_exists("_0_1.del"));

        // An older snapshot still has no deletions
        let snapshot = info.clone();
        info.advance_del_gen(2);
        assert!(!snapshot.has_deletions());
        assert_eq!(format.files(&info), vec!["_0_1.del"]);

        let read = format
            .read_live_docs(&storage, &info, IoContext::Default)
            .unwrap();
        assert_eq!(read, live_docs);
        assert!(!read.is_live(12));
        assert!(read.is_live(11));
    }

    #[test]
    fn test_write_rejects_wrong_counts() {
        let storage = MemoryStorage::new();
        let format = Quiver10LiveDocsFormat;
        let info = commit_info(4);

        let mut live_docs = LiveDocs::new(4);
        live_docs.delete(1).unwrap();
        assert!(format
            .write_live_docs(&storage, &live_docs, &info, 2, IoContext::Default)
            .is_err());
        assert!(format
            .write_live_docs(&storage, &LiveDocs::new(5), &info, 0, IoContext::Default)
            .is_err());
    }

    #[test]
    fn test_read_detects_count_mismatch() {
        let storage = MemoryStorage::new();
        let format = Quiver10LiveDocsFormat;
        let mut info = commit_info(8);

        let mut live_docs = LiveDocs::new(8);
        live_docs.delete(5).unwrap();
        format
            .write_live_docs(&storage, &live_docs, &info, 1, IoContext::Default)
            .unwrap();
        // Commit claims a different count than the file
        info.advance_del_gen(3);

        let err = format
            .read_live_docs(&storage, &info, IoContext::Default)
            .unwrap_err();
        assert!(err.is_corruption());
    }
}
