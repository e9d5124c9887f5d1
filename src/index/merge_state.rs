//! Context of one merge: the inputs, how their documents are renumbered,
//! and the cooperative abort check.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::codec::live_docs::LiveDocs;
use crate::codec::segment_info::SegmentInfo;
use crate::error::{QuiverError, Result};
use crate::index::segment_reader::SegmentReader;

/// Maps the documents of one input segment to merged document numbers.
///
/// Deleted documents map to `None`; live ones are numbered densely from
/// `doc_base` in their original order.
#[derive(Debug, Clone)]
pub struct DocMap {
    doc_base: u32,
    max_doc: u32,
    remapped: Option<Vec<u32>>,
}

/// Marks a deleted document in [`DocMap::remapped`].
const DELETED: u32 = u32::MAX;

impl DocMap {
    pub fn new(doc_base: u32, max_doc: u32, live_docs: Option<&LiveDocs>) -> Self {
        let remapped = live_docs.map(|live_docs| {
            let mut next = doc_base;
            (0..max_doc)
                .map(|doc| {
                    if live_docs.is_live(doc) {
                        next += 1;
                        next - 1
                    } else {
                        DELETED
                    }
                })
                .collect()
        });
        DocMap {
            doc_base,
            max_doc,
            remapped,
        }
    }

    /// Merged number of `doc`, or `None` if it is deleted.
    pub fn get(&self, doc: u32) -> Option<u32> {
        if doc >= self.max_doc {
            return None;
        }
        match &self.remapped {
            Some(remapped) => Some(remapped[doc as usize]).filter(|&d| d != DELETED),
            None => Some(self.doc_base + doc),
        }
    }

    pub fn doc_base(&self) -> u32 {
        self.doc_base
    }
}

/// Shared flag used to cancel a running merge from another thread.
#[derive(Debug, Clone, Default)]
pub struct MergeAbortHandle {
    aborted: Arc<AtomicBool>,
}

impl MergeAbortHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the merge to stop at its next check.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Fail with `OperationCancelled` once aborted.
    pub fn check(&self) -> Result<()> {
        if self.is_aborted() {
            return Err(QuiverError::cancelled("merge aborted"));
        }
        Ok(())
    }
}

/// Counts merge work and polls the abort flag every `interval` units.
#[derive(Debug)]
pub struct CheckAbort {
    work_count: u64,
    interval: u64,
    handle: MergeAbortHandle,
}

impl CheckAbort {
    pub fn new(handle: MergeAbortHandle, interval: u64) -> Self {
        CheckAbort {
            work_count: 0,
            interval: interval.max(1),
            handle,
        }
    }

    /// Record `units` of work, checking the abort flag once enough has
    /// accumulated.
    pub fn work(&mut self, units: u64) -> Result<()> {
        self.work_count += units;
        if self.work_count >= self.interval {
            self.work_count = 0;
            self.handle.check()?;
        }
        Ok(())
    }

    pub fn handle(&self) -> &MergeAbortHandle {
        &self.handle
    }
}

/// Inputs of a merge. Immutable once built.
pub struct MergeState {
    /// Descriptor of the merged segment; `doc_count` is the number of live
    /// input documents.
    pub segment_info: SegmentInfo,
    /// Union of the inputs' field infos.
    pub field_infos: Arc<FieldInfos>,
    pub readers: Vec<Arc<SegmentReader>>,
    /// Live docs of each reader, `None` when it has no deletions.
    pub live_docs: Vec<Option<Arc<LiveDocs>>>,
    pub doc_maps: Vec<DocMap>,
    /// Merged number of the first live document of each reader.
    pub doc_base: Vec<u32>,
}

impl MergeState {
    /// Compute doc maps and bases for `readers` in order.
    pub fn new(
        segment_name: &str,
        codec: &str,
        field_infos: Arc<FieldInfos>,
        readers: Vec<Arc<SegmentReader>>,
    ) -> Self {
        let mut live_docs = Vec::with_capacity(readers.len());
        let mut doc_maps = Vec::with_capacity(readers.len());
        let mut doc_base = Vec::with_capacity(readers.len());

        let mut next_base = 0u32;
        for reader in &readers {
            let reader_live_docs = reader.live_docs().cloned();
            doc_maps.push(DocMap::new(
                next_base,
                reader.max_doc(),
                reader_live_docs.as_deref(),
            ));
            doc_base.push(next_base);
            live_docs.push(reader_live_docs);
            next_base += reader.num_docs();
        }

        MergeState {
            segment_info: SegmentInfo::new(segment_name, next_base, codec),
            field_infos,
            readers,
            live_docs,
            doc_maps,
            doc_base,
        }
    }
}

impl std::fmt::Debug for MergeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeState")
            .field("segment", &self.segment_info.name)
            .field("doc_count", &self.segment_info.doc_count)
            .field("readers", &self.readers.len())
            .field("doc_base", &self.doc_base)
            .finish()
    }
}

/// The mutable part of a merge, passed alongside [`MergeState`].
#[derive(Debug)]
pub struct MergeCursor {
    /// Field whose postings are being merged.
    pub current_field: Option<FieldInfo>,
    pub check_abort: CheckAbort,
}

impl MergeCursor {
    pub fn new(check_abort: CheckAbort) -> Self {
        MergeCursor {
            current_field: None,
            check_abort,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_map_without_deletions() {
        let map = DocMap::new(10, 3, None);
        assert_eq!(map.get(0), Some(10));
        assert_eq!(map.get(2), Some(12));
        assert_eq!(map.get(3), None);
    }

    #[test]
    fn test_doc_map_skips_deleted() {
        let mut live_docs = LiveDocs::new(4);
        live_docs.delete(1).unwrap();
        live_docs.delete(2).unwrap();

        let map = DocMap::new(5, 4, Some(&live_docs));
        assert_eq!(map.get(0), Some(5));
        assert_eq!(map.get(1), None);
        assert_eq!(map.get(2), None);
        assert_eq!(map.get(3), Some(6));
    }

    #[test]
    fn test_check_abort_polls_at_interval() {
        let handle = MergeAbortHandle::new();
        let mut check = CheckAbort::new(handle.clone(), 100);

        handle.abort();
        // Below the interval the flag is not looked at.
        check.work(60).unwrap();
        let err = check.work(60).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_check_abort_resets_count() {
        let handle = MergeAbortHandle::new();
        let mut check = CheckAbort::new(handle.clone(), 10);
        check.work(10).unwrap();
        handle.abort();
        check.work(9).unwrap();
        assert!(check.work(1).is_err());
    }
}
