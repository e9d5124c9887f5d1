//! Combines several segments into one new segment.
//!
//! Every live document of the inputs is copied, renumbered densely in input
//! order. Deleted documents are dropped. The merged segment is written
//! through a [`TrackingStorage`] so a failed or aborted merge leaves no
//! files behind.

use std::sync::Arc;
use std::time::Instant;

use crate::codec::Codec;
use crate::codec::field_infos::{FieldInfo, FieldInfos, FieldInfosBuilder};
use crate::codec::postings::SegmentWriteState;
use crate::config::IndexConfig;
use crate::error::{QuiverError, Result};
use crate::index::merge_state::{CheckAbort, MergeAbortHandle, MergeCursor, MergeState};
use crate::index::segment_commit_info::SegmentCommitInfo;
use crate::index::segment_reader::SegmentReader;
use crate::storage::tracking::TrackingStorage;
use crate::storage::{IoContext, Storage};

/// Merges segment readers into a single segment written with one codec.
pub struct SegmentMerger {
    storage: Arc<dyn Storage>,
    codec: Arc<Codec>,
    segment: String,
    readers: Vec<Arc<SegmentReader>>,
    check_abort_interval: u64,
    verify_checksums: bool,
    abort: MergeAbortHandle,
}

impl SegmentMerger {
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: Arc<Codec>,
        segment: impl Into<String>,
        config: &IndexConfig,
    ) -> Self {
        SegmentMerger {
            storage,
            codec,
            segment: segment.into(),
            readers: Vec::new(),
            check_abort_interval: config.merge.check_abort_interval,
            verify_checksums: config.merge.verify_checksums,
            abort: MergeAbortHandle::new(),
        }
    }

    /// Add an input. Inputs are merged in the order they are added.
    pub fn add(&mut self, reader: Arc<SegmentReader>) {
        self.readers.push(reader);
    }

    /// Use an externally owned abort flag.
    pub fn with_abort_handle(mut self, handle: MergeAbortHandle) -> Self {
        self.abort = handle;
        self
    }

    /// A handle that cancels this merge from another thread.
    pub fn abort_handle(&self) -> MergeAbortHandle {
        self.abort.clone()
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Run the merge and return the descriptor of the new segment.
    ///
    /// On error, including cancellation, every file written so far is
    /// deleted.
    pub fn merge(self) -> Result<SegmentCommitInfo> {
        if self.readers.is_empty() {
            return Err(QuiverError::invalid_operation(format!(
                "merge into {} has no input segments",
                self.segment
            )));
        }

        let start = Instant::now();
        let names: Vec<&str> = self.readers.iter().map(|r| r.name()).collect();
        log::info!("Merging segments {names:?} into {}", self.segment);

        let storage = Arc::new(TrackingStorage::new(Arc::clone(&self.storage)));
        match self.merge_into(&storage) {
            Ok(info) => {
                log::info!(
                    "Merged {} segments into {} ({} docs) in {:?}",
                    self.readers.len(),
                    self.segment,
                    info.info.doc_count,
                    start.elapsed()
                );
                Ok(info)
            }
            Err(e) => {
                if e.is_cancelled() {
                    log::info!("Merge into {} aborted", self.segment);
                } else {
                    log::warn!("Merge into {} failed: {e}", self.segment);
                }
                storage.delete_created();
                Err(e)
            }
        }
    }

    fn merge_into(&self, tracking: &Arc<TrackingStorage>) -> Result<SegmentCommitInfo> {
        if self.verify_checksums {
            for reader in &self.readers {
                reader.check_integrity()?;
            }
        }

        let field_infos = Arc::new(self.merge_field_infos()?);
        let state = MergeState::new(
            &self.segment,
            self.codec.name(),
            Arc::clone(&field_infos),
            self.readers.clone(),
        );
        let mut cursor = MergeCursor::new(CheckAbort::new(
            self.abort.clone(),
            self.check_abort_interval,
        ));
        self.abort.check()?;

        let context = IoContext::Merge {
            estimated_docs: state.segment_info.doc_count,
        };
        let storage = Arc::clone(tracking) as Arc<dyn Storage>;

        let mut stored_fields =
            self.codec
                .stored_fields_format()?
                .fields_writer(Arc::clone(&storage), &self.segment, context)?;
        let doc_count = match stored_fields.merge(&state, &mut cursor) {
            Ok(doc_count) => doc_count,
            Err(e) => {
                stored_fields.abort();
                return Err(e);
            }
        };
        if doc_count != state.segment_info.doc_count {
            return Err(QuiverError::invalid_operation(format!(
                "merged {doc_count} stored documents but expected {}",
                state.segment_info.doc_count
            )));
        }

        if field_infos.iter().any(FieldInfo::is_indexed) {
            let write_state = SegmentWriteState {
                segment: self.segment.clone(),
                field_infos: Arc::clone(&field_infos),
                doc_count,
                context,
            };
            let mut consumer = self
                .codec
                .postings_format()?
                .fields_consumer(Arc::clone(&storage), &write_state)?;
            let merged = consumer
                .merge(&state, &mut cursor)
                .and_then(|()| consumer.close());
            if let Err(e) = merged {
                consumer.abort();
                return Err(e);
            }
        }

        if field_infos.has_vectors() {
            let mut vectors =
                self.codec
                    .term_vectors_format()?
                    .vectors_writer(Arc::clone(&storage), &self.segment, context)?;
            if let Err(e) = vectors.merge(&state, &mut cursor) {
                vectors.abort();
                return Err(e);
            }
        }

        self.codec
            .field_infos_format()?
            .write(storage.as_ref(), &self.segment, &field_infos, context)?;

        let mut info = state.segment_info.clone();
        info.diagnostics
            .insert("source".to_string(), "merge".to_string());
        info.diagnostics
            .insert("merge_factor".to_string(), self.readers.len().to_string());
        let mut files = tracking.created_files();
        files.push(info.file_name());
        info.set_files(files)?;
        self.codec
            .segment_info_format()?
            .write(storage.as_ref(), &info, &field_infos, context)?;

        Ok(SegmentCommitInfo::new(Arc::new(info)))
    }

    /// Union of the inputs' fields. Numbers follow first appearance.
    fn merge_field_infos(&self) -> Result<FieldInfos> {
        let mut builder = FieldInfosBuilder::new();
        for reader in &self.readers {
            builder.add_all(reader.field_infos());
        }
        builder.finish()
    }
}

impl std::fmt::Debug for SegmentMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentMerger")
            .field("segment", &self.segment)
            .field("codec", &self.codec.name())
            .field("readers", &self.readers.len())
            .field("aborted", &self.abort.is_aborted())
            .finish()
    }
}
