//! A point-in-time view over every segment of the latest commit.

use std::sync::Arc;

use crate::codec::registry::CodecRegistry;
use crate::codec::stored_fields::StoredDocument;
use crate::config::IndexConfig;
use crate::error::{QuiverError, Result};
use crate::index::segment_infos::SegmentInfos;
use crate::index::segment_reader::SegmentReader;
use crate::storage::{IoContext, Storage};

/// Reader over a committed index.
///
/// Documents are addressed globally: segment `i` owns the range starting at
/// `doc_bases[i]`, deleted documents included.
#[derive(Debug)]
pub struct IndexReader {
    segment_infos: SegmentInfos,
    leaves: Vec<Arc<SegmentReader>>,
    doc_bases: Vec<u32>,
    max_doc: u32,
    num_docs: u32,
}

impl IndexReader {
    /// Open the latest commit found in `storage`.
    pub fn open(
        storage: Arc<dyn Storage>,
        registry: &CodecRegistry,
        config: &IndexConfig,
    ) -> Result<Self> {
        let segment_infos = SegmentInfos::read_latest(storage.as_ref(), registry)?;
        let reader = Self::from_segment_infos(storage, registry, segment_infos)?;
        if config.merge.verify_checksums {
            for leaf in &reader.leaves {
                leaf.check_integrity()?;
            }
        }
        Ok(reader)
    }

    /// Open a reader over an already loaded commit.
    pub fn from_segment_infos(
        storage: Arc<dyn Storage>,
        registry: &CodecRegistry,
        segment_infos: SegmentInfos,
    ) -> Result<Self> {
        let mut leaves = Vec::with_capacity(segment_infos.len());
        let mut doc_bases = Vec::with_capacity(segment_infos.len());
        let mut max_doc = 0u32;
        let mut num_docs = 0u32;

        for commit_info in segment_infos.segments() {
            let codec = registry.lookup(&commit_info.info.codec)?;
            let leaf = SegmentReader::open(
                Arc::clone(&storage),
                codec,
                commit_info.clone(),
                IoContext::Default,
            )?;
            doc_bases.push(max_doc);
            max_doc = max_doc.checked_add(leaf.max_doc()).ok_or_else(|| {
                QuiverError::corrupt_index("total document count overflows u32")
            })?;
            num_docs += leaf.num_docs();
            leaves.push(Arc::new(leaf));
        }

        log::debug!(
            "Opened reader on generation {:?}: {} segments, {max_doc} docs",
            segment_infos.generation(),
            leaves.len()
        );
        Ok(IndexReader {
            segment_infos,
            leaves,
            doc_bases,
            max_doc,
            num_docs,
        })
    }

    pub fn segment_infos(&self) -> &SegmentInfos {
        &self.segment_infos
    }

    pub fn generation(&self) -> Option<u64> {
        self.segment_infos.generation()
    }

    /// One reader per segment, in commit order.
    pub fn leaves(&self) -> &[Arc<SegmentReader>] {
        &self.leaves
    }

    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn has_deletions(&self) -> bool {
        self.num_docs < self.max_doc
    }

    /// Number of documents containing `term` across all segments,
    /// deleted ones included.
    pub fn doc_freq(&self, field: &str, term: &[u8]) -> Result<u64> {
        let mut doc_freq = 0u64;
        for leaf in &self.leaves {
            doc_freq += leaf.doc_freq(field, term)? as u64;
        }
        Ok(doc_freq)
    }

    /// Segment holding global document `doc` and the local number.
    pub fn leaf_for(&self, doc: u32) -> Result<(&Arc<SegmentReader>, u32)> {
        if doc >= self.max_doc {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} is out of range for an index with {} docs",
                self.max_doc
            )));
        }
        let index = self.doc_bases.partition_point(|&base| base <= doc) - 1;
        Ok((&self.leaves[index], doc - self.doc_bases[index]))
    }

    pub fn is_live(&self, doc: u32) -> bool {
        self.leaf_for(doc)
            .map(|(leaf, local)| leaf.is_live(local))
            .unwrap_or(false)
    }

    /// Stored fields of global document `doc`.
    pub fn document(&self, doc: u32) -> Result<StoredDocument> {
        let (leaf, local) = self.leaf_for(doc)?;
        leaf.document(local)
    }
}
