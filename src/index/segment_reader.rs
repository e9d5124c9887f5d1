//! Read access to one committed segment through its codec's formats.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::Codec;
use crate::codec::field_infos::FieldInfos;
use crate::codec::live_docs::LiveDocs;
use crate::codec::postings::{FieldsProducer, SegmentReadState, Terms};
use crate::codec::stored_fields::{
    DocumentStoredFieldVisitor, StoredDocument, StoredFieldVisitor, StoredFieldsReader,
};
use crate::codec::term_vectors::{DocTermVectors, TermVectorsReader};
use crate::error::{QuiverError, Result};
use crate::index::segment_commit_info::SegmentCommitInfo;
use crate::storage::{IoContext, Storage};

/// An open segment.
///
/// Holds one reader per artifact. Stored fields and term vectors are
/// cursors behind a lock; callers that read many documents should take an
/// independent clone with [`stored_fields_reader`](Self::stored_fields_reader).
pub struct SegmentReader {
    storage: Arc<dyn Storage>,
    codec: Arc<Codec>,
    commit_info: SegmentCommitInfo,
    field_infos: Arc<FieldInfos>,
    live_docs: Option<Arc<LiveDocs>>,
    postings: Option<Box<dyn FieldsProducer>>,
    stored_fields: Mutex<Box<dyn StoredFieldsReader>>,
    term_vectors: Option<Mutex<Box<dyn TermVectorsReader>>>,
}

impl SegmentReader {
    pub fn open(
        storage: Arc<dyn Storage>,
        codec: Arc<Codec>,
        commit_info: SegmentCommitInfo,
        context: IoContext,
    ) -> Result<Self> {
        let info = &commit_info.info;
        if info.codec != codec.name() {
            return Err(QuiverError::invalid_argument(format!(
                "segment {} was written by codec {}, not {}",
                info.name,
                info.codec,
                codec.name()
            )));
        }

        let field_infos = Arc::new(codec.field_infos_format()?.read(
            storage.as_ref(),
            &info.name,
            context,
        )?);

        let live_docs = if commit_info.has_deletions() {
            Some(Arc::new(codec.live_docs_format()?.read_live_docs(
                storage.as_ref(),
                &commit_info,
                context,
            )?))
        } else {
            None
        };

        let postings = if field_infos.iter().any(|f| f.is_indexed()) {
            let state = SegmentReadState {
                segment: info.name.clone(),
                field_infos: Arc::clone(&field_infos),
                context,
            };
            Some(codec.postings_format()?.fields_producer(storage.as_ref(), &state)?)
        } else {
            None
        };

        let stored_fields = codec.stored_fields_format()?.fields_reader(
            storage.as_ref(),
            &info.name,
            Arc::clone(&field_infos),
            info.doc_count,
            context,
        )?;

        let term_vectors = if field_infos.has_vectors() {
            Some(Mutex::new(codec.term_vectors_format()?.vectors_reader(
                storage.as_ref(),
                &info.name,
                Arc::clone(&field_infos),
                info.doc_count,
                context,
            )?))
        } else {
            None
        };

        log::debug!(
            "Opened segment {} ({} docs, {} deleted)",
            info.name,
            info.doc_count,
            commit_info.del_count()
        );

        Ok(SegmentReader {
            storage,
            codec,
            commit_info,
            field_infos,
            live_docs,
            postings,
            stored_fields: Mutex::new(stored_fields),
            term_vectors,
        })
    }

    pub fn name(&self) -> &str {
        &self.commit_info.info.name
    }

    pub fn commit_info(&self) -> &SegmentCommitInfo {
        &self.commit_info
    }

    pub fn codec(&self) -> &Arc<Codec> {
        &self.codec
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn field_infos(&self) -> &Arc<FieldInfos> {
        &self.field_infos
    }

    /// Number of documents including deleted ones.
    pub fn max_doc(&self) -> u32 {
        self.commit_info.info.doc_count
    }

    /// Number of live documents.
    pub fn num_docs(&self) -> u32 {
        self.commit_info.num_docs()
    }

    pub fn live_docs(&self) -> Option<&Arc<LiveDocs>> {
        self.live_docs.as_ref()
    }

    pub fn is_live(&self, doc: u32) -> bool {
        doc < self.max_doc() && self.live_docs.as_ref().is_none_or(|l| l.is_live(doc))
    }

    /// Postings of the segment, `None` when no field is indexed.
    pub fn fields(&self) -> Option<&dyn FieldsProducer> {
        self.postings.as_deref()
    }

    /// Terms of `field`.
    pub fn terms(&self, field: &str) -> Result<Option<Box<dyn Terms + '_>>> {
        match &self.postings {
            Some(postings) => postings.terms(field),
            None => Ok(None),
        }
    }

    /// Number of documents containing `term`, deleted ones included.
    pub fn doc_freq(&self, field: &str, term: &[u8]) -> Result<u32> {
        let Some(terms) = self.terms(field)? else {
            return Ok(0);
        };
        let mut terms_enum = terms.iterator()?;
        if terms_enum.seek_exact(term)? {
            Ok(terms_enum.doc_freq())
        } else {
            Ok(0)
        }
    }

    /// An independent stored fields cursor.
    pub fn stored_fields_reader(&self) -> Result<Box<dyn StoredFieldsReader>> {
        self.stored_fields.lock().clone_reader()
    }

    /// An independent term vectors cursor, `None` when no field stores
    /// vectors.
    pub fn term_vectors_reader(&self) -> Result<Option<Box<dyn TermVectorsReader>>> {
        self.term_vectors
            .as_ref()
            .map(|reader| reader.lock().clone_reader())
            .transpose()
    }

    /// Push the stored fields of `doc` to `visitor`.
    pub fn visit_document(&self, doc: u32, visitor: &mut dyn StoredFieldVisitor) -> Result<()> {
        self.check_doc(doc)?;
        self.stored_fields.lock().visit_document(doc, visitor)
    }

    /// All stored fields of `doc`.
    pub fn document(&self, doc: u32) -> Result<StoredDocument> {
        let mut visitor = DocumentStoredFieldVisitor::new();
        self.visit_document(doc, &mut visitor)?;
        Ok(visitor.into_document())
    }

    /// Term vectors of `doc`.
    pub fn term_vectors(&self, doc: u32) -> Result<Option<DocTermVectors>> {
        self.check_doc(doc)?;
        match &self.term_vectors {
            Some(reader) => reader.lock().get(doc),
            None => Ok(None),
        }
    }

    /// Verify the checksums of every file of the segment.
    pub fn check_integrity(&self) -> Result<()> {
        self.stored_fields.lock().check_integrity()?;
        if let Some(postings) = &self.postings {
            postings.check_integrity()?;
        }
        if let Some(term_vectors) = &self.term_vectors {
            term_vectors.lock().check_integrity()?;
        }
        Ok(())
    }

    fn check_doc(&self, doc: u32) -> Result<()> {
        if doc >= self.max_doc() {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} is out of range for segment {} with {} docs",
                self.name(),
                self.max_doc()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader")
            .field("name", &self.name())
            .field("codec", &self.codec.name())
            .field("max_doc", &self.max_doc())
            .field("num_docs", &self.num_docs())
            .finish()
    }
}
