//! Builds one new segment from analyzed documents.
//!
//! Stored fields and term vectors are streamed to their writers as
//! documents arrive; postings are buffered in memory, sorted by term, and
//! written when the segment is flushed. Every file goes through a
//! [`TrackingStorage`] so the flushed segment knows its file set and an
//! aborted one can remove exactly what it wrote.

use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use bit_vec::BitVec;

use crate::codec::Codec;
use crate::codec::field_infos::{FieldInfo, FieldInfos, FieldInfosBuilder, IndexOptions};
use crate::codec::postings::{FieldsConsumer, SegmentWriteState, TermStats};
use crate::codec::segment_info::SegmentInfo;
use crate::codec::stored_fields::StoredFieldsWriter;
use crate::codec::term_vectors::{TermVectorPosition, TermVectorsWriter};
use crate::error::{QuiverError, Result};
use crate::index::document::{AnalyzedDocument, AnalyzedField};
use crate::index::segment_commit_info::SegmentCommitInfo;
use crate::storage::tracking::TrackingStorage;
use crate::storage::{IoContext, Storage};

#[derive(Debug, Clone)]
struct BufferedPosition {
    position: i32,
    start_offset: i32,
    end_offset: i32,
    payload: Option<Vec<u8>>,
}

#[derive(Debug, Clone)]
struct BufferedDoc {
    doc: u32,
    /// One entry per occurrence; the frequency is the length.
    positions: Vec<BufferedPosition>,
}

/// Buffered postings of one field, terms in byte order.
type FieldPostings = BTreeMap<Vec<u8>, Vec<BufferedDoc>>;

/// Term vector of one field of the current document.
struct PendingVector<'a> {
    info: FieldInfo,
    has_positions: bool,
    has_offsets: bool,
    terms: BTreeMap<&'a [u8], Vec<TermVectorPosition>>,
}

/// Writes a single segment.
pub struct SegmentWriter {
    segment: String,
    codec: Arc<Codec>,
    storage: Arc<TrackingStorage>,
    field_infos: FieldInfosBuilder,
    stored_fields: Box<dyn StoredFieldsWriter>,
    term_vectors: Option<Box<dyn TermVectorsWriter>>,
    postings: AHashMap<String, FieldPostings>,
    num_docs: u32,
    /// Set when a document failed half-way; the writer can only be aborted.
    failed: bool,
}

impl SegmentWriter {
    /// Start writing segment `segment` into `storage`.
    pub fn new(
        storage: Arc<dyn Storage>,
        codec: Arc<Codec>,
        segment: impl Into<String>,
    ) -> Result<Self> {
        let segment = segment.into();
        let storage = Arc::new(TrackingStorage::new(storage));
        let stored_fields = codec.stored_fields_format()?.fields_writer(
            Arc::clone(&storage) as Arc<dyn Storage>,
            &segment,
            IoContext::Flush { num_docs: 0 },
        )?;

        log::debug!("Started segment {segment} with codec {}", codec.name());
        Ok(SegmentWriter {
            segment,
            codec,
            storage,
            field_infos: FieldInfosBuilder::new(),
            stored_fields,
            term_vectors: None,
            postings: AHashMap::new(),
            num_docs: 0,
            failed: false,
        })
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }

    /// Number of documents added so far.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    /// Add a document and return its number within the segment.
    ///
    /// A document rejected by validation leaves the writer usable. A failure
    /// while writing leaves it usable only for [`abort`](Self::abort).
    pub fn add_document(&mut self, doc: &AnalyzedDocument) -> Result<u32> {
        if self.failed {
            return Err(QuiverError::invalid_operation(format!(
                "segment writer {} failed and must be aborted",
                self.segment
            )));
        }
        for field in &doc.fields {
            Self::validate_field(field)?;
        }

        let result = self.write_document(doc);
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn validate_field(field: &AnalyzedField) -> Result<()> {
        let field_type = &field.field_type;
        if field_type.index_options.is_none()
            && !field_type.store_term_vectors
            && !field.tokens.is_empty()
        {
            return Err(QuiverError::invalid_argument(format!(
                "field {} has tokens but is neither indexed nor vectorized",
                field.name
            )));
        }

        let check_offsets = field_type.index_options.is_some_and(IndexOptions::has_offsets)
            || (field_type.store_term_vectors && field_type.store_term_vector_offsets);
        for token in &field.tokens {
            if token.position < 0 {
                return Err(QuiverError::invalid_argument(format!(
                    "field {}: negative position {}",
                    field.name, token.position
                )));
            }
            if check_offsets && (token.start_offset < 0 || token.end_offset < token.start_offset) {
                return Err(QuiverError::invalid_argument(format!(
                    "field {}: invalid offsets [{}, {}) for term {}",
                    field.name,
                    token.start_offset,
                    token.end_offset,
                    String::from_utf8_lossy(&token.term)
                )));
            }
        }
        Ok(())
    }

    fn write_document(&mut self, doc: &AnalyzedDocument) -> Result<u32> {
        let doc_id = self.num_docs;

        for field in &doc.fields {
            let field_type = &field.field_type;
            self.field_infos.add_or_update(
                &field.name,
                field_type.index_options,
                field_type.store_term_vectors,
                field_type.store_payloads,
            );
        }

        let num_stored = doc.fields.iter().filter(|f| f.stored.is_some()).count();
        self.stored_fields.start_document(num_stored)?;
        for field in &doc.fields {
            if let Some(value) = &field.stored {
                let info = Self::registered(&self.field_infos, &field.name)?;
                self.stored_fields.write_field(info, value)?;
            }
        }

        for field in &doc.fields {
            if field.field_type.index_options.is_none() || field.tokens.is_empty() {
                continue;
            }
            let terms = self.postings.entry(field.name.clone()).or_default();
            for token in &field.tokens {
                let position = BufferedPosition {
                    position: token.position,
                    start_offset: token.start_offset,
                    end_offset: token.end_offset,
                    payload: token.payload.clone(),
                };
                let docs = terms.entry(token.term.clone()).or_default();
                match docs.last_mut() {
                    Some(last) if last.doc == doc_id => last.positions.push(position),
                    _ => docs.push(BufferedDoc {
                        doc: doc_id,
                        positions: vec![position],
                    }),
                }
            }
        }

        if doc.fields.iter().any(|f| f.field_type.store_term_vectors) {
            self.ensure_term_vectors(doc_id)?;
        }
        if self.term_vectors.is_some() {
            self.write_term_vectors(doc)?;
        }

        self.num_docs += 1;
        Ok(doc_id)
    }

    fn registered<'a>(field_infos: &'a FieldInfosBuilder, name: &str) -> Result<&'a FieldInfo> {
        field_infos.get(name).ok_or_else(|| {
            QuiverError::invalid_operation(format!("field {name} was not registered"))
        })
    }

    /// Create the term vectors writer, back-filling `num_docs` empty
    /// documents so its numbering stays aligned.
    fn ensure_term_vectors(&mut self, num_docs: u32) -> Result<()> {
        if self.term_vectors.is_some() {
            return Ok(());
        }
        let mut writer = self.codec.term_vectors_format()?.vectors_writer(
            Arc::clone(&self.storage) as Arc<dyn Storage>,
            &self.segment,
            IoContext::Flush { num_docs },
        )?;
        for _ in 0..num_docs {
            writer.start_document(0)?;
        }
        self.term_vectors = Some(writer);
        Ok(())
    }

    fn write_term_vectors(&mut self, doc: &AnalyzedDocument) -> Result<()> {
        let mut vectors: BTreeMap<u32, PendingVector<'_>> = BTreeMap::new();
        for field in &doc.fields {
            let field_type = &field.field_type;
            if !field_type.store_term_vectors || field.tokens.is_empty() {
                continue;
            }
            let info = Self::registered(&self.field_infos, &field.name)?;
            let vector = vectors.entry(info.number).or_insert_with(|| PendingVector {
                info: info.clone(),
                has_positions: field_type.store_term_vector_positions,
                has_offsets: field_type.store_term_vector_offsets,
                terms: BTreeMap::new(),
            });
            for token in &field.tokens {
                vector
                    .terms
                    .entry(token.term.as_slice())
                    .or_default()
                    .push(TermVectorPosition {
                        position: if vector.has_positions { token.position } else { -1 },
                        start_offset: if vector.has_offsets { token.start_offset } else { -1 },
                        end_offset: if vector.has_offsets { token.end_offset } else { -1 },
                    });
            }
        }

        let Some(writer) = self.term_vectors.as_mut() else {
            return Ok(());
        };
        writer.start_document(vectors.len())?;
        for vector in vectors.into_values() {
            writer.start_field(
                &vector.info,
                vector.terms.len(),
                vector.has_positions,
                vector.has_offsets,
            )?;
            for (term, mut occurrences) in vector.terms {
                occurrences.sort_by_key(|p| p.position);
                writer.start_term(term, occurrences.len() as u32)?;
                if vector.has_positions || vector.has_offsets {
                    for p in occurrences {
                        writer.add_position(p.position, p.start_offset, p.end_offset)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Write every remaining file and return the new segment.
    ///
    /// On failure every file written so far is removed.
    pub fn flush(mut self) -> Result<SegmentCommitInfo> {
        match self.write_segment() {
            Ok(info) => Ok(info),
            Err(e) => {
                log::warn!("Flush of segment {} failed: {e}", self.segment);
                self.discard();
                Err(e)
            }
        }
    }

    /// Discard the segment and every file written for it.
    pub fn abort(mut self) {
        log::info!("Aborting segment {} after {} docs", self.segment, self.num_docs);
        self.discard();
    }

    fn discard(&mut self) {
        self.stored_fields.abort();
        if let Some(writer) = self.term_vectors.as_mut() {
            writer.abort();
        }
        self.storage.delete_created();
    }

    fn write_segment(&mut self) -> Result<SegmentCommitInfo> {
        if self.failed {
            return Err(QuiverError::invalid_operation(format!(
                "segment writer {} failed and must be aborted",
                self.segment
            )));
        }
        if self.num_docs == 0 {
            return Err(QuiverError::invalid_operation(format!(
                "segment {} has no documents to flush",
                self.segment
            )));
        }

        let context = IoContext::Flush {
            num_docs: self.num_docs,
        };
        let storage = Arc::clone(&self.storage) as Arc<dyn Storage>;
        let field_infos = Arc::new(self.field_infos.finish()?);

        if field_infos.iter().any(FieldInfo::is_indexed) {
            let state = SegmentWriteState {
                segment: self.segment.clone(),
                field_infos: Arc::clone(&field_infos),
                doc_count: self.num_docs,
                context,
            };
            let mut consumer = self
                .codec
                .postings_format()?
                .fields_consumer(Arc::clone(&storage), &state)?;
            let written = self
                .write_postings(consumer.as_mut(), &field_infos)
                .and_then(|()| consumer.close());
            if let Err(e) = written {
                consumer.abort();
                return Err(e);
            }
        }

        self.stored_fields.finish(&field_infos, self.num_docs)?;

        if field_infos.has_vectors() {
            self.ensure_term_vectors(self.num_docs)?;
        }
        if let Some(writer) = self.term_vectors.as_mut() {
            writer.finish(&field_infos, self.num_docs)?;
        }

        self.codec
            .field_infos_format()?
            .write(storage.as_ref(), &self.segment, &field_infos, context)?;

        let mut info = SegmentInfo::new(&self.segment, self.num_docs, self.codec.name());
        info.diagnostics
            .insert("source".to_string(), "flush".to_string());
        let mut files = self.storage.created_files();
        files.push(info.file_name());
        info.set_files(files)?;
        self.codec
            .segment_info_format()?
            .write(storage.as_ref(), &info, &field_infos, context)?;

        log::info!(
            "Flushed segment {} with {} docs and {} files",
            info.name,
            info.doc_count,
            info.files().len()
        );
        Ok(SegmentCommitInfo::new(Arc::new(info)))
    }

    fn write_postings(
        &self,
        consumer: &mut dyn FieldsConsumer,
        field_infos: &FieldInfos,
    ) -> Result<()> {
        for field in field_infos.iter() {
            let Some(options) = field.index_options else {
                continue;
            };
            let Some(terms) = self.postings.get(&field.name).filter(|t| !t.is_empty()) else {
                continue;
            };

            let has_freqs = options.has_freqs();
            let terms_consumer = consumer.add_field(field)?;
            let mut docs_seen = BitVec::from_elem(self.num_docs as usize, false);
            let mut sum_total_term_freq = 0i64;
            let mut sum_doc_freq = 0i64;

            for (term, docs) in terms {
                let postings = terms_consumer.start_term(term)?;
                let mut total_term_freq = 0i64;

                for doc in docs {
                    let freq = doc.positions.len() as i32;
                    postings.start_doc(doc.doc, if has_freqs { freq } else { -1 })?;
                    if options.has_positions() {
                        let mut positions: Vec<&BufferedPosition> = doc.positions.iter().collect();
                        positions.sort_by_key(|p| p.position);
                        for p in positions {
                            let payload = if field.has_payloads() {
                                p.payload.as_deref()
                            } else {
                                None
                            };
                            let (start_offset, end_offset) = if options.has_offsets() {
                                (p.start_offset, p.end_offset)
                            } else {
                                (-1, -1)
                            };
                            postings.add_position(p.position, payload, start_offset, end_offset)?;
                        }
                    }
                    postings.finish_doc()?;
                    total_term_freq += freq as i64;
                    docs_seen.set(doc.doc as usize, true);
                }

                let doc_freq = docs.len() as u32;
                terms_consumer.finish_term(
                    term,
                    TermStats {
                        doc_freq,
                        total_term_freq: if has_freqs { total_term_freq } else { -1 },
                    },
                )?;
                sum_doc_freq += doc_freq as i64;
                sum_total_term_freq += total_term_freq;
            }

            let doc_count = docs_seen.iter().filter(|&seen| seen).count() as u32;
            terms_consumer.finish(
                if has_freqs { sum_total_term_freq } else { -1 },
                sum_doc_freq,
                doc_count,
            )?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for SegmentWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentWriter")
            .field("segment", &self.segment)
            .field("codec", &self.codec.name())
            .field("num_docs", &self.num_docs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::postings::NO_MORE_DOCS;
    use crate::codec::stored_fields::StoredValue;
    use crate::config::IndexConfig;
    use crate::index::document::{AnalyzedTerm, FieldType};
    use crate::index::segment_reader::SegmentReader;
    use crate::storage::memory::MemoryStorage;

    fn setup() -> (Arc<MemoryStorage>, Arc<Codec>) {
        (
            Arc::new(MemoryStorage::new()),
            Arc::new(Codec::quiver10(&IndexConfig::default())),
        )
    }

    fn open(
        storage: &Arc<MemoryStorage>,
        codec: &Arc<Codec>,
        info: SegmentCommitInfo,
    ) -> SegmentReader {
        SegmentReader::open(
            Arc::clone(storage) as Arc<dyn Storage>,
            Arc::clone(codec),
            info,
            IoContext::Default,
        )
        .unwrap()
    }

    #[test]
    fn test_flush_and_read_back() {
        let (storage, codec) = setup();
        let mut writer =
            SegmentWriter::new(storage.clone() as Arc<dyn Storage>, codec.clone(), "_0").unwrap();

        let docs = ["the cat sat", "a dog", "the cat and the hat"];
        for (i, text) in docs.iter().enumerate() {
            let doc = AnalyzedDocument::new()
                .with_field(AnalyzedField::keyword("id", &i.to_string()))
                .with_field(AnalyzedField::text("body", text, FieldType::text()).with_stored(*text));
            assert_eq!(writer.add_document(&doc).unwrap(), i as u32);
        }
        let info = writer.flush().unwrap();
        assert_eq!(info.info.doc_count, 3);
        for file in info.info.files() {
            assert!(storage.file_exists(file), "missing {file}");
        }
        assert!(info.info.files().contains("_0.si"));

        let reader = open(&storage, &codec, info);
        assert_eq!(reader.num_docs(), 3);
        assert_eq!(reader.doc_freq("body", b"cat").unwrap(), 2);
        assert_eq!(reader.doc_freq("body", b"dog").unwrap(), 1);
        assert_eq!(reader.doc_freq("body", b"cow").unwrap(), 0);
        assert_eq!(reader.doc_freq("id", b"1").unwrap(), 1);

        let terms = reader.terms("body").unwrap().unwrap();
        assert_eq!(terms.doc_count(), 3);
        let mut terms_enum = terms.iterator().unwrap();
        assert!(terms_enum.seek_exact(b"the").unwrap());
        assert_eq!(terms_enum.total_term_freq(), 3);
        let mut postings = terms_enum.postings().unwrap();
        assert_eq!(postings.next_doc().unwrap(), 0);
        assert_eq!(postings.next_doc().unwrap(), 2);
        assert_eq!(postings.freq(), 2);
        assert_eq!(postings.next_position().unwrap(), 0);
        assert_eq!(postings.next_position().unwrap(), 3);
        assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);
        drop(postings);

        let ids = reader.terms("id").unwrap().unwrap();
        assert_eq!(ids.sum_total_term_freq(), -1);

        let doc = reader.document(1).unwrap();
        assert_eq!(doc.get("body"), Some(&StoredValue::Text("a dog".to_string())));
        assert_eq!(doc.get("id"), Some(&StoredValue::Text("1".to_string())));
        reader.check_integrity().unwrap();
    }

    #[test]
    fn test_term_vectors_back_filled() {
        let (storage, codec) = setup();
        let mut writer =
            SegmentWriter::new(storage.clone() as Arc<dyn Storage>, codec.clone(), "_1").unwrap();

        writer
            .add_document(&AnalyzedDocument::new().with_field(AnalyzedField::stored("title", "plain")))
            .unwrap();
        let vectorized = FieldType::text().with_term_vectors(true, true);
        writer
            .add_document(
                &AnalyzedDocument::new()
                    .with_field(AnalyzedField::text("body", "b a b", vectorized)),
            )
            .unwrap();
        let info = writer.flush().unwrap();

        let reader = open(&storage, &codec, info);
        assert!(reader.term_vectors(0).unwrap().is_none_or(|v| v.fields.is_empty()));

        let vectors = reader.term_vectors(1).unwrap().unwrap();
        assert_eq!(vectors.fields.len(), 1);
        let field = &vectors.fields[0];
        assert!(field.has_positions && field.has_offsets);
        assert_eq!(field.terms[0].term, b"a");
        assert_eq!(field.terms[1].term, b"b");
        assert_eq!(field.terms[1].freq, 2);
        assert_eq!(
            field.terms[1].positions[1],
            TermVectorPosition {
                position: 2,
                start_offset: 4,
                end_offset: 5
            }
        );
    }

    #[test]
    fn test_invalid_document_keeps_writer_usable() {
        let (storage, codec) = setup();
        let mut writer =
            SegmentWriter::new(storage.clone() as Arc<dyn Storage>, codec.clone(), "_2").unwrap();

        let offsets = FieldType::text()
            .with_index_options(IndexOptions::DocsAndFreqsAndPositionsAndOffsets);
        let bad = AnalyzedDocument::new().with_field(AnalyzedField::indexed(
            "body",
            offsets,
            vec![AnalyzedTerm::new("x", 0).with_offsets(5, 2)],
        ));
        assert!(writer.add_document(&bad).is_err());

        let good = AnalyzedDocument::new()
            .with_field(AnalyzedField::text("body", "x y", offsets));
        assert_eq!(writer.add_document(&good).unwrap(), 0);
        assert_eq!(writer.flush().unwrap().info.doc_count, 1);
    }

    #[test]
    fn test_abort_removes_files() {
        let (storage, codec) = setup();
        let mut writer =
            SegmentWriter::new(storage.clone() as Arc<dyn Storage>, codec.clone(), "_3").unwrap();
        let vectorized = FieldType::text().with_term_vectors(true, false);
        writer
            .add_document(
                &AnalyzedDocument::new().with_field(AnalyzedField::text("body", "x", vectorized)),
            )
            .unwrap();
        writer.abort();
        assert_eq!(storage.list_files().unwrap(), Vec::<String>::new());
    }

    #[test]
    fn test_empty_flush_is_rejected() {
        let (storage, codec) = setup();
        let writer =
            SegmentWriter::new(storage.clone() as Arc<dyn Storage>, codec.clone(), "_4").unwrap();
        assert!(writer.flush().is_err());
        assert_eq!(storage.list_files().unwrap(), Vec::<String>::new());
    }
}
