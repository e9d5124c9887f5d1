//! Term vectors: per document, per field, the terms with their positions and
//! offsets.
//!
//! The writer lifecycle nests one level deeper than stored fields:
//! `start_document` → `start_field` → `start_term` → `add_position`, with
//! fields in ascending number order and terms in byte order.

pub mod standard;

use std::sync::Arc;

use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::codec::stored_fields::MERGE_DOC_WORK_UNITS;
use crate::error::{QuiverError, Result};
use crate::index::merge_state::{MergeCursor, MergeState};
use crate::storage::{IoContext, Storage};

/// One occurrence of a term. Missing parts are `-1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermVectorPosition {
    pub position: i32,
    pub start_offset: i32,
    pub end_offset: i32,
}

/// A term of one field's vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermVectorTerm {
    pub term: Vec<u8>,
    pub freq: u32,
    /// Empty unless the field stores positions or offsets.
    pub positions: Vec<TermVectorPosition>,
}

/// The vector of one field in one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldTermVector {
    /// Field number.
    pub field: u32,
    pub has_positions: bool,
    pub has_offsets: bool,
    pub terms: Vec<TermVectorTerm>,
}

/// All vectors of one document, in ascending field number order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocTermVectors {
    pub fields: Vec<FieldTermVector>,
}

impl DocTermVectors {
    /// The vector of a field, if the document has one.
    pub fn field(&self, number: u32) -> Option<&FieldTermVector> {
        self.fields.iter().find(|f| f.field == number)
    }
}

/// Writes term vectors for one segment.
///
/// Every document of the segment must be started, including documents
/// without vectors (`start_document(0)`).
pub trait TermVectorsWriter: Send {
    /// Begin a document with `num_vector_fields` fields.
    fn start_document(&mut self, num_vector_fields: usize) -> Result<()>;

    /// Begin a field with `num_terms` terms.
    fn start_field(
        &mut self,
        field: &FieldInfo,
        num_terms: usize,
        has_positions: bool,
        has_offsets: bool,
    ) -> Result<()>;

    /// Begin a term occurring `freq` times.
    fn start_term(&mut self, term: &[u8], freq: u32) -> Result<()>;

    /// Add one occurrence of the current term; called `freq` times when the
    /// field stores positions or offsets.
    fn add_position(&mut self, position: i32, start_offset: i32, end_offset: i32) -> Result<()>;

    /// Complete the segment.
    fn finish(&mut self, field_infos: &FieldInfos, num_docs: u32) -> Result<()>;

    /// Discard everything written and remove the files.
    fn abort(&mut self);

    /// Copy the vectors of every live document of the merge inputs.
    ///
    /// Returns the number of documents written.
    fn merge(&mut self, state: &MergeState, cursor: &mut MergeCursor) -> Result<u32> {
        let mut doc_count = 0u32;

        for (reader_index, reader) in state.readers.iter().enumerate() {
            let doc_map = &state.doc_maps[reader_index];
            let mut vectors_reader = reader.term_vectors_reader()?;

            for doc in 0..reader.max_doc() {
                if doc_map.get(doc).is_none() {
                    continue;
                }

                let vectors = match vectors_reader.as_mut() {
                    Some(vectors_reader) => vectors_reader.get(doc)?,
                    None => None,
                };
                add_doc_vectors(
                    self,
                    vectors.as_ref(),
                    reader.field_infos(),
                    &state.field_infos,
                )?;

                doc_count += 1;
                cursor.check_abort.work(MERGE_DOC_WORK_UNITS)?;
            }
        }

        self.finish(&state.field_infos, doc_count)?;
        Ok(doc_count)
    }
}

/// Re-emit one document's vectors, translating field numbers from the
/// source segment to the merged one.
///
/// A field is started only when its first term is seen, and whether it has
/// positions or offsets is read from that first term. Fields without terms
/// are never started.
pub fn add_doc_vectors<W: TermVectorsWriter + ?Sized>(
    writer: &mut W,
    vectors: Option<&DocTermVectors>,
    source_infos: &FieldInfos,
    merged_infos: &FieldInfos,
) -> Result<()> {
    let Some(vectors) = vectors else {
        return writer.start_document(0);
    };

    let mut fields = Vec::with_capacity(vectors.fields.len());
    for vector in &vectors.fields {
        if vector.terms.is_empty() {
            continue;
        }
        let name = &source_infos
            .field_info_by_number(vector.field)
            .ok_or_else(|| {
                QuiverError::corrupt_index(format!(
                    "term vector for unknown field number {}",
                    vector.field
                ))
            })?
            .name;
        let merged = merged_infos.field_info(name).ok_or_else(|| {
            QuiverError::invalid_operation(format!("field {name} missing from merged field infos"))
        })?;
        fields.push((merged, vector));
    }
    fields.sort_by_key(|(info, _)| info.number);

    writer.start_document(fields.len())?;
    for (info, vector) in fields {
        let mut started = false;
        for term in &vector.terms {
            if !started {
                let first = term.positions.first();
                let has_positions = first.is_some_and(|p| p.position != -1);
                let has_offsets = first.is_some_and(|p| p.start_offset != -1);
                writer.start_field(info, vector.terms.len(), has_positions, has_offsets)?;
                started = true;
            }

            writer.start_term(&term.term, term.freq)?;
            for position in &term.positions {
                writer.add_position(position.position, position.start_offset, position.end_offset)?;
            }
        }
    }
    Ok(())
}

/// Random access to the term vectors of one segment.
pub trait TermVectorsReader: Send {
    /// Vectors of `doc`, or `None` when it has none.
    fn get(&mut self, doc: u32) -> Result<Option<DocTermVectors>>;

    /// Number of documents in the segment.
    fn num_docs(&self) -> u32;

    /// An independent cursor over the same files.
    fn clone_reader(&self) -> Result<Box<dyn TermVectorsReader>>;

    /// Verify the checksums of the underlying files.
    fn check_integrity(&mut self) -> Result<()>;
}

/// Creates term vector readers and writers.
pub trait TermVectorsFormat: Send + Sync {
    fn vectors_reader(
        &self,
        storage: &dyn Storage,
        segment: &str,
        field_infos: Arc<FieldInfos>,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Box<dyn TermVectorsReader>>;

    fn vectors_writer(
        &self,
        storage: Arc<dyn Storage>,
        segment: &str,
        context: IoContext,
    ) -> Result<Box<dyn TermVectorsWriter>>;
}
