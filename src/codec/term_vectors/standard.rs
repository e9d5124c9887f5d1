//! The standard term vectors format.
//!
//! - `.tvx`: per document, a pointer into `.tvd` and a pointer into `.tvf`
//!   (16 bytes each entry).
//! - `.tvd`: per document, the field count, the field numbers, and the
//!   `.tvf` pointer deltas of every field after the first.
//! - `.tvf`: per field, the term count, a flags byte, then prefix-coded
//!   terms with their frequencies, positions and offsets.

use std::sync::Arc;

use crate::codec::codec_util;
use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::codec::term_vectors::{
    DocTermVectors, FieldTermVector, TermVectorPosition, TermVectorTerm, TermVectorsFormat,
    TermVectorsReader, TermVectorsWriter,
};
use crate::error::{QuiverError, Result};
use crate::index::file_names::{
    self, VECTORS_DOCUMENTS_EXTENSION, VECTORS_FIELDS_EXTENSION, VECTORS_INDEX_EXTENSION,
};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IoContext, Storage, StorageInput, StorageOutput};

const CODEC_NAME_INDEX: &str = "Quiver10TermVectorsIndex";
const CODEC_NAME_DOCS: &str = "Quiver10TermVectorsDocs";
const CODEC_NAME_FIELDS: &str = "Quiver10TermVectorsFields";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = 0;

const STORE_POSITIONS: u8 = 0x1;
const STORE_OFFSETS: u8 = 0x2;

const INDEX_ENTRY_SIZE: u64 = 16;

/// The standard term vectors format.
#[derive(Debug, Clone, Default)]
pub struct Quiver10TermVectorsFormat;

impl TermVectorsFormat for Quiver10TermVectorsFormat {
    fn vectors_reader(
        &self,
        storage: &dyn Storage,
        segment: &str,
        _field_infos: Arc<FieldInfos>,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Box<dyn TermVectorsReader>> {
        Ok(Box::new(Quiver10TermVectorsReader::open(
            storage, segment, num_docs, context,
        )?))
    }

    fn vectors_writer(
        &self,
        storage: Arc<dyn Storage>,
        segment: &str,
        context: IoContext,
    ) -> Result<Box<dyn TermVectorsWriter>> {
        Ok(Box::new(Quiver10TermVectorsWriter::new(
            storage, segment, context,
        )?))
    }
}

type Output = StructWriter<Box<dyn StorageOutput>>;

struct Outputs {
    index: Output,
    docs: Output,
    fields: Output,
}

/// Bookkeeping for the field being written.
#[derive(Default)]
struct FieldState {
    number: u32,
    has_positions: bool,
    has_offsets: bool,
    terms_left: usize,
    has_term: bool,
    last_term: Vec<u8>,
    /// Positions still owed for the current term.
    positions_left: u32,
    last_position: i32,
    last_start_offset: i32,
}

/// Writes `.tvx` / `.tvd` / `.tvf`.
pub struct Quiver10TermVectorsWriter {
    storage: Arc<dyn Storage>,
    file_names: [String; 3],
    outputs: Option<Outputs>,
    num_docs: u32,
    in_document: bool,
    fields_left: usize,
    /// `(field number, .tvf pointer)` of the current document's fields.
    doc_fields: Vec<(u32, u64)>,
    field: Option<FieldState>,
}

impl Quiver10TermVectorsWriter {
    /// Create the three output files and write their headers.
    pub fn new(storage: Arc<dyn Storage>, segment: &str, context: IoContext) -> Result<Self> {
        let file_names = [
            file_names::segment_file_name(segment, VECTORS_INDEX_EXTENSION),
            file_names::segment_file_name(segment, VECTORS_DOCUMENTS_EXTENSION),
            file_names::segment_file_name(segment, VECTORS_FIELDS_EXTENSION),
        ];

        let mut writer = Quiver10TermVectorsWriter {
            storage,
            file_names,
            outputs: None,
            num_docs: 0,
            in_document: false,
            fields_left: 0,
            doc_fields: Vec::new(),
            field: None,
        };

        let result = (|| {
            let storage = writer.storage.as_ref();
            let index = codec_util::create_output(
                storage,
                &writer.file_names[0],
                CODEC_NAME_INDEX,
                VERSION_CURRENT,
                context,
            )?;
            let docs = codec_util::create_output(
                storage,
                &writer.file_names[1],
                CODEC_NAME_DOCS,
                VERSION_CURRENT,
                context,
            )?;
            let fields = codec_util::create_output(
                storage,
                &writer.file_names[2],
                CODEC_NAME_FIELDS,
                VERSION_CURRENT,
                context,
            )?;
            Ok::<_, QuiverError>(Outputs {
                index,
                docs,
                fields,
            })
        })();

        match result {
            Ok(outputs) => {
                writer.outputs = Some(outputs);
                Ok(writer)
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    fn outputs(&mut self) -> Result<&mut Outputs> {
        self.outputs.as_mut().ok_or_else(|| {
            QuiverError::invalid_operation("term vectors writer is already finished or aborted")
        })
    }

    fn finish_term(&mut self) -> Result<()> {
        if let Some(field) = &self.field
            && field.positions_left != 0
        {
            return Err(QuiverError::invalid_operation(format!(
                "term {} of field {} is missing {} positions",
                String::from_utf8_lossy(&field.last_term),
                field.number,
                field.positions_left
            )));
        }
        Ok(())
    }

    fn finish_field(&mut self) -> Result<()> {
        self.finish_term()?;
        if let Some(field) = self.field.take()
            && field.terms_left != 0
        {
            return Err(QuiverError::invalid_operation(format!(
                "field {} is missing {} declared terms",
                field.number, field.terms_left
            )));
        }
        Ok(())
    }

    fn finish_document(&mut self) -> Result<()> {
        if !self.in_document {
            return Ok(());
        }
        self.finish_field()?;
        if self.fields_left != 0 {
            return Err(QuiverError::invalid_operation(format!(
                "document is missing {} declared vector fields",
                self.fields_left
            )));
        }

        let doc_fields = std::mem::take(&mut self.doc_fields);
        let docs = &mut self.outputs()?.docs;
        docs.write_varint(doc_fields.len() as u64)?;
        for (number, _) in &doc_fields {
            docs.write_varint(*number as u64)?;
        }
        for pair in doc_fields.windows(2) {
            docs.write_varint(pair[1].1 - pair[0].1)?;
        }

        self.in_document = false;
        Ok(())
    }
}

impl TermVectorsWriter for Quiver10TermVectorsWriter {
    fn start_document(&mut self, num_vector_fields: usize) -> Result<()> {
        self.finish_document()?;

        let outputs = self.outputs()?;
        let docs_pointer = outputs.docs.position();
        let fields_pointer = outputs.fields.position();
        outputs.index.write_u64(docs_pointer)?;
        outputs.index.write_u64(fields_pointer)?;

        self.in_document = true;
        self.fields_left = num_vector_fields;
        self.num_docs += 1;
        Ok(())
    }

    fn start_field(
        &mut self,
        field: &FieldInfo,
        num_terms: usize,
        has_positions: bool,
        has_offsets: bool,
    ) -> Result<()> {
        if !self.in_document || self.fields_left == 0 {
            return Err(QuiverError::invalid_operation(format!(
                "field {} started beyond the declared vector field count",
                field.name
            )));
        }
        self.finish_field()?;
        if let Some((last, _)) = self.doc_fields.last()
            && *last >= field.number
        {
            return Err(QuiverError::invalid_operation(format!(
                "vector field {} written after field {last}",
                field.number
            )));
        }

        let fields = &mut self.outputs()?.fields;
        let pointer = fields.position();
        fields.write_varint(num_terms as u64)?;
        let mut flags = 0u8;
        if has_positions {
            flags |= STORE_POSITIONS;
        }
        if has_offsets {
            flags |= STORE_OFFSETS;
        }
        fields.write_u8(flags)?;

        self.doc_fields.push((field.number, pointer));
        self.fields_left -= 1;
        self.field = Some(FieldState {
            number: field.number,
            has_positions,
            has_offsets,
            terms_left: num_terms,
            ..FieldState::default()
        });
        Ok(())
    }

    fn start_term(&mut self, term: &[u8], freq: u32) -> Result<()> {
        self.finish_term()?;
        let mut field = self
            .field
            .take()
            .ok_or_else(|| QuiverError::invalid_operation("term started outside of a field"))?;

        let result = (|| {
            if field.terms_left == 0 {
                return Err(QuiverError::invalid_operation(format!(
                    "field {} received more terms than declared",
                    field.number
                )));
            }
            if freq == 0 {
                return Err(QuiverError::invalid_argument("term frequency must be positive"));
            }
            if field.has_term && term <= field.last_term.as_slice() {
                return Err(QuiverError::invalid_operation(format!(
                    "term {} is not after {}",
                    String::from_utf8_lossy(term),
                    String::from_utf8_lossy(&field.last_term)
                )));
            }

            let shared = field
                .last_term
                .iter()
                .zip(term)
                .take_while(|(a, b)| a == b)
                .count();
            let fields = &mut self.outputs()?.fields;
            fields.write_varint(shared as u64)?;
            fields.write_varint((term.len() - shared) as u64)?;
            fields.write_raw(&term[shared..])?;
            fields.write_varint(freq as u64)?;
            Ok(())
        })();

        if result.is_ok() {
            field.terms_left -= 1;
            field.has_term = true;
            field.last_term = term.to_vec();
            field.positions_left = if field.has_positions || field.has_offsets {
                freq
            } else {
                0
            };
            field.last_position = 0;
            field.last_start_offset = 0;
        }
        self.field = Some(field);
        result
    }

    fn add_position(&mut self, position: i32, start_offset: i32, end_offset: i32) -> Result<()> {
        let mut field = self
            .field
            .take()
            .ok_or_else(|| QuiverError::invalid_operation("position added outside of a field"))?;

        let result = (|| {
            if field.positions_left == 0 {
                return Err(QuiverError::invalid_operation(format!(
                    "field {} term received more positions than its frequency",
                    field.number
                )));
            }
            let fields = &mut self.outputs()?.fields;
            if field.has_positions {
                if position < field.last_position {
                    return Err(QuiverError::invalid_argument(format!(
                        "position {position} is before {}",
                        field.last_position
                    )));
                }
                fields.write_varint((position - field.last_position) as u64)?;
            }
            if field.has_offsets {
                if start_offset < 0 || end_offset < start_offset {
                    return Err(QuiverError::invalid_argument(format!(
                        "invalid offsets [{start_offset}, {end_offset})"
                    )));
                }
                fields.write_zigzag(start_offset as i64 - field.last_start_offset as i64)?;
                fields.write_varint((end_offset - start_offset) as u64)?;
            }
            Ok(())
        })();

        if result.is_ok() {
            field.positions_left -= 1;
            if field.has_positions {
                field.last_position = position;
            }
            if field.has_offsets {
                field.last_start_offset = start_offset;
            }
        }
        self.field = Some(field);
        result
    }

    fn finish(&mut self, _field_infos: &FieldInfos, num_docs: u32) -> Result<()> {
        self.finish_document()?;
        if num_docs != self.num_docs {
            return Err(QuiverError::invalid_operation(format!(
                "term vectors finish called with {num_docs} docs but {} were written",
                self.num_docs
            )));
        }

        let expected_index_size =
            codec_util::header_length(CODEC_NAME_INDEX) + INDEX_ENTRY_SIZE * num_docs as u64;
        let index_position = self.outputs()?.index.position();
        if index_position != expected_index_size {
            return Err(QuiverError::invalid_operation(format!(
                "{} is {index_position} bytes but {num_docs} docs need {expected_index_size}",
                self.file_names[0]
            )));
        }

        if let Some(outputs) = self.outputs.take() {
            codec_util::finish_output(outputs.index)?;
            codec_util::finish_output(outputs.docs)?;
            codec_util::finish_output(outputs.fields)?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.outputs = None;
        for name in &self.file_names {
            if let Err(e) = self.storage.delete_file(name) {
                log::warn!("Failed to delete {name} while aborting term vectors: {e}");
            }
        }
    }
}

type Input = StructReader<Box<dyn StorageInput>>;

/// Reads `.tvx` / `.tvd` / `.tvf`.
pub struct Quiver10TermVectorsReader {
    file_names: [String; 3],
    index_in: Input,
    docs_in: Input,
    fields_in: Input,
    index_start: u64,
    num_docs: u32,
}

impl Quiver10TermVectorsReader {
    /// Open the three files and check that the index matches `num_docs`.
    pub fn open(
        storage: &dyn Storage,
        segment: &str,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Self> {
        let file_names = [
            file_names::segment_file_name(segment, VECTORS_INDEX_EXTENSION),
            file_names::segment_file_name(segment, VECTORS_DOCUMENTS_EXTENSION),
            file_names::segment_file_name(segment, VECTORS_FIELDS_EXTENSION),
        ];

        let open = |name: &str, codec: &str| {
            codec_util::open_checked_input(
                storage,
                name,
                codec,
                VERSION_START,
                VERSION_CURRENT,
                context,
            )
        };
        let index_in = open(&file_names[0], CODEC_NAME_INDEX)?;
        let docs_in = open(&file_names[1], CODEC_NAME_DOCS)?;
        let fields_in = open(&file_names[2], CODEC_NAME_FIELDS)?;

        let index_start = index_in.position();
        let index_bytes = index_in.size() - codec_util::FOOTER_LENGTH - index_start;
        if index_bytes != INDEX_ENTRY_SIZE * num_docs as u64 {
            return Err(QuiverError::corrupt_index(format!(
                "{}: holds {} docs but segment has {num_docs}",
                file_names[0],
                index_bytes / INDEX_ENTRY_SIZE
            )));
        }

        Ok(Quiver10TermVectorsReader {
            file_names,
            index_in,
            docs_in,
            fields_in,
            index_start,
            num_docs,
        })
    }

    fn read_field(&mut self, number: u32, pointer: u64) -> Result<FieldTermVector> {
        let input = &mut self.fields_in;
        input.seek(pointer)?;

        let num_terms = input.read_varint()?;
        let flags = input.read_u8()?;
        let has_positions = flags & STORE_POSITIONS != 0;
        let has_offsets = flags & STORE_OFFSETS != 0;

        let mut terms = Vec::new();
        let mut last_term: Vec<u8> = Vec::new();
        for _ in 0..num_terms {
            let shared = input.read_varint()? as usize;
            let suffix_len = input.read_varint()? as usize;
            if shared > last_term.len() {
                return Err(QuiverError::corrupt_index(format!(
                    "{}: shared prefix {shared} longer than previous term",
                    self.file_names[2]
                )));
            }
            let mut term = last_term[..shared].to_vec();
            term.extend_from_slice(&input.read_raw(suffix_len)?);
            let freq = input.read_varint_u32()?;

            let mut positions = Vec::new();
            if has_positions || has_offsets {
                let mut last_position = 0i32;
                let mut last_start = 0i64;
                for _ in 0..freq {
                    let mut entry = TermVectorPosition {
                        position: -1,
                        start_offset: -1,
                        end_offset: -1,
                    };
                    if has_positions {
                        last_position += input.read_varint_u32()? as i32;
                        entry.position = last_position;
                    }
                    if has_offsets {
                        last_start += input.read_zigzag()?;
                        let length = input.read_varint_u32()? as i64;
                        entry.start_offset = last_start as i32;
                        entry.end_offset = (last_start + length) as i32;
                    }
                    positions.push(entry);
                }
            }

            last_term = term.clone();
            terms.push(TermVectorTerm {
                term,
                freq,
                positions,
            });
        }

        Ok(FieldTermVector {
            field: number,
            has_positions,
            has_offsets,
            terms,
        })
    }

    fn clone_input(input: &Input) -> Result<Input> {
        StructReader::new(input.get_ref().clone_input()?)
    }
}

impl TermVectorsReader for Quiver10TermVectorsReader {
    fn get(&mut self, doc: u32) -> Result<Option<DocTermVectors>> {
        if doc >= self.num_docs {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} out of range [0, {})",
                self.num_docs
            )));
        }

        self.index_in
            .seek(self.index_start + INDEX_ENTRY_SIZE * doc as u64)?;
        let docs_pointer = self.index_in.read_u64()?;
        let fields_pointer = self.index_in.read_u64()?;

        self.docs_in.seek(docs_pointer)?;
        let num_fields = self.docs_in.read_varint()? as usize;
        if num_fields == 0 {
            return Ok(None);
        }

        let mut numbers = Vec::with_capacity(num_fields);
        for _ in 0..num_fields {
            numbers.push(self.docs_in.read_varint_u32()?);
        }
        let mut pointers = Vec::with_capacity(num_fields);
        pointers.push(fields_pointer);
        for i in 1..num_fields {
            pointers.push(pointers[i - 1] + self.docs_in.read_varint()?);
        }

        let mut fields = Vec::with_capacity(num_fields);
        for (number, pointer) in numbers.into_iter().zip(pointers) {
            fields.push(self.read_field(number, pointer)?);
        }
        Ok(Some(DocTermVectors { fields }))
    }

    fn num_docs(&self) -> u32 {
        self.num_docs
    }

    fn clone_reader(&self) -> Result<Box<dyn TermVectorsReader>> {
        Ok(Box::new(Quiver10TermVectorsReader {
            file_names: self.file_names.clone(),
            index_in: Self::clone_input(&self.index_in)?,
            docs_in: Self::clone_input(&self.docs_in)?,
            fields_in: Self::clone_input(&self.fields_in)?,
            index_start: self.index_start,
            num_docs: self.num_docs,
        }))
    }

    fn check_integrity(&mut self) -> Result<()> {
        for (input, name) in [
            (&self.index_in, &self.file_names[0]),
            (&self.docs_in, &self.file_names[1]),
            (&self.fields_in, &self.file_names[2]),
        ] {
            let mut copy = input.get_ref().clone_input()?;
            codec_util::checksum_entire_file(copy.as_mut(), name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_infos::IndexOptions;
    use crate::storage::memory::MemoryStorage;

    fn infos() -> FieldInfos {
        let options = Some(IndexOptions::DocsAndFreqsAndPositions);
        FieldInfos::new(vec![
            FieldInfo::new("title", 0, options).with_term_vectors(),
            FieldInfo::new("body", 1, options).with_term_vectors(),
        ])
        .unwrap()
    }

    fn pos(position: i32, start_offset: i32, end_offset: i32) -> TermVectorPosition {
        TermVectorPosition {
            position,
            start_offset,
            end_offset,
        }
    }

    #[test]
    fn test_write_read_vectors() {
        let memory = Arc::new(MemoryStorage::new());
        let storage: Arc<dyn Storage> = memory.clone();
        let infos = infos();
        let title = infos.field_info("title").unwrap();
        let body = infos.field_info("body").unwrap();

        let mut writer =
            Quiver10TermVectorsWriter::new(storage.clone(), "_0", IoContext::Default).unwrap();

        // doc 0: two fields
        writer.start_document(2).unwrap();
        writer.start_field(title, 2, true, true).unwrap();
        writer.start_term(b"apple", 2).unwrap();
        writer.add_position(0, 0, 5).unwrap();
        writer.add_position(3, 12, 17).unwrap();
        writer.start_term(b"apricot", 1).unwrap();
        writer.add_position(1, 6, 13).unwrap();
        writer.start_field(body, 1, false, false).unwrap();
        writer.start_term(b"zebra", 4).unwrap();

        // doc 1: nothing
        writer.start_document(0).unwrap();

        // doc 2: offsets only
        writer.start_document(1).unwrap();
        writer.start_field(body, 1, false, true).unwrap();
        writer.start_term(b"cat", 1).unwrap();
        writer.add_position(-1, 4, 7).unwrap();

        writer.finish(&infos, 3).unwrap();

        let mut reader =
            Quiver10TermVectorsReader::open(storage.as_ref(), "_0", 3, IoContext::Default)
                .unwrap();
        reader.check_integrity().unwrap();

        let doc0 = reader.get(0).unwrap().unwrap();
        assert_eq!(doc0.fields.len(), 2);
        let title_vector = doc0.field(0).unwrap();
        assert!(title_vector.has_positions && title_vector.has_offsets);
        assert_eq!(title_vector.terms[0].term, b"apple");
        assert_eq!(
            title_vector.terms[0].positions,
            vec![pos(0, 0, 5), pos(3, 12, 17)]
        );
        assert_eq!(title_vector.terms[1].term, b"apricot");
        assert_eq!(title_vector.terms[1].positions, vec![pos(1, 6, 13)]);
        let body_vector = doc0.field(1).unwrap();
        assert_eq!(body_vector.terms[0].freq, 4);
        assert!(body_vector.terms[0].positions.is_empty());

        assert_eq!(reader.get(1).unwrap(), None);

        let mut clone = reader.clone_reader().unwrap();
        let doc2 = clone.get(2).unwrap().unwrap();
        assert_eq!(doc2.fields[0].terms[0].positions, vec![pos(-1, 4, 7)]);
        assert!(reader.get(3).is_err());
    }

    #[test]
    fn test_contract_violations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let infos = infos();
        let title = infos.field_info("title").unwrap();
        let body = infos.field_info("body").unwrap();

        let mut writer =
            Quiver10TermVectorsWriter::new(storage, "_1", IoContext::Default).unwrap();
        writer.start_document(2).unwrap();
        writer.start_field(body, 1, true, false).unwrap();
        // Fields must ascend
        writer.start_term(b"b", 1).unwrap();
        writer.add_position(0, -1, -1).unwrap();
        assert!(writer.start_field(title, 1, true, false).is_err());
    }

    #[test]
    fn test_term_order_and_position_count() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let infos = infos();
        let title = infos.field_info("title").unwrap();

        let mut writer =
            Quiver10TermVectorsWriter::new(storage, "_2", IoContext::Default).unwrap();
        writer.start_document(1).unwrap();
        writer.start_field(title, 3, true, false).unwrap();
        writer.start_term(b"m", 1).unwrap();
        // Missing position for "m"
        assert!(writer.start_term(b"n", 1).is_err());
        writer.add_position(2, -1, -1).unwrap();
        assert!(writer.add_position(3, -1, -1).is_err());
        assert!(writer.start_term(b"a", 1).is_err());
    }

    #[test]
    fn test_abort_and_doc_count_mismatch() {
        let memory = Arc::new(MemoryStorage::new());
        let storage: Arc<dyn Storage> = memory.clone();
        let infos = infos();

        let mut writer =
            Quiver10TermVectorsWriter::new(storage.clone(), "_3", IoContext::Default).unwrap();
        writer.start_document(0).unwrap();
        assert!(writer.finish(&infos, 2).is_err());
        writer.abort();
        assert_eq!(memory.file_count(), 0);

        let mut writer =
            Quiver10TermVectorsWriter::new(storage.clone(), "_4", IoContext::Default).unwrap();
        writer.start_document(0).unwrap();
        writer.finish(&infos, 1).unwrap();
        let err = Quiver10TermVectorsReader::open(storage.as_ref(), "_4", 2, IoContext::Default)
            .err()
            .unwrap();
        assert!(err.is_corruption());
    }
}
