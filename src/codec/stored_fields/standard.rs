//! The standard stored fields format.
//!
//! `.fdx` holds one fixed-width pointer per document into `.fdt`; `.fdt`
//! holds, per document, the field count followed by
//! `(field number, type tag, value)` triples.

use std::sync::Arc;

use crate::codec::codec_util;
use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::codec::stored_fields::{
    StoredFieldVisitor, StoredFieldsFormat, StoredFieldsReader, StoredFieldsWriter, StoredValue,
    VisitStatus,
};
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, FIELDS_EXTENSION, FIELDS_INDEX_EXTENSION};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IoContext, Storage, StorageInput, StorageOutput};

const CODEC_NAME_IDX: &str = "Quiver10StoredFieldsIndex";
const CODEC_NAME_DAT: &str = "Quiver10StoredFieldsData";
const VERSION_START: u32 = 0;
const VERSION_CURRENT: u32 = 0;

const TYPE_TEXT: u8 = 0;
const TYPE_BINARY: u8 = 1;
const TYPE_INT: u8 = 2;
const TYPE_LONG: u8 = 3;
const TYPE_FLOAT: u8 = 4;
const TYPE_DOUBLE: u8 = 5;

/// The standard stored fields format.
#[derive(Debug, Clone, Default)]
pub struct Quiver10StoredFieldsFormat;

impl StoredFieldsFormat for Quiver10StoredFieldsFormat {
    fn fields_reader(
        &self,
        storage: &dyn Storage,
        segment: &str,
        field_infos: Arc<FieldInfos>,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Box<dyn StoredFieldsReader>> {
        Ok(Box::new(Quiver10StoredFieldsReader::open(
            storage,
            segment,
            field_infos,
            num_docs,
            context,
        )?))
    }

    fn fields_writer(
        &self,
        storage: Arc<dyn Storage>,
        segment: &str,
        context: IoContext,
    ) -> Result<Box<dyn StoredFieldsWriter>> {
        Ok(Box::new(Quiver10StoredFieldsWriter::new(
            storage, segment, context,
        )?))
    }
}

type Output = StructWriter<Box<dyn StorageOutput>>;

/// Writes `.fdx` / `.fdt`.
pub struct Quiver10StoredFieldsWriter {
    storage: Arc<dyn Storage>,
    index_name: String,
    fields_name: String,
    index_out: Option<Output>,
    fields_out: Option<Output>,
    num_docs: u32,
    /// Values still owed for the current document.
    pending_fields: usize,
}

impl Quiver10StoredFieldsWriter {
    /// Create both output files and write their headers.
    pub fn new(storage: Arc<dyn Storage>, segment: &str, context: IoContext) -> Result<Self> {
        let index_name = file_names::segment_file_name(segment, FIELDS_INDEX_EXTENSION);
        let fields_name = file_names::segment_file_name(segment, FIELDS_EXTENSION);

        let mut writer = Quiver10StoredFieldsWriter {
            storage,
            index_name,
            fields_name,
            index_out: None,
            fields_out: None,
            num_docs: 0,
            pending_fields: 0,
        };

        let result = (|| {
            writer.fields_out = Some(codec_util::create_output(
                writer.storage.as_ref(),
                &writer.fields_name,
                CODEC_NAME_DAT,
                VERSION_CURRENT,
                context,
            )?);
            writer.index_out = Some(codec_util::create_output(
                writer.storage.as_ref(),
                &writer.index_name,
                CODEC_NAME_IDX,
                VERSION_CURRENT,
                context,
            )?);
            Ok::<_, QuiverError>(())
        })();

        if let Err(e) = result {
            writer.abort();
            return Err(e);
        }
        Ok(writer)
    }

    fn outputs(&mut self) -> Result<(&mut Output, &mut Output)> {
        match (self.index_out.as_mut(), self.fields_out.as_mut()) {
            (Some(index_out), Some(fields_out)) => Ok((index_out, fields_out)),
            _ => Err(QuiverError::invalid_operation(
                "stored fields writer is already finished or aborted",
            )),
        }
    }

    fn write_value(out: &mut Output, value: &StoredValue) -> Result<()> {
        match value {
            StoredValue::Text(text) => {
                out.write_u8(TYPE_TEXT)?;
                out.write_string(text)
            }
            StoredValue::Binary(bytes) => {
                out.write_u8(TYPE_BINARY)?;
                out.write_bytes(bytes)
            }
            StoredValue::Int(v) => {
                out.write_u8(TYPE_INT)?;
                out.write_u32(*v as u32)
            }
            StoredValue::Long(v) => {
                out.write_u8(TYPE_LONG)?;
                out.write_i64(*v)
            }
            StoredValue::Float(v) => {
                out.write_u8(TYPE_FLOAT)?;
                out.write_f32(*v)
            }
            StoredValue::Double(v) => {
                out.write_u8(TYPE_DOUBLE)?;
                out.write_f64(*v)
            }
        }
    }
}

impl StoredFieldsWriter for Quiver10StoredFieldsWriter {
    fn start_document(&mut self, num_stored_fields: usize) -> Result<()> {
        if self.pending_fields != 0 {
            return Err(QuiverError::invalid_operation(format!(
                "previous document is missing {} declared stored fields",
                self.pending_fields
            )));
        }

        let (index_out, fields_out) = self.outputs()?;
        index_out.write_u64(fields_out.position())?;
        fields_out.write_varint(num_stored_fields as u64)?;

        self.pending_fields = num_stored_fields;
        self.num_docs += 1;
        Ok(())
    }

    fn write_field(&mut self, field: &FieldInfo, value: &StoredValue) -> Result<()> {
        if self.pending_fields == 0 {
            return Err(QuiverError::invalid_operation(format!(
                "field {} written beyond the declared stored field count",
                field.name
            )));
        }

        let (_, fields_out) = self.outputs()?;
        fields_out.write_varint(field.number as u64)?;
        Self::write_value(fields_out, value)?;

        self.pending_fields -= 1;
        Ok(())
    }

    fn finish(&mut self, _field_infos: &FieldInfos, num_docs: u32) -> Result<()> {
        if self.pending_fields != 0 {
            return Err(QuiverError::invalid_operation(format!(
                "last document is missing {} declared stored fields",
                self.pending_fields
            )));
        }
        if num_docs != self.num_docs {
            return Err(QuiverError::invalid_operation(format!(
                "stored fields finish called with {num_docs} docs but {} were written",
                self.num_docs
            )));
        }

        let expected_index_size =
            codec_util::header_length(CODEC_NAME_IDX) + 8 * self.num_docs as u64;
        let index_size = self.outputs()?.0.position();
        if index_size != expected_index_size {
            return Err(QuiverError::invalid_operation(format!(
                "{} is {index_size} bytes but {num_docs} docs need {expected_index_size}",
                self.index_name
            )));
        }

        if let Some(out) = self.index_out.take() {
            codec_util::finish_output(out)?;
        }
        if let Some(out) = self.fields_out.take() {
            codec_util::finish_output(out)?;
        }
        Ok(())
    }

    fn abort(&mut self) {
        self.index_out = None;
        self.fields_out = None;
        for name in [&self.index_name, &self.fields_name] {
            if let Err(e) = self.storage.delete_file(name) {
                log::warn!("Failed to delete {name} while aborting stored fields: {e}");
            }
        }
    }
}

type Input = StructReader<Box<dyn StorageInput>>;

/// Reads `.fdx` / `.fdt`.
pub struct Quiver10StoredFieldsReader {
    field_infos: Arc<FieldInfos>,
    index_name: String,
    fields_name: String,
    index_in: Input,
    fields_in: Input,
    index_start: u64,
    num_docs: u32,
}

impl Quiver10StoredFieldsReader {
    /// Open both files and check that the index matches `num_docs`.
    pub fn open(
        storage: &dyn Storage,
        segment: &str,
        field_infos: Arc<FieldInfos>,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Self> {
        let index_name = file_names::segment_file_name(segment, FIELDS_INDEX_EXTENSION);
        let fields_name = file_names::segment_file_name(segment, FIELDS_EXTENSION);

        let index_in = codec_util::open_checked_input(
            storage,
            &index_name,
            CODEC_NAME_IDX,
            VERSION_START,
            VERSION_CURRENT,
            context,
        )?;
        let fields_in = codec_util::open_checked_input(
            storage,
            &fields_name,
            CODEC_NAME_DAT,
            VERSION_START,
            VERSION_CURRENT,
            context,
        )?;

        let index_start = index_in.position();
        let index_bytes = index_in.size() - codec_util::FOOTER_LENGTH - index_start;
        if index_bytes != 8 * num_docs as u64 {
            return Err(QuiverError::corrupt_index(format!(
                "{index_name}: holds {} docs but segment has {num_docs}",
                index_bytes / 8
            )));
        }

        Ok(Quiver10StoredFieldsReader {
            field_infos,
            index_name,
            fields_name,
            index_in,
            fields_in,
            index_start,
            num_docs,
        })
    }

    fn read_value(&mut self, tag: u8) -> Result<StoredValue> {
        let input = &mut self.fields_in;
        Ok(match tag {
            TYPE_TEXT => StoredValue::Text(input.read_string()?),
            TYPE_BINARY => StoredValue::Binary(input.read_bytes()?),
            TYPE_INT => StoredValue::Int(input.read_u32()? as i32),
            TYPE_LONG => StoredValue::Long(input.read_i64()?),
            TYPE_FLOAT => StoredValue::Float(input.read_f32()?),
            TYPE_DOUBLE => StoredValue::Double(input.read_f64()?),
            other => return Err(Self::bad_tag(other)),
        })
    }

    fn skip_value(&mut self, tag: u8) -> Result<()> {
        let input = &mut self.fields_in;
        let fixed = match tag {
            TYPE_TEXT | TYPE_BINARY => return input.skip_bytes(),
            TYPE_INT | TYPE_FLOAT => 4,
            TYPE_LONG | TYPE_DOUBLE => 8,
            other => return Err(Self::bad_tag(other)),
        };
        let position = input.position() + fixed;
        input.seek(position)
    }

    fn bad_tag(tag: u8) -> QuiverError {
        QuiverError::corrupt_index(format!("Unknown stored field type tag: {tag}"))
    }

    fn clone_input(input: &Input) -> Result<Input> {
        StructReader::new(input.get_ref().clone_input()?)
    }
}

impl StoredFieldsReader for Quiver10StoredFieldsReader {
    fn visit_document(&mut self, doc: u32, visitor: &mut dyn StoredFieldVisitor) -> Result<()> {
        if doc >= self.num_docs {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} out of range [0, {})",
                self.num_docs
            )));
        }

        self.index_in.seek(self.index_start + 8 * doc as u64)?;
        let pointer = self.index_in.read_u64()?;
        self.fields_in.seek(pointer)?;

        let num_fields = self.fields_in.read_varint()?;
        for _ in 0..num_fields {
            let number = self.fields_in.read_varint_u32()?;
            let field_infos = Arc::clone(&self.field_infos);
            let field = field_infos.field_info_by_number(number).ok_or_else(|| {
                QuiverError::corrupt_index(format!(
                    "{}: unknown field number {number} in doc {doc}",
                    self.fields_name
                ))
            })?;
            let tag = self.fields_in.read_u8()?;

            match visitor.needs_field(field) {
                VisitStatus::Yes => {
                    let value = self.read_value(tag)?;
                    visitor.visit(field, value)?;
                }
                VisitStatus::No => self.skip_value(tag)?,
                VisitStatus::Stop => return Ok(()),
            }
        }
        Ok(())
    }

    fn num_docs(&self) -> u32 {
        self.num_docs
    }

    fn clone_reader(&self) -> Result<Box<dyn StoredFieldsReader>> {
        Ok(Box::new(Quiver10StoredFieldsReader {
            field_infos: Arc::clone(&self.field_infos),
            index_name: self.index_name.clone(),
            fields_name: self.fields_name.clone(),
            index_in: Self::clone_input(&self.index_in)?,
            fields_in: Self::clone_input(&self.fields_in)?,
            index_start: self.index_start,
            num_docs: self.num_docs,
        }))
    }

    fn check_integrity(&mut self) -> Result<()> {
        let mut index = self.index_in.get_ref().clone_input()?;
        codec_util::checksum_entire_file(index.as_mut(), &self.index_name)?;
        let mut fields = self.fields_in.get_ref().clone_input()?;
        codec_util::checksum_entire_file(fields.as_mut(), &self.fields_name)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_infos::IndexOptions;
    use crate::codec::stored_fields::DocumentStoredFieldVisitor;
    use crate::storage::memory::MemoryStorage;

    fn field_infos() -> Arc<FieldInfos> {
        Arc::new(
            FieldInfos::new(vec![
                FieldInfo::new("id", 0, Some(IndexOptions::DocsOnly)),
                FieldInfo::new("body", 1, Some(IndexOptions::DocsAndFreqs)),
                FieldInfo::new("num", 2, None),
            ])
            .unwrap(),
        )
    }

    fn write_docs(storage: Arc<dyn Storage>, infos: &FieldInfos, docs: &[Vec<(u32, StoredValue)>]) {
        let format = Quiver10StoredFieldsFormat;
        let mut writer = format.fields_writer(storage, "_0", IoContext::Default).unwrap();
        for doc in docs {
            writer.start_document(doc.len()).unwrap();
            for (number, value) in doc {
                let field = infos.field_info_by_number(*number).unwrap();
                writer.write_field(field, value).unwrap();
            }
        }
        writer.finish(infos, docs.len() as u32).unwrap();
    }

    fn visit_all(reader: &mut dyn StoredFieldsReader, doc: u32) -> Vec<(String, StoredValue)> {
        let mut visitor = DocumentStoredFieldVisitor::new();
        reader.visit_document(doc, &mut visitor).unwrap();
        visitor.into_document().fields
    }

    #[test]
    fn test_write_read_documents() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        let docs = vec![
            vec![
                (0, StoredValue::from("doc-0")),
                (1, StoredValue::from("hello world")),
                (2, StoredValue::Double(1.5)),
            ],
            vec![],
            vec![
                (0, StoredValue::from("doc-2")),
                (2, StoredValue::Int(-7)),
                (2, StoredValue::Binary(vec![0, 255])),
                (2, StoredValue::Float(0.25)),
                (2, StoredValue::Long(i64::MIN)),
            ],
        ];
        write_docs(storage.clone(), &infos, &docs);

        let format = Quiver10StoredFieldsFormat;
        let mut reader = format
            .fields_reader(storage.as_ref(), "_0", infos.clone(), 3, IoContext::Default)
            .unwrap();
        assert_eq!(reader.num_docs(), 3);
        reader.check_integrity().unwrap();

        for (doc_id, expected) in docs.iter().enumerate() {
            let fields = visit_all(reader.as_mut(), doc_id as u32);
            let expected: Vec<(String, StoredValue)> = expected
                .iter()
                .map(|(n, v)| (infos.field_info_by_number(*n).unwrap().name.clone(), v.clone()))
                .collect();
            assert_eq!(fields, expected);
        }

        // Reading out of order and through a clone works too
        let mut clone = reader.clone_reader().unwrap();
        assert_eq!(visit_all(clone.as_mut(), 2).len(), 5);
        assert_eq!(visit_all(reader.as_mut(), 0).len(), 3);

        assert!(reader
            .visit_document(3, &mut DocumentStoredFieldVisitor::new())
            .is_err());
    }

    #[test]
    fn test_visitor_skip_and_stop() {
        struct StopAfterId {
            seen: Vec<String>,
        }
        impl StoredFieldVisitor for StopAfterId {
            fn needs_field(&mut self, field: &FieldInfo) -> VisitStatus {
                match field.name.as_str() {
                    "body" => VisitStatus::No,
                    "num" => VisitStatus::Stop,
                    _ => VisitStatus::Yes,
                }
            }
            fn visit(&mut self, _field: &FieldInfo, value: StoredValue) -> Result<()> {
                self.seen.push(value.as_text().unwrap_or_default().to_string());
                Ok(())
            }
        }

        let storage = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        write_docs(
            storage.clone(),
            &infos,
            &[vec![
                (1, StoredValue::from("skipped")),
                (0, StoredValue::from("kept")),
                (2, StoredValue::Long(1)),
                (0, StoredValue::from("never")),
            ]],
        );

        let mut reader =
            Quiver10StoredFieldsReader::open(storage.as_ref(), "_0", infos, 1, IoContext::Default)
                .unwrap();
        let mut visitor = StopAfterId { seen: Vec::new() };
        reader.visit_document(0, &mut visitor).unwrap();
        assert_eq!(visitor.seen, vec!["kept"]);
    }

    #[test]
    fn test_contract_violations() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        let field = infos.field_info("id").unwrap();

        let mut writer = Quiver10StoredFieldsWriter::new(storage.clone(), "_1", IoContext::Default)
            .unwrap();
        writer.start_document(1).unwrap();
        writer.write_field(field, &"a".into()).unwrap();
        // More fields than declared
        assert!(writer.write_field(field, &"b".into()).is_err());
        // Fewer fields than declared
        writer.start_document(2).unwrap();
        writer.write_field(field, &"c".into()).unwrap();
        assert!(writer.start_document(0).is_err());
        writer.write_field(field, &"d".into()).unwrap();
        // Undercounted finish
        assert!(writer.finish(&infos, 1).is_err());
        writer.finish(&infos, 2).unwrap();
    }

    #[test]
    fn test_abort_removes_files() {
        let memory = Arc::new(MemoryStorage::new());
        let storage: Arc<dyn Storage> = memory.clone();
        let mut writer =
            Quiver10StoredFieldsWriter::new(storage, "_2", IoContext::Default).unwrap();
        writer.start_document(0).unwrap();
        writer.abort();
        assert_eq!(memory.file_count(), 0);
    }

    #[test]
    fn test_finish_rejects_wrong_doc_count() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        let format = Quiver10StoredFieldsFormat;
        let mut writer = format
            .fields_writer(Arc::clone(&storage), "_0", IoContext::Default)
            .unwrap();
        for _ in 0..2 {
            writer.start_document(0).unwrap();
        }

        let err = writer.finish(&infos, 3).unwrap_err();
        assert!(matches!(err, QuiverError::InvalidOperation(_)));
        writer.finish(&infos, 2).unwrap();
        assert!(storage.file_exists("_0.fdx"));
        assert!(storage.file_exists("_0.fdt"));
    }

    #[test]
    fn test_doc_count_mismatch_is_corruption() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        write_docs(storage.clone(), &infos, &[vec![], vec![]]);

        let result =
            Quiver10StoredFieldsReader::open(storage.as_ref(), "_0", infos, 3, IoContext::Default);
        assert!(result.err().unwrap().is_corruption());
    }
}
