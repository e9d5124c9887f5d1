//! Stored fields: verbatim field values per document.
//!
//! Writers receive documents strictly in order; readers address them by
//! ordinal and push values to a [`StoredFieldVisitor`], so a caller that only
//! needs one field never decodes the rest.

pub mod standard;

use std::sync::Arc;

use ahash::AHashSet;

use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::error::{QuiverError, Result};
use crate::index::merge_state::{MergeCursor, MergeState};
use crate::storage::{IoContext, Storage};

/// Work units reported to the abort checker for every copied document.
pub const MERGE_DOC_WORK_UNITS: u64 = 300;

/// A stored field value.
#[derive(Debug, Clone, PartialEq)]
pub enum StoredValue {
    Text(String),
    Binary(Vec<u8>),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl StoredValue {
    /// Get the value as text, if it is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Get the value as bytes, if it is binary.
    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            StoredValue::Binary(b) => Some(b),
            _ => None,
        }
    }
}

impl From<&str> for StoredValue {
    fn from(value: &str) -> Self {
        StoredValue::Text(value.to_string())
    }
}

impl From<String> for StoredValue {
    fn from(value: String) -> Self {
        StoredValue::Text(value)
    }
}

impl From<Vec<u8>> for StoredValue {
    fn from(value: Vec<u8>) -> Self {
        StoredValue::Binary(value)
    }
}

impl From<i32> for StoredValue {
    fn from(value: i32) -> Self {
        StoredValue::Int(value)
    }
}

impl From<i64> for StoredValue {
    fn from(value: i64) -> Self {
        StoredValue::Long(value)
    }
}

impl From<f32> for StoredValue {
    fn from(value: f32) -> Self {
        StoredValue::Float(value)
    }
}

impl From<f64> for StoredValue {
    fn from(value: f64) -> Self {
        StoredValue::Double(value)
    }
}

/// Answer of a visitor about the next stored field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitStatus {
    /// Decode the value and pass it to [`StoredFieldVisitor::visit`].
    Yes,
    /// Skip the value without decoding it.
    No,
    /// Stop visiting this document.
    Stop,
}

/// Receives the stored values of one document, in the order they were
/// written.
pub trait StoredFieldVisitor {
    /// Decide what to do with the next field.
    fn needs_field(&mut self, field: &FieldInfo) -> VisitStatus;

    /// Receive a decoded value.
    fn visit(&mut self, field: &FieldInfo, value: StoredValue) -> Result<()>;
}

/// The stored values of one document.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredDocument {
    pub fields: Vec<(String, StoredValue)>,
}

impl StoredDocument {
    /// First value of a field.
    pub fn get(&self, name: &str) -> Option<&StoredValue> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    /// All values of a field, in write order.
    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a StoredValue> + 'a {
        self.fields
            .iter()
            .filter(move |(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// Collects all (or a named subset of) stored fields into a
/// [`StoredDocument`].
#[derive(Debug, Default)]
pub struct DocumentStoredFieldVisitor {
    fields_to_load: Option<AHashSet<String>>,
    document: StoredDocument,
}

impl DocumentStoredFieldVisitor {
    /// Load every field.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load only the named fields.
    pub fn with_fields<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        DocumentStoredFieldVisitor {
            fields_to_load: Some(names.into_iter().map(Into::into).collect()),
            document: StoredDocument::default(),
        }
    }

    /// Take the collected document.
    pub fn into_document(self) -> StoredDocument {
        self.document
    }
}

impl StoredFieldVisitor for DocumentStoredFieldVisitor {
    fn needs_field(&mut self, field: &FieldInfo) -> VisitStatus {
        match &self.fields_to_load {
            Some(names) if !names.contains(&field.name) => VisitStatus::No,
            _ => VisitStatus::Yes,
        }
    }

    fn visit(&mut self, field: &FieldInfo, value: StoredValue) -> Result<()> {
        self.document.fields.push((field.name.clone(), value));
        Ok(())
    }
}

/// Writes stored fields for one segment.
///
/// Call [`start_document`](Self::start_document) for every document (even
/// with zero stored fields), then exactly that many
/// [`write_field`](Self::write_field) calls, and finally
/// [`finish`](Self::finish) once. On failure call [`abort`](Self::abort).
pub trait StoredFieldsWriter: Send {
    /// Begin a new document with `num_stored_fields` values.
    fn start_document(&mut self, num_stored_fields: usize) -> Result<()>;

    /// Write one value of the current document.
    fn write_field(&mut self, field: &FieldInfo, value: &StoredValue) -> Result<()>;

    /// Complete the segment. `num_docs` must equal the number of documents
    /// started.
    fn finish(&mut self, field_infos: &FieldInfos, num_docs: u32) -> Result<()>;

    /// Discard everything written and remove the files.
    fn abort(&mut self);

    /// Copy every live document of the merge inputs, renumbered densely.
    ///
    /// Returns the number of documents written.
    fn merge(&mut self, state: &MergeState, cursor: &mut MergeCursor) -> Result<u32> {
        let mut doc_count = 0u32;

        for (reader_index, reader) in state.readers.iter().enumerate() {
            let doc_map = &state.doc_maps[reader_index];
            let mut fields_reader = reader.stored_fields_reader()?;

            for doc in 0..reader.max_doc() {
                if doc_map.get(doc).is_none() {
                    continue;
                }

                let mut visitor = DocumentStoredFieldVisitor::new();
                fields_reader.visit_document(doc, &mut visitor)?;
                let document = visitor.into_document();

                self.start_document(document.len())?;
                for (name, value) in &document.fields {
                    let field = state.field_infos.field_info(name).ok_or_else(|| {
                        QuiverError::invalid_operation(format!(
                            "stored field {name} missing from merged field infos"
                        ))
                    })?;
                    self.write_field(field, value)?;
                }

                doc_count += 1;
                cursor.check_abort.work(MERGE_DOC_WORK_UNITS)?;
            }
        }

        self.finish(&state.field_infos, doc_count)?;
        Ok(doc_count)
    }
}

/// Random access to the stored fields of one segment.
pub trait StoredFieldsReader: Send {
    /// Push the stored values of `doc` to `visitor`.
    fn visit_document(&mut self, doc: u32, visitor: &mut dyn StoredFieldVisitor) -> Result<()>;

    /// Number of documents in the segment.
    fn num_docs(&self) -> u32;

    /// An independent cursor over the same files.
    fn clone_reader(&self) -> Result<Box<dyn StoredFieldsReader>>;

    /// Verify the checksums of the underlying files.
    fn check_integrity(&mut self) -> Result<()>;
}

/// Creates stored field readers and writers.
pub trait StoredFieldsFormat: Send + Sync {
    fn fields_reader(
        &self,
        storage: &dyn Storage,
        segment: &str,
        field_infos: Arc<FieldInfos>,
        num_docs: u32,
        context: IoContext,
    ) -> Result<Box<dyn StoredFieldsReader>>;

    fn fields_writer(
        &self,
        storage: Arc<dyn Storage>,
        segment: &str,
        context: IoContext,
    ) -> Result<Box<dyn StoredFieldsWriter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_visitor_subset() {
        let title = FieldInfo::new("title", 0, None);
        let body = FieldInfo::new("body", 1, None);

        let mut visitor = DocumentStoredFieldVisitor::with_fields(["title"]);
        assert_eq!(visitor.needs_field(&title), VisitStatus::Yes);
        assert_eq!(visitor.needs_field(&body), VisitStatus::No);

        visitor.visit(&title, "hello".into()).unwrap();
        let document = visitor.into_document();
        assert_eq!(document.get("title").unwrap().as_text(), Some("hello"));
        assert!(document.get("body").is_none());
    }

    #[test]
    fn test_stored_document_multi_valued() {
        let document = StoredDocument {
            fields: vec![
                ("tag".to_string(), StoredValue::from("a")),
                ("id".to_string(), StoredValue::from(7i64)),
                ("tag".to_string(), StoredValue::from("b")),
            ],
        };
        let tags: Vec<&str> = document.get_all("tag").filter_map(|v| v.as_text()).collect();
        assert_eq!(tags, vec!["a", "b"]);
        assert_eq!(document.get("id"), Some(&StoredValue::Long(7)));
    }
}
