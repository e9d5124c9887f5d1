//! Pre-analyzed documents as handed to the segment writer.
//!
//! Analysis happens upstream: a field arrives with its tokens already cut,
//! positioned and, where wanted, carrying offsets and payloads.
//!
//! # Example
//!
//! ```
//! use quiver::index::document::{AnalyzedDocument, AnalyzedField, FieldType};
//!
//! let doc = AnalyzedDocument::new()
//!     .with_field(AnalyzedField::text("body", "the quick fox", FieldType::text()))
//!     .with_field(AnalyzedField::stored("id", "doc-1"));
//!
//! assert_eq!(doc.fields.len(), 2);
//! assert_eq!(doc.fields[0].tokens.len(), 3);
//! assert_eq!(doc.fields[0].tokens[2].start_offset, 10);
//! ```

use crate::codec::field_infos::IndexOptions;
use crate::codec::stored_fields::StoredValue;

/// How a field is indexed and stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldType {
    /// Postings detail; `None` leaves the field out of the inverted index.
    pub index_options: Option<IndexOptions>,
    pub store_term_vectors: bool,
    pub store_term_vector_positions: bool,
    pub store_term_vector_offsets: bool,
    /// Keep token payloads in the postings. Requires positions.
    pub store_payloads: bool,
}

impl FieldType {
    /// Tokenized text with frequencies and positions.
    pub fn text() -> Self {
        FieldType {
            index_options: Some(IndexOptions::DocsAndFreqsAndPositions),
            store_term_vectors: false,
            store_term_vector_positions: false,
            store_term_vector_offsets: false,
            store_payloads: false,
        }
    }

    /// A single untokenized value indexed for exact match only.
    pub fn string() -> Self {
        FieldType {
            index_options: Some(IndexOptions::DocsOnly),
            ..Self::text()
        }
    }

    /// Not indexed at all; useful for stored-only values.
    pub fn stored_only() -> Self {
        FieldType {
            index_options: None,
            ..Self::text()
        }
    }

    pub fn with_index_options(mut self, index_options: IndexOptions) -> Self {
        self.index_options = Some(index_options);
        self
    }

    /// Store term vectors with the given parts.
    pub fn with_term_vectors(mut self, positions: bool, offsets: bool) -> Self {
        self.store_term_vectors = true;
        self.store_term_vector_positions = positions;
        self.store_term_vector_offsets = offsets;
        self
    }

    pub fn with_payloads(mut self) -> Self {
        self.store_payloads = true;
        self
    }
}

/// One token of an analyzed field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzedTerm {
    pub term: Vec<u8>,
    pub position: i32,
    pub start_offset: i32,
    pub end_offset: i32,
    pub payload: Option<Vec<u8>>,
}

impl AnalyzedTerm {
    pub fn new(term: impl Into<Vec<u8>>, position: i32) -> Self {
        AnalyzedTerm {
            term: term.into(),
            position,
            start_offset: -1,
            end_offset: -1,
            payload: None,
        }
    }

    pub fn with_offsets(mut self, start_offset: i32, end_offset: i32) -> Self {
        self.start_offset = start_offset;
        self.end_offset = end_offset;
        self
    }

    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A field of an analyzed document: its tokens, its stored value, or both.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedField {
    pub name: String,
    pub field_type: FieldType,
    pub stored: Option<StoredValue>,
    pub tokens: Vec<AnalyzedTerm>,
}

impl AnalyzedField {
    /// An indexed field with explicit tokens.
    pub fn indexed(
        name: impl Into<String>,
        field_type: FieldType,
        tokens: Vec<AnalyzedTerm>,
    ) -> Self {
        AnalyzedField {
            name: name.into(),
            field_type,
            stored: None,
            tokens,
        }
    }

    /// A field whose tokens are the whitespace-separated words of `text`,
    /// with byte offsets.
    pub fn text(name: impl Into<String>, text: &str, field_type: FieldType) -> Self {
        let mut tokens = Vec::new();
        let mut start = None;
        for (i, c) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
            match (c.is_whitespace(), start) {
                (false, None) => start = Some(i),
                (true, Some(s)) => {
                    let position = tokens.len() as i32;
                    tokens.push(
                        AnalyzedTerm::new(&text[s..i], position).with_offsets(s as i32, i as i32),
                    );
                    start = None;
                }
                _ => {}
            }
        }
        Self::indexed(name, field_type, tokens)
    }

    /// A single-token field holding `value` verbatim, also stored.
    pub fn keyword(name: impl Into<String>, value: &str) -> Self {
        let token = AnalyzedTerm::new(value, 0).with_offsets(0, value.len() as i32);
        Self::indexed(name, FieldType::string(), vec![token]).with_stored(value)
    }

    /// A stored-only field.
    pub fn stored(name: impl Into<String>, value: impl Into<StoredValue>) -> Self {
        Self::indexed(name, FieldType::stored_only(), Vec::new()).with_stored(value)
    }

    pub fn with_stored(mut self, value: impl Into<StoredValue>) -> Self {
        self.stored = Some(value.into());
        self
    }
}

/// A document ready for [`SegmentWriter::add_document`](crate::index::segment_writer::SegmentWriter::add_document).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzedDocument {
    pub fields: Vec<AnalyzedField>,
}

impl AnalyzedDocument {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_field(&mut self, field: AnalyzedField) {
        self.fields.push(field);
    }

    pub fn with_field(mut self, field: AnalyzedField) -> Self {
        self.add_field(field);
        self
    }
}
