//! The inverted index: per field, a sorted term dictionary, and per term the
//! documents containing it with frequencies, positions, offsets and payloads.
//!
//! Writing goes through a three-level consumer chain:
//!
//! ```text
//! FieldsConsumer::add_field
//!   TermsConsumer::start_term
//!     PostingsConsumer::start_doc / add_position / finish_doc
//!   TermsConsumer::finish_term
//! TermsConsumer::finish
//! FieldsConsumer::close
//! ```
//!
//! Reading goes through [`FieldsProducer`] → [`Terms`] → [`TermsEnum`] →
//! [`PostingsEnum`].

pub mod merge;
pub mod reader;
pub mod writer;

use std::sync::Arc;

use crate::codec::field_infos::{FieldInfo, FieldInfos};
use crate::error::Result;
use crate::index::merge_state::{MergeCursor, MergeState};
use crate::storage::{IoContext, Storage};

/// Returned by [`PostingsEnum::next_doc`] once the postings are exhausted.
pub const NO_MORE_DOCS: u32 = u32::MAX;

/// Statistics of one term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TermStats {
    /// Number of documents containing the term.
    pub doc_freq: u32,
    /// Sum of the term's frequency over those documents, or `-1` when the
    /// field does not index frequencies.
    pub total_term_freq: i64,
}

/// Outcome of [`TermsEnum::seek_ceil`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    /// The exact term was found.
    Found,
    /// Positioned on the smallest term greater than the target.
    NotFound,
    /// Every term is smaller than the target.
    End,
}

/// What a postings writer needs to know about the segment being written.
#[derive(Debug, Clone)]
pub struct SegmentWriteState {
    pub segment: String,
    pub field_infos: Arc<FieldInfos>,
    pub doc_count: u32,
    pub context: IoContext,
}

/// What a postings reader needs to know about the segment being read.
#[derive(Debug, Clone)]
pub struct SegmentReadState {
    pub segment: String,
    pub field_infos: Arc<FieldInfos>,
    pub context: IoContext,
}

/// Receives the postings of one segment, field by field.
///
/// Fields must be added in ascending field number order.
pub trait FieldsConsumer: Send {
    /// Begin a field and return the consumer for its terms.
    fn add_field(&mut self, field: &FieldInfo) -> Result<&mut dyn TermsConsumer>;

    /// Write the term index and the field directory, then close every file.
    fn close(&mut self) -> Result<()>;

    /// Discard everything written and remove the files.
    fn abort(&mut self);

    /// Merge the postings of every input segment.
    fn merge(&mut self, state: &MergeState, cursor: &mut MergeCursor) -> Result<()> {
        merge::merge_fields(self, state, cursor)
    }
}

/// Receives the terms of one field in byte order.
pub trait TermsConsumer {
    /// Begin a term and return the consumer for its documents.
    fn start_term(&mut self, term: &[u8]) -> Result<&mut dyn PostingsConsumer>;

    /// Complete a term that received at least one document.
    fn finish_term(&mut self, term: &[u8], stats: TermStats) -> Result<()>;

    /// Complete the field. `sum_total_term_freq` is `-1` when the field does
    /// not index frequencies.
    fn finish(&mut self, sum_total_term_freq: i64, sum_doc_freq: i64, doc_count: u32)
    -> Result<()>;
}

/// Receives the documents of one term in ascending order.
pub trait PostingsConsumer {
    /// Begin a document. `freq` is `-1` when the field does not index
    /// frequencies.
    fn start_doc(&mut self, doc: u32, freq: i32) -> Result<()>;

    /// Add one position. Offsets are `-1` when not indexed.
    fn add_position(
        &mut self,
        position: i32,
        payload: Option<&[u8]>,
        start_offset: i32,
        end_offset: i32,
    ) -> Result<()>;

    /// Complete the document.
    fn finish_doc(&mut self) -> Result<()>;
}

/// Read access to the postings of one segment.
pub trait FieldsProducer: Send + Sync {
    /// Names of the fields that have at least one term, in field number
    /// order.
    fn fields(&self) -> Vec<String>;

    /// The terms of `field`, or `None` if it has none.
    fn terms(&self, field: &str) -> Result<Option<Box<dyn Terms + '_>>>;

    /// Verify the checksums of the underlying files.
    fn check_integrity(&self) -> Result<()>;
}

/// The term dictionary of one field.
pub trait Terms {
    /// Number of distinct terms.
    fn size(&self) -> u64;

    /// `-1` when the field does not index frequencies.
    fn sum_total_term_freq(&self) -> i64;

    fn sum_doc_freq(&self) -> i64;

    /// Number of documents with at least one term in this field.
    fn doc_count(&self) -> u32;

    fn has_freqs(&self) -> bool;
    fn has_positions(&self) -> bool;
    fn has_offsets(&self) -> bool;
    fn has_payloads(&self) -> bool;

    /// A fresh, unpositioned cursor over the terms.
    fn iterator(&self) -> Result<Box<dyn TermsEnum>>;
}

/// Cursor over a term dictionary.
///
/// `term`, `ord`, `doc_freq`, `total_term_freq` and `postings` are only
/// meaningful while positioned on a term.
pub trait TermsEnum: Send {
    /// Move to the next term.
    fn next(&mut self) -> Result<Option<&[u8]>>;

    /// Position on the smallest term greater than or equal to `target`.
    fn seek_ceil(&mut self, target: &[u8]) -> Result<SeekStatus>;

    /// Position on `target` if it exists.
    fn seek_exact(&mut self, target: &[u8]) -> Result<bool> {
        Ok(self.seek_ceil(target)? == SeekStatus::Found)
    }

    /// Position on the term with ordinal `ord`.
    fn seek_ord(&mut self, ord: u64) -> Result<()>;

    fn ord(&self) -> u64;
    fn term(&self) -> &[u8];
    fn doc_freq(&self) -> u32;

    /// `-1` when the field does not index frequencies.
    fn total_term_freq(&self) -> i64;

    /// The postings of the current term.
    fn postings(&mut self) -> Result<Box<dyn PostingsEnum + '_>>;
}

/// Cursor over the documents of one term.
pub trait PostingsEnum {
    /// Move to the next document, returning [`NO_MORE_DOCS`] at the end.
    fn next_doc(&mut self) -> Result<u32>;

    /// Move to the first document greater than or equal to `target`.
    fn advance(&mut self, target: u32) -> Result<u32> {
        loop {
            let doc = self.next_doc()?;
            if doc >= target {
                return Ok(doc);
            }
        }
    }

    fn doc(&self) -> u32;

    /// Term frequency in the current document; `1` when frequencies are
    /// not indexed.
    fn freq(&self) -> u32;

    /// Next position of the current document. At most `freq` calls.
    fn next_position(&mut self) -> Result<i32>;

    /// Offsets of the last position, `-1` when not indexed.
    fn start_offset(&self) -> i32;
    fn end_offset(&self) -> i32;

    /// Payload of the last position.
    fn payload(&self) -> Option<&[u8]>;
}

/// Creates postings consumers and producers.
pub trait PostingsFormat: Send + Sync {
    fn fields_consumer(
        &self,
        storage: Arc<dyn Storage>,
        state: &SegmentWriteState,
    ) -> Result<Box<dyn FieldsConsumer>>;

    fn fields_producer(
        &self,
        storage: &dyn Storage,
        state: &SegmentReadState,
    ) -> Result<Box<dyn FieldsProducer>>;
}

/// The standard postings format: `.tim` / `.tip` / `.frq` / `.prx`.
#[derive(Debug, Clone)]
pub struct Quiver10PostingsFormat {
    term_index_interval: usize,
}

impl Quiver10PostingsFormat {
    pub fn new(term_index_interval: usize) -> Self {
        Quiver10PostingsFormat {
            term_index_interval: term_index_interval.max(1),
        }
    }

    pub fn term_index_interval(&self) -> usize {
        self.term_index_interval
    }
}

impl PostingsFormat for Quiver10PostingsFormat {
    fn fields_consumer(
        &self,
        storage: Arc<dyn Storage>,
        state: &SegmentWriteState,
    ) -> Result<Box<dyn FieldsConsumer>> {
        Ok(Box::new(writer::Quiver10FieldsWriter::new(
            storage,
            state,
            self.term_index_interval,
        )?))
    }

    fn fields_producer(
        &self,
        storage: &dyn Storage,
        state: &SegmentReadState,
    ) -> Result<Box<dyn FieldsProducer>> {
        Ok(Box::new(reader::Quiver10FieldsReader::open(storage, state)?))
    }
}
