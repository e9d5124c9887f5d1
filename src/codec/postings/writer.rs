//! Streaming writer of the standard postings format.
//!
//! Documents and positions go straight to `.frq` / `.prx` as they arrive;
//! term records go to `.tim` when a term finishes. The sparse term index
//! (`.tip`) and the field directory are kept in memory until `close`.

use std::sync::Arc;

use crate::codec::codec_util;
use crate::codec::field_infos::{FieldInfo, IndexOptions};
use crate::codec::postings::{
    FieldsConsumer, PostingsConsumer, SegmentWriteState, TermStats, TermsConsumer,
};
use crate::error::{QuiverError, Result};
use crate::index::file_names::{
    self, FREQ_EXTENSION, PROX_EXTENSION, TERMS_EXTENSION, TERMS_INDEX_EXTENSION,
};
use crate::storage::structured::StructWriter;
use crate::storage::{IoContext, Storage, StorageOutput};

pub(crate) const TERMS_CODEC: &str = "Quiver10PostingsTerms";
pub(crate) const TERMS_INDEX_CODEC: &str = "Quiver10PostingsTermsIndex";
pub(crate) const FREQ_CODEC: &str = "Quiver10PostingsFreq";
pub(crate) const PROX_CODEC: &str = "Quiver10PostingsProx";
pub(crate) const VERSION_START: u32 = 0;
pub(crate) const VERSION_CURRENT: u32 = 0;

type Output = StructWriter<Box<dyn StorageOutput>>;

struct Outputs {
    terms: Output,
    freq: Output,
    prox: Option<Output>,
}

/// Directory entry of a completed field.
struct FieldSummary {
    number: u32,
    num_terms: u64,
    sum_total_term_freq: i64,
    sum_doc_freq: i64,
    doc_count: u32,
    start: u64,
    /// Every `interval`-th term with its `.tim` offset.
    index: Vec<(Vec<u8>, u64)>,
}

struct FieldState {
    info: FieldInfo,
    options: IndexOptions,
    summary: FieldSummary,
    /// Last finished term, for ordering checks.
    previous: Option<Vec<u8>>,
    /// Delta bases of the `.tim` records, reset at every index boundary.
    last_term: Vec<u8>,
    last_freq_pointer: u64,
    last_prox_pointer: u64,
}

#[derive(Default)]
struct TermState {
    term: Vec<u8>,
    freq_start: u64,
    prox_start: u64,
    doc_freq: u32,
    total_term_freq: i64,
    last_doc: u32,
    in_doc: bool,
    positions_left: u32,
    last_position: i32,
    last_start_offset: i32,
    last_payload_len: usize,
}

/// Writes `.tim` / `.tip` / `.frq` / `.prx`.
pub struct Quiver10FieldsWriter {
    storage: Arc<dyn Storage>,
    segment: String,
    context: IoContext,
    file_names: Vec<String>,
    terms: TermsWriter,
}

/// The per-field part of the writer, handed out by `add_field`.
struct TermsWriter {
    outputs: Option<Outputs>,
    interval: usize,
    max_doc: u32,
    last_field: Option<u32>,
    completed: Vec<FieldSummary>,
    field: Option<FieldState>,
    term: Option<TermState>,
}

impl Quiver10FieldsWriter {
    /// Create `.tim`, `.frq` and, when any field has positions, `.prx`.
    pub fn new(
        storage: Arc<dyn Storage>,
        state: &SegmentWriteState,
        term_index_interval: usize,
    ) -> Result<Self> {
        let segment = state.segment.clone();
        let mut file_names = vec![
            file_names::segment_file_name(&segment, TERMS_EXTENSION),
            file_names::segment_file_name(&segment, FREQ_EXTENSION),
            file_names::segment_file_name(&segment, TERMS_INDEX_EXTENSION),
        ];
        let has_prox = state.field_infos.has_prox();
        if has_prox {
            file_names.push(file_names::segment_file_name(&segment, PROX_EXTENSION));
        }

        let mut writer = Quiver10FieldsWriter {
            storage,
            segment,
            context: state.context,
            file_names,
            terms: TermsWriter {
                outputs: None,
                interval: term_index_interval.max(1),
                max_doc: state.doc_count,
                last_field: None,
                completed: Vec::new(),
                field: None,
                term: None,
            },
        };

        let result = (|| {
            let storage = writer.storage.as_ref();
            let terms = codec_util::create_output(
                storage,
                &writer.file_names[0],
                TERMS_CODEC,
                VERSION_CURRENT,
                state.context,
            )?;
            let freq = codec_util::create_output(
                storage,
                &writer.file_names[1],
                FREQ_CODEC,
                VERSION_CURRENT,
                state.context,
            )?;
            let prox = if has_prox {
                Some(codec_util::create_output(
                    storage,
                    &writer.file_names[3],
                    PROX_CODEC,
                    VERSION_CURRENT,
                    state.context,
                )?)
            } else {
                None
            };
            Ok::<_, QuiverError>(Outputs { terms, freq, prox })
        })();

        match result {
            Ok(outputs) => {
                writer.terms.outputs = Some(outputs);
                Ok(writer)
            }
            Err(e) => {
                writer.abort();
                Err(e)
            }
        }
    }

    fn write_terms_index(&self) -> Result<()> {
        let mut output = codec_util::create_output(
            self.storage.as_ref(),
            &self.file_names[2],
            TERMS_INDEX_CODEC,
            VERSION_CURRENT,
            self.context,
        )?;
        output.write_varint(self.terms.interval as u64)?;
        output.write_varint(self.terms.completed.len() as u64)?;
        for field in &self.terms.completed {
            output.write_varint(field.number as u64)?;
            output.write_varint(field.index.len() as u64)?;
            for (term, pointer) in &field.index {
                output.write_bytes(term)?;
                output.write_varint(*pointer)?;
            }
        }
        codec_util::finish_output(output)
    }
}

impl FieldsConsumer for Quiver10FieldsWriter {
    fn add_field(&mut self, field: &FieldInfo) -> Result<&mut dyn TermsConsumer> {
        let terms = &mut self.terms;
        if let Some(open) = &terms.field {
            return Err(QuiverError::invalid_operation(format!(
                "field {} added before field {} was finished",
                field.name, open.info.name
            )));
        }
        if let Some(last) = terms.last_field
            && field.number <= last
        {
            return Err(QuiverError::invalid_operation(format!(
                "field {} (number {}) added after field number {last}",
                field.name, field.number
            )));
        }
        let options = field.index_options.ok_or_else(|| {
            QuiverError::invalid_argument(format!("field {} is not indexed", field.name))
        })?;

        let outputs = terms.outputs()?;
        if options.has_positions() && outputs.prox.is_none() {
            return Err(QuiverError::invalid_operation(format!(
                "field {} has positions but segment {} was opened without a prox file",
                field.name, self.segment
            )));
        }
        let start = outputs.terms.position();

        terms.last_field = Some(field.number);
        terms.field = Some(FieldState {
            info: field.clone(),
            options,
            summary: FieldSummary {
                number: field.number,
                num_terms: 0,
                sum_total_term_freq: 0,
                sum_doc_freq: 0,
                doc_count: 0,
                start,
                index: Vec::new(),
            },
            previous: None,
            last_term: Vec::new(),
            last_freq_pointer: 0,
            last_prox_pointer: 0,
        });
        Ok(terms)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(field) = &self.terms.field {
            return Err(QuiverError::invalid_operation(format!(
                "postings closed while field {} is open",
                field.info.name
            )));
        }

        let Some(mut outputs) = self.terms.outputs.take() else {
            return Err(QuiverError::invalid_operation(
                "postings writer is already closed or aborted",
            ));
        };

        let directory_offset = outputs.terms.position();
        outputs
            .terms
            .write_varint(self.terms.completed.len() as u64)?;
        for field in &self.terms.completed {
            outputs.terms.write_varint(field.number as u64)?;
            outputs.terms.write_varint(field.num_terms)?;
            outputs.terms.write_zigzag(field.sum_total_term_freq)?;
            outputs.terms.write_varint(field.sum_doc_freq as u64)?;
            outputs.terms.write_varint(field.doc_count as u64)?;
            outputs.terms.write_varint(field.start)?;
        }
        outputs.terms.write_u64(directory_offset)?;

        codec_util::finish_output(outputs.terms)?;
        codec_util::finish_output(outputs.freq)?;
        if let Some(prox) = outputs.prox {
            codec_util::finish_output(prox)?;
        }
        self.write_terms_index()?;

        log::debug!(
            "Wrote postings for {} fields of segment {}",
            self.terms.completed.len(),
            self.segment
        );
        Ok(())
    }

    fn abort(&mut self) {
        self.terms.outputs = None;
        self.terms.field = None;
        self.terms.term = None;
        for name in &self.file_names {
            if let Err(e) = self.storage.delete_file(name) {
                log::warn!("Failed to delete {name} while aborting postings: {e}");
            }
        }
    }
}

impl TermsWriter {
    fn outputs(&mut self) -> Result<&mut Outputs> {
        self.outputs.as_mut().ok_or_else(|| {
            QuiverError::invalid_operation("postings writer is already closed or aborted")
        })
    }

    fn field(&self) -> Result<&FieldState> {
        self.field
            .as_ref()
            .ok_or_else(|| QuiverError::invalid_operation("no field is open"))
    }

    fn open_term(&mut self) -> Result<&mut TermState> {
        self.term
            .as_mut()
            .ok_or_else(|| QuiverError::invalid_operation("no term is open"))
    }

    /// Error if a term received documents but was never finished.
    fn check_no_pending_docs(&self) -> Result<()> {
        if let Some(term) = &self.term
            && term.doc_freq > 0
        {
            return Err(QuiverError::invalid_operation(format!(
                "term {} has {} documents but was not finished",
                String::from_utf8_lossy(&term.term),
                term.doc_freq
            )));
        }
        Ok(())
    }
}

impl TermsConsumer for TermsWriter {
    fn start_term(&mut self, term: &[u8]) -> Result<&mut dyn PostingsConsumer> {
        self.check_no_pending_docs()?;
        if let Some(previous) = &self.field()?.previous
            && term <= previous.as_slice()
        {
            return Err(QuiverError::invalid_operation(format!(
                "term {} is not after {}",
                String::from_utf8_lossy(term),
                String::from_utf8_lossy(previous)
            )));
        }

        let outputs = self.outputs()?;
        let freq_start = outputs.freq.position();
        let prox_start = outputs.prox.as_ref().map_or(0, |p| p.position());
        self.term = Some(TermState {
            term: term.to_vec(),
            freq_start,
            prox_start,
            ..TermState::default()
        });
        Ok(self)
    }

    fn finish_term(&mut self, term: &[u8], stats: TermStats) -> Result<()> {
        let current = self
            .term
            .take()
            .ok_or_else(|| QuiverError::invalid_operation("finish_term without start_term"))?;
        if current.term != term {
            return Err(QuiverError::invalid_operation(format!(
                "finish_term for {} but {} is open",
                String::from_utf8_lossy(term),
                String::from_utf8_lossy(&current.term)
            )));
        }
        if current.in_doc {
            return Err(QuiverError::invalid_operation("finish_term inside a document"));
        }
        if stats.doc_freq == 0 || stats.doc_freq != current.doc_freq {
            return Err(QuiverError::invalid_operation(format!(
                "term {} finished with doc_freq {} but {} documents were written",
                String::from_utf8_lossy(term),
                stats.doc_freq,
                current.doc_freq
            )));
        }

        let interval = self.interval as u64;
        let Some(mut field) = self.field.take() else {
            return Err(QuiverError::invalid_operation("no field is open"));
        };
        let has_freqs = field.options.has_freqs();
        let has_positions = field.options.has_positions();
        let expected_ttf = if has_freqs {
            current.total_term_freq
        } else {
            -1
        };
        if stats.total_term_freq != expected_ttf {
            self.field = Some(field);
            return Err(QuiverError::invalid_operation(format!(
                "term {} finished with total_term_freq {} but {expected_ttf} was written",
                String::from_utf8_lossy(term),
                stats.total_term_freq
            )));
        }

        let result = (|| {
            let out = &mut self.outputs()?.terms;
            if field.summary.num_terms % interval == 0 {
                field.summary.index.push((term.to_vec(), out.position()));
                field.last_term.clear();
                field.last_freq_pointer = 0;
                field.last_prox_pointer = 0;
            }

            let shared = field
                .last_term
                .iter()
                .zip(term)
                .take_while(|(a, b)| a == b)
                .count();
            out.write_varint(shared as u64)?;
            out.write_varint((term.len() - shared) as u64)?;
            out.write_raw(&term[shared..])?;
            out.write_varint(stats.doc_freq as u64)?;
            if has_freqs {
                out.write_varint((stats.total_term_freq - stats.doc_freq as i64) as u64)?;
            }
            out.write_varint(current.freq_start - field.last_freq_pointer)?;
            if has_positions {
                out.write_varint(current.prox_start - field.last_prox_pointer)?;
            }
            Ok::<_, QuiverError>(())
        })();

        if result.is_ok() {
            field.last_term = term.to_vec();
            field.last_freq_pointer = current.freq_start;
            field.last_prox_pointer = current.prox_start;
            field.previous = Some(term.to_vec());
            field.summary.num_terms += 1;
            field.summary.sum_doc_freq += stats.doc_freq as i64;
            if has_freqs {
                field.summary.sum_total_term_freq += stats.total_term_freq;
            }
        }
        self.field = Some(field);
        result
    }

    fn finish(
        &mut self,
        sum_total_term_freq: i64,
        sum_doc_freq: i64,
        doc_count: u32,
    ) -> Result<()> {
        self.check_no_pending_docs()?;
        self.term = None;

        let field = self.field()?;
        let expected_sum_ttf = if field.options.has_freqs() {
            field.summary.sum_total_term_freq
        } else {
            -1
        };
        if sum_total_term_freq != expected_sum_ttf || sum_doc_freq != field.summary.sum_doc_freq {
            return Err(QuiverError::invalid_operation(format!(
                "field {} finished with sums ({sum_total_term_freq}, {sum_doc_freq}) \
                 but ({expected_sum_ttf}, {}) were written",
                field.info.name, field.summary.sum_doc_freq
            )));
        }
        if doc_count > self.max_doc || doc_count as i64 > sum_doc_freq {
            return Err(QuiverError::invalid_operation(format!(
                "field {} finished with doc_count {doc_count} beyond its postings",
                field.info.name
            )));
        }

        if let Some(mut field) = self.field.take()
            && field.summary.num_terms > 0
        {
            field.summary.sum_total_term_freq = expected_sum_ttf;
            field.summary.doc_count = doc_count;
            self.completed.push(field.summary);
        }
        Ok(())
    }
}

impl PostingsConsumer for TermsWriter {
    fn start_doc(&mut self, doc: u32, freq: i32) -> Result<()> {
        let options = self.field()?.options;
        let max_doc = self.max_doc;
        let term = self.open_term()?;

        if term.in_doc {
            return Err(QuiverError::invalid_operation(format!(
                "doc {doc} started before doc {} was finished",
                term.last_doc
            )));
        }
        if doc >= max_doc {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc} out of range [0, {max_doc})"
            )));
        }
        if term.doc_freq > 0 && doc <= term.last_doc {
            return Err(QuiverError::invalid_operation(format!(
                "doc {doc} is not after doc {}",
                term.last_doc
            )));
        }
        let has_freqs = options.has_freqs();
        if has_freqs && freq < 1 {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc}: frequency {freq} must be positive"
            )));
        }
        if !has_freqs && freq != -1 {
            return Err(QuiverError::invalid_argument(format!(
                "doc {doc}: frequency must be -1 for a field without frequencies, got {freq}"
            )));
        }

        let delta = doc - if term.doc_freq > 0 { term.last_doc } else { 0 };
        term.last_doc = doc;
        term.doc_freq += 1;
        term.in_doc = true;
        term.last_position = 0;
        term.last_start_offset = 0;
        if has_freqs {
            term.total_term_freq += freq as i64;
        }
        if options.has_positions() {
            term.positions_left = freq as u32;
        }

        let out = &mut self.outputs()?.freq;
        if has_freqs {
            if freq == 1 {
                out.write_varint(((delta as u64) << 1) | 1)?;
            } else {
                out.write_varint((delta as u64) << 1)?;
                out.write_varint(freq as u64)?;
            }
        } else {
            out.write_varint(delta as u64)?;
        }
        Ok(())
    }

    fn add_position(
        &mut self,
        position: i32,
        payload: Option<&[u8]>,
        start_offset: i32,
        end_offset: i32,
    ) -> Result<()> {
        let field = self.field()?;
        let options = field.options;
        let store_payloads = field.info.has_payloads();
        if !options.has_positions() {
            return Err(QuiverError::invalid_operation(format!(
                "field {} does not index positions",
                field.info.name
            )));
        }
        if !store_payloads && payload.is_some_and(|p| !p.is_empty()) {
            return Err(QuiverError::invalid_argument(format!(
                "field {} does not store payloads",
                field.info.name
            )));
        }

        let term = self.open_term()?;
        if !term.in_doc || term.positions_left == 0 {
            return Err(QuiverError::invalid_operation(
                "position added beyond the document frequency",
            ));
        }
        if position < term.last_position {
            return Err(QuiverError::invalid_argument(format!(
                "position {position} is before {}",
                term.last_position
            )));
        }
        if options.has_offsets() && (start_offset < 0 || end_offset < start_offset) {
            return Err(QuiverError::invalid_argument(format!(
                "invalid offsets [{start_offset}, {end_offset})"
            )));
        }

        let position_delta = (position - term.last_position) as u64;
        let offset_delta = start_offset as i64 - term.last_start_offset as i64;
        let payload = payload.unwrap_or_default();
        let payload_changed = payload.len() != term.last_payload_len;

        term.last_position = position;
        term.positions_left -= 1;
        if options.has_offsets() {
            term.last_start_offset = start_offset;
        }
        if store_payloads {
            term.last_payload_len = payload.len();
        }

        let out = self
            .outputs()?
            .prox
            .as_mut()
            .ok_or_else(|| QuiverError::invalid_operation("segment has no prox file"))?;
        if store_payloads {
            if payload_changed {
                out.write_varint((position_delta << 1) | 1)?;
                out.write_varint(payload.len() as u64)?;
            } else {
                out.write_varint(position_delta << 1)?;
            }
            out.write_raw(payload)?;
        } else {
            out.write_varint(position_delta)?;
        }
        if options.has_offsets() {
            out.write_zigzag(offset_delta)?;
            out.write_varint((end_offset - start_offset) as u64)?;
        }
        Ok(())
    }

    fn finish_doc(&mut self) -> Result<()> {
        let term = self.open_term()?;
        if !term.in_doc {
            return Err(QuiverError::invalid_operation("finish_doc without start_doc"));
        }
        if term.positions_left != 0 {
            return Err(QuiverError::invalid_operation(format!(
                "doc {} is missing {} positions",
                term.last_doc, term.positions_left
            )));
        }
        term.in_doc = false;
        Ok(())
    }
}
