//! Reader of the standard postings format.
//!
//! The term index and field directory are loaded at open; term records and
//! postings are decoded on demand through cloned file handles.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::codec::codec_util;
use crate::codec::field_infos::FieldInfo;
use crate::codec::postings::writer::{
    FREQ_CODEC, PROX_CODEC, TERMS_CODEC, TERMS_INDEX_CODEC, VERSION_CURRENT, VERSION_START,
};
use crate::codec::postings::{
    FieldsProducer, NO_MORE_DOCS, PostingsEnum, SeekStatus, SegmentReadState, Terms, TermsEnum,
};
use crate::error::{QuiverError, Result};
use crate::index::file_names::{
    self, FREQ_EXTENSION, PROX_EXTENSION, TERMS_EXTENSION, TERMS_INDEX_EXTENSION,
};
use crate::storage::structured::StructReader;
use crate::storage::{Storage, StorageInput};

type Input = StructReader<Box<dyn StorageInput>>;

/// Directory entry and term index of one field.
#[derive(Debug)]
struct FieldMeta {
    info: FieldInfo,
    num_terms: u64,
    sum_total_term_freq: i64,
    sum_doc_freq: i64,
    doc_count: u32,
    index: Vec<(Vec<u8>, u64)>,
}

/// Reads `.tim` / `.tip` / `.frq` / `.prx`.
pub struct Quiver10FieldsReader {
    terms_name: String,
    freq_name: String,
    prox_name: Option<String>,
    terms_in: Mutex<Input>,
    freq_in: Mutex<Input>,
    prox_in: Option<Mutex<Input>>,
    interval: u64,
    fields: BTreeMap<u32, Arc<FieldMeta>>,
    by_name: AHashMap<String, u32>,
}

impl Quiver10FieldsReader {
    /// Open the postings files of a segment and load its term index.
    pub fn open(storage: &dyn Storage, state: &SegmentReadState) -> Result<Self> {
        let segment = &state.segment;
        let terms_name = file_names::segment_file_name(segment, TERMS_EXTENSION);
        let index_name = file_names::segment_file_name(segment, TERMS_INDEX_EXTENSION);
        let freq_name = file_names::segment_file_name(segment, FREQ_EXTENSION);
        let prox_name = state
            .field_infos
            .has_prox()
            .then(|| file_names::segment_file_name(segment, PROX_EXTENSION));

        let mut terms_in = codec_util::open_checked_input(
            storage,
            &terms_name,
            TERMS_CODEC,
            VERSION_START,
            VERSION_CURRENT,
            state.context,
        )?;
        let freq_in = codec_util::open_checked_input(
            storage,
            &freq_name,
            FREQ_CODEC,
            VERSION_START,
            VERSION_CURRENT,
            state.context,
        )?;
        let prox_in = match &prox_name {
            Some(name) => Some(codec_util::open_checked_input(
                storage,
                name,
                PROX_CODEC,
                VERSION_START,
                VERSION_CURRENT,
                state.context,
            )?),
            None => None,
        };

        let mut index_in = codec_util::read_checked(storage, &index_name, state.context)?;
        codec_util::check_header(
            &mut index_in,
            TERMS_INDEX_CODEC,
            VERSION_START,
            VERSION_CURRENT,
        )?;
        let interval = index_in.read_varint()?;
        if interval == 0 {
            return Err(QuiverError::corrupt_index(format!(
                "{index_name}: term index interval is 0"
            )));
        }
        let num_indexed = index_in.read_varint()?;
        let mut indexes = BTreeMap::new();
        for _ in 0..num_indexed {
            let number = index_in.read_varint_u32()?;
            let count = index_in.read_varint()?;
            let mut entries = Vec::new();
            for _ in 0..count {
                let term = index_in.read_bytes()?;
                let pointer = index_in.read_varint()?;
                entries.push((term, pointer));
            }
            indexes.insert(number, entries);
        }

        let directory_pointer = terms_in.size() - codec_util::FOOTER_LENGTH - 8;
        terms_in.seek(directory_pointer)?;
        let directory_offset = terms_in.read_u64()?;
        terms_in.seek(directory_offset)?;

        let num_fields = terms_in.read_varint()?;
        let mut fields = BTreeMap::new();
        let mut by_name = AHashMap::new();
        for _ in 0..num_fields {
            let number = terms_in.read_varint_u32()?;
            let num_terms = terms_in.read_varint()?;
            let sum_total_term_freq = terms_in.read_zigzag()?;
            let sum_doc_freq = terms_in.read_varint()? as i64;
            let doc_count = terms_in.read_varint_u32()?;
            let _start = terms_in.read_varint()?;

            let info = state
                .field_infos
                .field_info_by_number(number)
                .filter(|info| info.is_indexed())
                .ok_or_else(|| {
                    QuiverError::corrupt_index(format!(
                        "{terms_name}: field number {number} is not an indexed field"
                    ))
                })?;
            let index = indexes.remove(&number).ok_or_else(|| {
                QuiverError::corrupt_index(format!(
                    "{index_name}: no term index for field number {number}"
                ))
            })?;
            if num_terms == 0 || index.len() as u64 != num_terms.div_ceil(interval) {
                return Err(QuiverError::corrupt_index(format!(
                    "{index_name}: field {} has {} index terms for {num_terms} terms",
                    info.name,
                    index.len()
                )));
            }
            if (sum_total_term_freq == -1) == info.has_freqs() || sum_doc_freq < doc_count as i64
            {
                return Err(QuiverError::corrupt_index(format!(
                    "{terms_name}: inconsistent statistics for field {}",
                    info.name
                )));
            }

            by_name.insert(info.name.clone(), number);
            fields.insert(
                number,
                Arc::new(FieldMeta {
                    info: info.clone(),
                    num_terms,
                    sum_total_term_freq,
                    sum_doc_freq,
                    doc_count,
                    index,
                }),
            );
        }
        if !indexes.is_empty() {
            return Err(QuiverError::corrupt_index(format!(
                "{index_name}: term index has fields missing from the directory"
            )));
        }

        log::debug!(
            "Opened postings of segment {segment}: {} fields, interval {interval}",
            fields.len()
        );

        Ok(Quiver10FieldsReader {
            terms_name,
            freq_name,
            prox_name,
            terms_in: Mutex::new(terms_in),
            freq_in: Mutex::new(freq_in),
            prox_in: prox_in.map(Mutex::new),
            interval,
            fields,
            by_name,
        })
    }

    fn clone_input(input: &Mutex<Input>) -> Result<Input> {
        StructReader::new(input.lock().get_ref().clone_input()?)
    }
}

impl FieldsProducer for Quiver10FieldsReader {
    fn fields(&self) -> Vec<String> {
        self.fields.values().map(|f| f.info.name.clone()).collect()
    }

    fn terms(&self, field: &str) -> Result<Option<Box<dyn Terms + '_>>> {
        let Some(number) = self.by_name.get(field) else {
            return Ok(None);
        };
        Ok(self.fields.get(number).map(|meta| {
            Box::new(FieldTerms {
                reader: self,
                meta: Arc::clone(meta),
            }) as Box<dyn Terms + '_>
        }))
    }

    fn check_integrity(&self) -> Result<()> {
        let mut terms = self.terms_in.lock().get_ref().clone_input()?;
        codec_util::checksum_entire_file(terms.as_mut(), &self.terms_name)?;
        let mut freq = self.freq_in.lock().get_ref().clone_input()?;
        codec_util::checksum_entire_file(freq.as_mut(), &self.freq_name)?;
        if let (Some(prox_in), Some(name)) = (&self.prox_in, &self.prox_name) {
            let mut prox = prox_in.lock().get_ref().clone_input()?;
            codec_util::checksum_entire_file(prox.as_mut(), name)?;
        }
        Ok(())
    }
}

struct FieldTerms<'a> {
    reader: &'a Quiver10FieldsReader,
    meta: Arc<FieldMeta>,
}

impl Terms for FieldTerms<'_> {
    fn size(&self) -> u64 {
        self.meta.num_terms
    }

    fn sum_total_term_freq(&self) -> i64 {
        self.meta.sum_total_term_freq
    }

    fn sum_doc_freq(&self) -> i64 {
        self.meta.sum_doc_freq
    }

    fn doc_count(&self) -> u32 {
        self.meta.doc_count
    }

    fn has_freqs(&self) -> bool {
        self.meta.info.has_freqs()
    }

    fn has_positions(&self) -> bool {
        self.meta.info.has_positions()
    }

    fn has_offsets(&self) -> bool {
        self.meta.info.has_offsets()
    }

    fn has_payloads(&self) -> bool {
        self.meta.info.has_payloads()
    }

    fn iterator(&self) -> Result<Box<dyn TermsEnum>> {
        let reader = self.reader;
        let prox_in = match &reader.prox_in {
            Some(prox_in) if self.meta.info.has_positions() => {
                Some(Quiver10FieldsReader::clone_input(prox_in)?)
            }
            _ => None,
        };
        Ok(Box::new(Quiver10TermsEnum {
            meta: Arc::clone(&self.meta),
            interval: reader.interval,
            terms_in: Quiver10FieldsReader::clone_input(&reader.terms_in)?,
            freq_in: Quiver10FieldsReader::clone_input(&reader.freq_in)?,
            prox_in,
            next_ord: u64::MAX,
            positioned: false,
            ord: 0,
            term: Vec::new(),
            doc_freq: 0,
            total_term_freq: -1,
            freq_pointer: 0,
            prox_pointer: 0,
        }))
    }
}

/// Cursor over the term records of one field.
struct Quiver10TermsEnum {
    meta: Arc<FieldMeta>,
    interval: u64,
    terms_in: Input,
    freq_in: Input,
    prox_in: Option<Input>,
    /// Ordinal of the record under `terms_in`; `u64::MAX` before the first
    /// read.
    next_ord: u64,
    positioned: bool,
    ord: u64,
    term: Vec<u8>,
    doc_freq: u32,
    total_term_freq: i64,
    freq_pointer: u64,
    prox_pointer: u64,
}

impl Quiver10TermsEnum {
    fn seek_block(&mut self, block: usize) -> Result<()> {
        let (_, pointer) = self.meta.index.get(block).ok_or_else(|| {
            QuiverError::corrupt_index(format!(
                "term index block {block} missing for field {}",
                self.meta.info.name
            ))
        })?;
        self.terms_in.seek(*pointer)?;
        self.next_ord = block as u64 * self.interval;
        Ok(())
    }

    /// Decode the next record. Returns `false` past the last term.
    fn read_next(&mut self) -> Result<bool> {
        if self.next_ord == u64::MAX {
            self.seek_block(0)?;
        }
        if self.next_ord >= self.meta.num_terms {
            self.positioned = false;
            return Ok(false);
        }

        if self.next_ord % self.interval == 0 {
            self.freq_pointer = 0;
            self.prox_pointer = 0;
        }

        let input = &mut self.terms_in;
        let shared = input.read_varint()? as usize;
        let suffix_len = input.read_varint()? as usize;
        if shared > self.term.len() {
            return Err(QuiverError::corrupt_index(format!(
                "field {}: shared prefix {shared} longer than previous term",
                self.meta.info.name
            )));
        }
        self.term.truncate(shared);
        self.term.extend_from_slice(&input.read_raw(suffix_len)?);

        self.doc_freq = input.read_varint_u32()?;
        self.total_term_freq = if self.meta.info.has_freqs() {
            self.doc_freq as i64 + input.read_varint()? as i64
        } else {
            -1
        };
        self.freq_pointer += input.read_varint()?;
        if self.meta.info.has_positions() {
            self.prox_pointer += input.read_varint()?;
        }

        self.ord = self.next_ord;
        self.next_ord += 1;
        self.positioned = true;
        Ok(true)
    }
}

impl TermsEnum for Quiver10TermsEnum {
    fn next(&mut self) -> Result<Option<&[u8]>> {
        if self.read_next()? {
            Ok(Some(&self.term))
        } else {
            Ok(None)
        }
    }

    fn seek_ceil(&mut self, target: &[u8]) -> Result<SeekStatus> {
        let block = self
            .meta
            .index
            .partition_point(|(term, _)| term.as_slice() <= target)
            .saturating_sub(1);
        self.seek_block(block)?;

        while self.read_next()? {
            match self.term.as_slice().cmp(target) {
                Ordering::Less => continue,
                Ordering::Equal => return Ok(SeekStatus::Found),
                Ordering::Greater => return Ok(SeekStatus::NotFound),
            }
        }
        Ok(SeekStatus::End)
    }

    fn seek_ord(&mut self, ord: u64) -> Result<()> {
        if ord >= self.meta.num_terms {
            return Err(QuiverError::invalid_argument(format!(
                "term ord {ord} out of range [0, {})",
                self.meta.num_terms
            )));
        }
        self.seek_block((ord / self.interval) as usize)?;
        while self.read_next()? {
            if self.ord == ord {
                return Ok(());
            }
        }
        Err(QuiverError::corrupt_index(format!(
            "field {}: term ord {ord} not found",
            self.meta.info.name
        )))
    }

    fn ord(&self) -> u64 {
        self.ord
    }

    fn term(&self) -> &[u8] {
        &self.term
    }

    fn doc_freq(&self) -> u32 {
        self.doc_freq
    }

    fn total_term_freq(&self) -> i64 {
        self.total_term_freq
    }

    fn postings(&mut self) -> Result<Box<dyn PostingsEnum + '_>> {
        if !self.positioned {
            return Err(QuiverError::invalid_operation(
                "terms enum is not positioned on a term",
            ));
        }

        let info = &self.meta.info;
        self.freq_in.seek(self.freq_pointer)?;
        let prox_in = match self.prox_in.as_mut() {
            Some(prox_in) => {
                prox_in.seek(self.prox_pointer)?;
                Some(prox_in)
            }
            None => None,
        };

        Ok(Box::new(Quiver10PostingsEnum {
            freq_in: &mut self.freq_in,
            prox_in,
            has_freqs: info.has_freqs(),
            has_positions: info.has_positions(),
            has_offsets: info.has_offsets(),
            store_payloads: info.has_payloads(),
            doc_freq: self.doc_freq,
            docs_read: 0,
            doc: 0,
            freq: 0,
            positions_left: 0,
            position: 0,
            offset_base: 0,
            start_offset: -1,
            end_offset: -1,
            payload_len: 0,
            payload: Vec::new(),
        }))
    }
}

/// Cursor over the documents and positions of one term.
struct Quiver10PostingsEnum<'a> {
    freq_in: &'a mut Input,
    prox_in: Option<&'a mut Input>,
    has_freqs: bool,
    has_positions: bool,
    has_offsets: bool,
    store_payloads: bool,
    doc_freq: u32,
    docs_read: u32,
    doc: u32,
    freq: u32,
    positions_left: u32,
    position: i32,
    offset_base: i64,
    start_offset: i32,
    end_offset: i32,
    /// Carried across documents of the same term.
    payload_len: usize,
    payload: Vec<u8>,
}

impl Quiver10PostingsEnum<'_> {
    fn read_position(&mut self) -> Result<()> {
        let input = self
            .prox_in
            .as_deref_mut()
            .ok_or_else(|| QuiverError::corrupt_index("positions indexed without a prox file"))?;

        let delta = if self.store_payloads {
            let code = input.read_varint()?;
            if code & 1 != 0 {
                self.payload_len = input.read_varint()? as usize;
            }
            self.payload = input.read_raw(self.payload_len)?;
            code >> 1
        } else {
            input.read_varint()?
        };
        self.position += delta as i32;

        if self.has_offsets {
            self.offset_base += input.read_zigzag()?;
            let length = input.read_varint()? as i64;
            self.start_offset = self.offset_base as i32;
            self.end_offset = (self.offset_base + length) as i32;
        }

        self.positions_left -= 1;
        Ok(())
    }
}

impl PostingsEnum for Quiver10PostingsEnum<'_> {
    fn next_doc(&mut self) -> Result<u32> {
        while self.positions_left > 0 {
            self.read_position()?;
        }
        if self.docs_read >= self.doc_freq {
            self.doc = NO_MORE_DOCS;
            return Ok(NO_MORE_DOCS);
        }

        let code = self.freq_in.read_varint()?;
        let delta = if self.has_freqs {
            self.freq = if code & 1 != 0 {
                1
            } else {
                self.freq_in.read_varint_u32()?
            };
            code >> 1
        } else {
            self.freq = 1;
            code
        };

        let base = if self.docs_read == 0 { 0 } else { self.doc as u64 };
        let doc = base + delta;
        if doc >= NO_MORE_DOCS as u64 {
            return Err(QuiverError::corrupt_index(format!(
                "doc id {doc} out of range in postings"
            )));
        }
        self.doc = doc as u32;
        self.docs_read += 1;

        if self.has_positions {
            self.positions_left = self.freq;
            self.position = 0;
            self.offset_base = 0;
        }
        Ok(self.doc)
    }

    fn doc(&self) -> u32 {
        self.doc
    }

    fn freq(&self) -> u32 {
        self.freq
    }

    fn next_position(&mut self) -> Result<i32> {
        if !self.has_positions {
            return Err(QuiverError::invalid_operation(
                "field does not index positions",
            ));
        }
        if self.positions_left == 0 {
            return Err(QuiverError::invalid_operation(
                "next_position called more than freq times",
            ));
        }
        self.read_position()?;
        Ok(self.position)
    }

    fn start_offset(&self) -> i32 {
        if self.has_offsets { self.start_offset } else { -1 }
    }

    fn end_offset(&self) -> i32 {
        if self.has_offsets { self.end_offset } else { -1 }
    }

    fn payload(&self) -> Option<&[u8]> {
        if self.store_payloads && !self.payload.is_empty() {
            Some(&self.payload)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_infos::{FieldInfos, IndexOptions};
    use crate::codec::postings::writer::Quiver10FieldsWriter;
    use crate::codec::postings::{FieldsConsumer, SegmentWriteState, TermStats};
    use crate::storage::IoContext;
    use crate::storage::memory::MemoryStorage;

    /// `(term, [(doc, [(position, payload, start, end)])])`
    type Postings<'a> = Vec<(&'a str, Vec<(u32, Vec<(i32, Option<&'a [u8]>, i32, i32)>)>)>;

    fn field_infos() -> Arc<FieldInfos> {
        Arc::new(
            FieldInfos::new(vec![
                FieldInfo::new("id", 0, Some(IndexOptions::DocsOnly)),
                FieldInfo::new("count", 1, Some(IndexOptions::DocsAndFreqs)),
                FieldInfo::new("body", 2, Some(IndexOptions::DocsAndFreqsAndPositions))
                    .with_payloads(),
                FieldInfo::new(
                    "title",
                    3,
                    Some(IndexOptions::DocsAndFreqsAndPositionsAndOffsets),
                ),
                FieldInfo::new("empty", 4, Some(IndexOptions::DocsOnly)),
            ])
            .unwrap(),
        )
    }

    fn write_field(writer: &mut dyn FieldsConsumer, field: &FieldInfo, postings: &Postings) {
        let options = field.index_options.unwrap();
        let terms = writer.add_field(field).unwrap();
        let (mut sum_ttf, mut sum_df) = (0i64, 0i64);
        let mut docs = std::collections::BTreeSet::new();
        for (term, doc_list) in postings {
            let consumer = terms.start_term(term.as_bytes()).unwrap();
            let mut ttf = 0i64;
            for (doc, positions) in doc_list {
                let freq = if options.has_freqs() {
                    positions.len().max(1) as i32
                } else {
                    -1
                };
                consumer.start_doc(*doc, freq).unwrap();
                if options.has_positions() {
                    for (position, payload, start, end) in positions {
                        consumer.add_position(*position, *payload, *start, *end).unwrap();
                    }
                }
                consumer.finish_doc().unwrap();
                ttf += freq.max(0) as i64;
                docs.insert(*doc);
            }
            let ttf = if options.has_freqs() { ttf } else { -1 };
            terms
                .finish_term(
                    term.as_bytes(),
                    TermStats {
                        doc_freq: doc_list.len() as u32,
                        total_term_freq: ttf,
                    },
                )
                .unwrap();
            sum_df += doc_list.len() as i64;
            sum_ttf += ttf.max(0);
        }
        let sum_ttf = if options.has_freqs() { sum_ttf } else { -1 };
        terms.finish(sum_ttf, sum_df, docs.len() as u32).unwrap();
    }

    fn write_segment(storage: &Arc<MemoryStorage>, interval: usize) -> Arc<FieldInfos> {
        let infos = field_infos();
        let state = SegmentWriteState {
            segment: "_0".to_string(),
            field_infos: infos.clone(),
            doc_count: 10,
            context: IoContext::Default,
        };
        let mut writer = Quiver10FieldsWriter::new(storage.clone(), &state, interval).unwrap();

        const IDS: [&str; 10] = ["a0", "a1", "a2", "a3", "a4", "a5", "a6", "a7", "a8", "a9"];
        let ids: Postings = IDS
            .iter()
            .zip(0u32..)
            .map(|(term, doc)| (*term, vec![(doc, vec![])]))
            .collect();
        write_field(&mut writer, infos.field_info("id").unwrap(), &ids);

        let counts: Postings = vec![
            ("many", vec![(1, vec![(0, None, -1, -1); 3]), (7, vec![(0, None, -1, -1)])]),
        ];
        write_field(&mut writer, infos.field_info("count").unwrap(), &counts);

        let body: Postings = vec![
            ("cat", vec![
                (0, vec![(1, Some(b"xy".as_slice()), -1, -1), (4, Some(b"xy".as_slice()), -1, -1)]),
                (2, vec![(0, None, -1, -1)]),
            ]),
            ("dog", vec![(2, vec![(3, Some(b"z".as_slice()), -1, -1)])]),
        ];
        write_field(&mut writer, infos.field_info("body").unwrap(), &body);

        let title: Postings = vec![
            ("quick", vec![(5, vec![(0, None, 0, 5), (2, None, 10, 15)])]),
        ];
        write_field(&mut writer, infos.field_info("title").unwrap(), &title);

        write_field(&mut writer, infos.field_info("empty").unwrap(), &vec![]);
        writer.close().unwrap();
        infos
    }

    fn open(storage: &MemoryStorage, infos: Arc<FieldInfos>) -> Quiver10FieldsReader {
        let state = SegmentReadState {
            segment: "_0".to_string(),
            field_infos: infos,
            context: IoContext::Default,
        };
        Quiver10FieldsReader::open(storage, &state).unwrap()
    }

    #[test]
    fn test_fields_and_statistics() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = write_segment(&storage, 3);
        let reader = open(&storage, infos);
        reader.check_integrity().unwrap();

        assert_eq!(reader.fields(), vec!["id", "count", "body", "title"]);
        assert!(reader.terms("empty").unwrap().is_none());
        assert!(reader.terms("missing").unwrap().is_none());

        let ids = reader.terms("id").unwrap().unwrap();
        assert_eq!(ids.size(), 10);
        assert_eq!(ids.sum_total_term_freq(), -1);
        assert_eq!(ids.sum_doc_freq(), 10);
        assert_eq!(ids.doc_count(), 10);

        let counts = reader.terms("count").unwrap().unwrap();
        assert_eq!(counts.sum_total_term_freq(), 4);
        assert_eq!(counts.doc_count(), 2);

        let mut terms = reader.terms("body").unwrap().unwrap().iterator().unwrap();
        let mut seen = Vec::new();
        while let Some(term) = terms.next().unwrap() {
            seen.push(String::from_utf8(term.to_vec()).unwrap());
        }
        assert_eq!(seen, vec!["cat", "dog"]);
    }

    #[test]
    fn test_seek_across_index_blocks() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = write_segment(&storage, 3);
        let reader = open(&storage, infos);
        let mut terms = reader.terms("id").unwrap().unwrap().iterator().unwrap();

        assert_eq!(terms.seek_ceil(b"a7").unwrap(), SeekStatus::Found);
        assert_eq!(terms.ord(), 7);
        assert_eq!(terms.seek_ceil(b"a45").unwrap(), SeekStatus::NotFound);
        assert_eq!(terms.term(), b"a5");
        assert_eq!(terms.seek_ceil(b"0").unwrap(), SeekStatus::NotFound);
        assert_eq!(terms.term(), b"a0");
        assert_eq!(terms.seek_ceil(b"b").unwrap(), SeekStatus::End);
        assert!(terms.seek_exact(b"a3").unwrap());
        assert!(!terms.seek_exact(b"a33").unwrap());

        terms.seek_ord(9).unwrap();
        assert_eq!(terms.term(), b"a9");
        assert!(terms.next().unwrap().is_none());
        terms.seek_ord(4).unwrap();
        assert_eq!(terms.term(), b"a4");
        assert_eq!(terms.next().unwrap().unwrap(), b"a5");
        assert!(terms.seek_ord(10).is_err());

        let mut postings = terms.postings().unwrap();
        assert_eq!(postings.next_doc().unwrap(), 5);
        assert_eq!(postings.freq(), 1);
        assert_eq!(postings.next_doc().unwrap(), NO_MORE_DOCS);
    }

    #[test]
    fn test_positions_payloads_and_offsets() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = write_segment(&storage, 2);
        let reader = open(&storage, infos);

        let mut terms = reader.terms("body").unwrap().unwrap().iterator().unwrap();
        assert!(terms.seek_exact(b"cat").unwrap());
        assert_eq!(terms.doc_freq(), 2);
        assert_eq!(terms.total_term_freq(), 3);
        {
            let mut postings = terms.postings().unwrap();
            assert_eq!(postings.next_doc().unwrap(), 0);
            assert_eq!(postings.freq(), 2);
            assert_eq!(postings.next_position().unwrap(), 1);
            assert_eq!(postings.payload(), Some(b"xy".as_slice()));
            assert_eq!(postings.next_position().unwrap(), 4);
            assert!(postings.next_position().is_err());
            assert_eq!(postings.next_doc().unwrap(), 2);
            assert_eq!(postings.next_position().unwrap(), 0);
            assert_eq!(postings.payload(), None);
            assert_eq!(postings.start_offset(), -1);
        }

        // Unread positions are skipped
        assert_eq!(terms.next().unwrap().unwrap(), b"dog");
        {
            let mut postings = terms.postings().unwrap();
            assert_eq!(postings.advance(1).unwrap(), 2);
            assert_eq!(postings.next_position().unwrap(), 3);
            assert_eq!(postings.payload(), Some(b"z".as_slice()));
        }

        let mut titles = reader.terms("title").unwrap().unwrap().iterator().unwrap();
        assert!(titles.seek_exact(b"quick").unwrap());
        let mut postings = titles.postings().unwrap();
        assert_eq!(postings.next_doc().unwrap(), 5);
        assert_eq!(postings.next_position().unwrap(), 0);
        assert_eq!((postings.start_offset(), postings.end_offset()), (0, 5));
        assert_eq!(postings.next_position().unwrap(), 2);
        assert_eq!((postings.start_offset(), postings.end_offset()), (10, 15));
    }

    #[test]
    fn test_docs_only_requires_minus_one() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        let state = SegmentWriteState {
            segment: "_1".to_string(),
            field_infos: infos.clone(),
            doc_count: 4,
            context: IoContext::Default,
        };
        let mut writer = Quiver10FieldsWriter::new(storage.clone(), &state, 4).unwrap();
        let terms = writer.add_field(infos.field_info("id").unwrap()).unwrap();

        let postings = terms.start_term(b"x").unwrap();
        assert!(postings.start_doc(0, 1).is_err());
        postings.start_doc(0, -1).unwrap();
        postings.finish_doc().unwrap();
        let stats = TermStats {
            doc_freq: 1,
            total_term_freq: 1,
        };
        assert!(terms.finish_term(b"x", stats).is_err());
    }

    #[test]
    fn test_writer_contract_checks() {
        let storage = Arc::new(MemoryStorage::new());
        let infos = field_infos();
        let state = SegmentWriteState {
            segment: "_2".to_string(),
            field_infos: infos.clone(),
            doc_count: 4,
            context: IoContext::Default,
        };
        let mut writer = Quiver10FieldsWriter::new(storage.clone(), &state, 4).unwrap();
        let body = infos.field_info("body").unwrap();

        let terms = writer.add_field(body).unwrap();
        let postings = terms.start_term(b"m").unwrap();
        postings.start_doc(2, 1).unwrap();
        postings.add_position(0, None, -1, -1).unwrap();
        // Too many positions
        assert!(postings.add_position(1, None, -1, -1).is_err());
        postings.finish_doc().unwrap();
        // Docs must ascend
        assert!(postings.start_doc(1, 1).is_err());
        // Out of range
        assert!(postings.start_doc(4, 1).is_err());
        terms
            .finish_term(
                b"m",
                TermStats {
                    doc_freq: 1,
                    total_term_freq: 1,
                },
            )
            .unwrap();
        // Terms must ascend
        assert!(terms.start_term(b"a").is_err());
        terms.finish(1, 1, 1).unwrap();

        // Fields must ascend
        assert!(writer.add_field(infos.field_info("id").unwrap()).is_err());
        writer.close().unwrap();
    }

    #[test]
    fn test_abort_removes_files() {
        let storage = Arc::new(MemoryStorage::new());
        let state = SegmentWriteState {
            segment: "_3".to_string(),
            field_infos: field_infos(),
            doc_count: 1,
            context: IoContext::Default,
        };
        let mut writer = Quiver10FieldsWriter::new(storage.clone(), &state, 4).unwrap();
        writer.abort();
        assert_eq!(storage.file_count(), 0);
    }
}
