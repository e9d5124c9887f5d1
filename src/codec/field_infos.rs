//! Field metadata: per-field name, number and indexing detail level.
//!
//! The field number assigned here is the key every other per-field artifact
//! (stored fields, postings, term vectors) uses, so it must stay stable for
//! the lifetime of a segment.

use std::io::{Read, Seek};

use ahash::AHashMap;

use crate::codec::codec_util;
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, FIELD_INFOS_EXTENSION};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IoContext, Storage, StorageOutput};

/// Granularity of the postings stored for a field.
///
/// Variants are ordered from least to most detailed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IndexOptions {
    /// Only which documents contain a term.
    DocsOnly,
    /// Documents and per-document term frequencies.
    DocsAndFreqs,
    /// Documents, frequencies and positions (with optional payloads).
    DocsAndFreqsAndPositions,
    /// Documents, frequencies, positions and character offsets.
    DocsAndFreqsAndPositionsAndOffsets,
}

impl IndexOptions {
    pub fn has_freqs(self) -> bool {
        self >= IndexOptions::DocsAndFreqs
    }

    pub fn has_positions(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositions
    }

    pub fn has_offsets(self) -> bool {
        self >= IndexOptions::DocsAndFreqsAndPositionsAndOffsets
    }

    fn to_code(self) -> u8 {
        match self {
            IndexOptions::DocsOnly => 0,
            IndexOptions::DocsAndFreqs => 1,
            IndexOptions::DocsAndFreqsAndPositions => 2,
            IndexOptions::DocsAndFreqsAndPositionsAndOffsets => 3,
        }
    }

    fn from_code(code: u8) -> Result<Option<Self>> {
        match code {
            0 => Ok(Some(IndexOptions::DocsOnly)),
            1 => Ok(Some(IndexOptions::DocsAndFreqs)),
            2 => Ok(Some(IndexOptions::DocsAndFreqsAndPositions)),
            3 => Ok(Some(IndexOptions::DocsAndFreqsAndPositionsAndOffsets)),
            NOT_INDEXED => Ok(None),
            other => Err(QuiverError::corrupt_index(format!(
                "Invalid index options code: {other}"
            ))),
        }
    }
}

const NOT_INDEXED: u8 = 0xFF;

/// Metadata of one field within a segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldInfo {
    /// Field name.
    pub name: String,

    /// Field number, unique within the segment.
    pub number: u32,

    /// Indexing detail level; `None` when the field is not indexed.
    pub index_options: Option<IndexOptions>,

    /// Whether term vectors are stored for the field.
    pub store_term_vectors: bool,

    /// Whether postings carry payloads. Only meaningful with positions.
    pub store_payloads: bool,
}

impl FieldInfo {
    /// Create a new field info.
    pub fn new(name: impl Into<String>, number: u32, index_options: Option<IndexOptions>) -> Self {
        FieldInfo {
            name: name.into(),
            number,
            index_options,
            store_term_vectors: false,
            store_payloads: false,
        }
    }

    /// Enable term vectors.
    pub fn with_term_vectors(mut self) -> Self {
        self.store_term_vectors = true;
        self
    }

    /// Enable payloads. Ignored unless positions are indexed.
    pub fn with_payloads(mut self) -> Self {
        self.store_payloads = self.has_positions();
        self
    }

    pub fn is_indexed(&self) -> bool {
        self.index_options.is_some()
    }

    pub fn has_freqs(&self) -> bool {
        self.index_options.is_some_and(IndexOptions::has_freqs)
    }

    pub fn has_positions(&self) -> bool {
        self.index_options.is_some_and(IndexOptions::has_positions)
    }

    pub fn has_offsets(&self) -> bool {
        self.index_options.is_some_and(IndexOptions::has_offsets)
    }

    pub fn has_payloads(&self) -> bool {
        self.store_payloads
    }

    /// Fold another definition of the same field into this one.
    ///
    /// Index options downgrade to the less detailed level, vectors and
    /// payloads are OR-ed, and payloads are dropped without positions.
    fn update(&mut self, other: &FieldInfo) {
        self.index_options = match (self.index_options, other.index_options) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.store_term_vectors |= other.store_term_vectors;
        self.store_payloads |= other.store_payloads;
        if !self.has_positions() {
            self.store_payloads = false;
        }
    }
}

/// The ordered set of fields of one segment.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldInfos {
    /// Sorted by number.
    fields: Vec<FieldInfo>,
    by_name: AHashMap<String, usize>,
    has_vectors: bool,
    has_freqs: bool,
    has_prox: bool,
    has_offsets: bool,
    has_payloads: bool,
}

impl FieldInfos {
    /// Build from an arbitrary list. Duplicate numbers or names are rejected.
    pub fn new(mut fields: Vec<FieldInfo>) -> Result<Self> {
        fields.sort_by_key(|f| f.number);

        let mut by_name = AHashMap::with_capacity(fields.len());
        for (i, field) in fields.iter().enumerate() {
            if i > 0 && fields[i - 1].number == field.number {
                return Err(QuiverError::invalid_argument(format!(
                    "duplicate field number {}: {} and {}",
                    field.number,
                    fields[i - 1].name,
                    field.name
                )));
            }
            if by_name.insert(field.name.clone(), i).is_some() {
                return Err(QuiverError::invalid_argument(format!(
                    "duplicate field name: {}",
                    field.name
                )));
            }
        }

        Ok(FieldInfos {
            has_vectors: fields.iter().any(|f| f.store_term_vectors),
            has_freqs: fields.iter().any(|f| f.has_freqs()),
            has_prox: fields.iter().any(|f| f.has_positions()),
            has_offsets: fields.iter().any(|f| f.has_offsets()),
            has_payloads: fields.iter().any(|f| f.has_payloads()),
            fields,
            by_name,
        })
    }

    /// Look up a field by name.
    pub fn field_info(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Look up a field by number.
    pub fn field_info_by_number(&self, number: u32) -> Option<&FieldInfo> {
        self.fields
            .binary_search_by_key(&number, |f| f.number)
            .ok()
            .map(|i| &self.fields[i])
    }

    /// Iterate fields in ascending number order.
    pub fn iter(&self) -> impl Iterator<Item = &FieldInfo> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn has_vectors(&self) -> bool {
        self.has_vectors
    }

    pub fn has_freqs(&self) -> bool {
        self.has_freqs
    }

    pub fn has_prox(&self) -> bool {
        self.has_prox
    }

    pub fn has_offsets(&self) -> bool {
        self.has_offsets
    }

    pub fn has_payloads(&self) -> bool {
        self.has_payloads
    }
}

/// Accumulates field definitions and hands out numbers.
///
/// Used both while indexing (new names get the next free number) and while
/// merging (each segment's fields are folded in, keeping their number when
/// it is still free).
#[derive(Debug, Clone, Default)]
pub struct FieldInfosBuilder {
    fields: Vec<FieldInfo>,
    by_name: AHashMap<String, usize>,
    used_numbers: AHashMap<u32, usize>,
    next_number: u32,
}

impl FieldInfosBuilder {
    /// Create a new, empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a field by its attributes, returning the field's info.
    pub fn add_or_update(
        &mut self,
        name: &str,
        index_options: Option<IndexOptions>,
        store_term_vectors: bool,
        store_payloads: bool,
    ) -> &FieldInfo {
        let mut info = FieldInfo::new(name, u32::MAX, index_options);
        info.store_term_vectors = store_term_vectors;
        info.store_payloads = store_payloads && info.has_positions();
        self.add(&info)
    }

    /// Fold in a field defined elsewhere, preferring its number.
    pub fn add(&mut self, other: &FieldInfo) -> &FieldInfo {
        if let Some(&i) = self.by_name.get(&other.name) {
            self.fields[i].update(other);
            return &self.fields[i];
        }

        let number = if other.number != u32::MAX && !self.used_numbers.contains_key(&other.number)
        {
            other.number
        } else {
            while self.used_numbers.contains_key(&self.next_number) {
                self.next_number += 1;
            }
            self.next_number
        };

        let mut info = other.clone();
        info.number = number;
        if !info.has_positions() {
            info.store_payloads = false;
        }

        let index = self.fields.len();
        self.used_numbers.insert(number, index);
        self.by_name.insert(info.name.clone(), index);
        self.fields.push(info);
        &self.fields[index]
    }

    /// Fold in every field of another set.
    pub fn add_all(&mut self, infos: &FieldInfos) {
        for info in infos.iter() {
            self.add(info);
        }
    }

    /// Current definition of a field.
    pub fn get(&self, name: &str) -> Option<&FieldInfo> {
        self.by_name.get(name).map(|&i| &self.fields[i])
    }

    /// Freeze into an immutable, number-ordered set.
    pub fn finish(&self) -> Result<FieldInfos> {
        FieldInfos::new(self.fields.clone())
    }
}

/// Reads and writes a segment's field metadata.
pub trait FieldInfosFormat: Send + Sync {
    /// Read the field metadata of `segment`.
    fn read(&self, storage: &dyn Storage, segment: &str, context: IoContext) -> Result<FieldInfos>;

    /// Persist the field metadata of `segment`.
    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        infos: &FieldInfos,
        context: IoContext,
    ) -> Result<()>;
}

/// The standard `.fnm` format.
#[derive(Debug, Clone, Default)]
pub struct Quiver10FieldInfosFormat;

impl Quiver10FieldInfosFormat {
    pub const CODEC_NAME: &'static str = "Quiver10FieldInfos";
    pub const VERSION_START: u32 = 0;
    pub const VERSION_CURRENT: u32 = 0;

    const IS_INDEXED: u8 = 0x1;
    const STORE_TERM_VECTORS: u8 = 0x2;
    const STORE_PAYLOADS: u8 = 0x4;

    fn write_fields<W: StorageOutput>(
        output: &mut StructWriter<W>,
        infos: &FieldInfos,
    ) -> Result<()> {
        output.write_varint(infos.len() as u64)?;
        let mut last_number: Option<u32> = None;
        for field in infos.iter() {
            if last_number.is_some_and(|n| n >= field.number) {
                return Err(QuiverError::invalid_operation(format!(
                    "field number {} written twice or out of order",
                    field.number
                )));
            }
            last_number = Some(field.number);

            let mut bits = 0u8;
            if field.is_indexed() {
                bits |= Self::IS_INDEXED;
            }
            if field.store_term_vectors {
                bits |= Self::STORE_TERM_VECTORS;
            }
            if field.store_payloads {
                bits |= Self::STORE_PAYLOADS;
            }

            output.write_string(&field.name)?;
            output.write_varint(field.number as u64)?;
            output.write_u8(bits)?;
            output.write_u8(field.index_options.map_or(NOT_INDEXED, IndexOptions::to_code))?;
        }
        Ok(())
    }

    fn read_field<R: Read + Seek>(input: &mut StructReader<R>) -> Result<FieldInfo> {
        let name = input.read_string()?;
        let number = input.read_varint_u32()?;
        let bits = input.read_u8()?;
        let index_options = IndexOptions::from_code(input.read_u8()?)?;

        if (bits & Self::IS_INDEXED != 0) != index_options.is_some() {
            return Err(QuiverError::corrupt_index(format!(
                "field {name}: indexed flag does not match index options"
            )));
        }

        Ok(FieldInfo {
            name,
            number,
            index_options,
            store_term_vectors: bits & Self::STORE_TERM_VECTORS != 0,
            store_payloads: bits & Self::STORE_PAYLOADS != 0,
        })
    }
}

impl FieldInfosFormat for Quiver10FieldInfosFormat {
    fn read(&self, storage: &dyn Storage, segment: &str, context: IoContext) -> Result<FieldInfos> {
        let file_name = file_names::segment_file_name(segment, FIELD_INFOS_EXTENSION);
        let mut input = codec_util::read_checked(storage, &file_name, context)?;
        codec_util::check_header(
            &mut input,
            Self::CODEC_NAME,
            Self::VERSION_START,
            Self::VERSION_CURRENT,
        )?;

        let count = input.read_varint()? as usize;
        let mut fields = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            fields.push(Self::read_field(&mut input)?);
        }

        if input.remaining() != 0 {
            return Err(QuiverError::corrupt_index(format!(
                "{file_name}: {} trailing bytes",
                input.remaining()
            )));
        }

        // Inconsistent numbering on disk is damage, not a caller mistake.
        FieldInfos::new(fields).map_err(|e| QuiverError::corrupt_index(format!("{file_name}: {e}")))
    }

    fn write(
        &self,
        storage: &dyn Storage,
        segment: &str,
        infos: &FieldInfos,
        context: IoContext,
    ) -> Result<()> {
        let file_name = file_names::segment_file_name(segment, FIELD_INFOS_EXTENSION);
        let mut output = codec_util::create_output(
            storage,
            &file_name,
            Self::CODEC_NAME,
            Self::VERSION_CURRENT,
            context,
        )?;

        let result =
            Self::write_fields(&mut output, infos).and_then(|()| codec_util::finish_output(output));
        if let Err(e) = result {
            if storage.file_exists(&file_name) {
                if let Err(delete_error) = storage.delete_file(&file_name) {
                    log::warn!("Failed to delete partial {file_name}: {delete_error}");
                }
            }
            return Err(e);
        }

        log::debug!("Wrote {} field infos to {file_name}", infos.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn sample_infos() -> FieldInfos {
        FieldInfos::new(vec![
            FieldInfo::new("title", 1, Some(IndexOptions::DocsAndFreqsAndPositions))
                .with_payloads(),
            FieldInfo::new("id", 0, Some(IndexOptions::DocsOnly)),
            FieldInfo::new("stored", 3, None),
            FieldInfo::new("body", 2, Some(IndexOptions::DocsAndFreqsAndPositionsAndOffsets))
                .with_term_vectors(),
        ])
        .unwrap()
    }

    #[test]
    fn test_field_infos_ordering_and_lookup() {
        let infos = sample_infos();
        let numbers: Vec<u32> = infos.iter().map(|f| f.number).collect();
        assert_eq!(numbers, vec![0, 1, 2, 3]);
        assert_eq!(infos.field_info("body").unwrap().number, 2);
        assert_eq!(infos.field_info_by_number(1).unwrap().name, "title");
        assert!(infos.field_info_by_number(9).is_none());
        assert!(infos.has_vectors());
        assert!(infos.has_payloads());
        assert!(infos.has_offsets());
    }

    #[test]
    fn test_duplicate_numbers_rejected() {
        let result = FieldInfos::new(vec![
            FieldInfo::new("a", 0, None),
            FieldInfo::new("b", 0, None),
        ]);
        assert!(result.is_err());

        let result = FieldInfos::new(vec![
            FieldInfo::new("a", 0, None),
            FieldInfo::new("a", 1, None),
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_write_read_round_trip() {
        let storage = MemoryStorage::new();
        let format = Quiver10FieldInfosFormat;
        let infos = sample_infos();

        format.write(&storage, "_0", &infos, IoContext::Default).unwrap();
        let read = format.read(&storage, "_0", IoContext::ReadOnce).unwrap();

        assert_eq!(read, infos);
        let names: Vec<&str> = read.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["id", "title", "body", "stored"]);
    }

    #[test]
    fn test_corrupt_file_detected() {
        let storage = MemoryStorage::new();
        let format = Quiver10FieldInfosFormat;
        format
            .write(&storage, "_0", &sample_infos(), IoContext::Default)
            .unwrap();

        let mut data = storage.read_all("_0.fnm").unwrap();
        data[25] ^= 0xFF;
        storage.overwrite("_0.fnm", data);

        let err = format.read(&storage, "_0", IoContext::ReadOnce).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_failed_write_leaves_no_file() {
        let storage = MemoryStorage::new();
        let format = Quiver10FieldInfosFormat;
        let mut infos = sample_infos();
        infos.fields.swap(0, 1);

        let err = format
            .write(&storage, "_0", &infos, IoContext::Default)
            .unwrap_err();
        assert!(!err.is_corruption());
        assert!(!storage.file_exists("_0.fnm"));
        assert!(storage.list_files().unwrap().is_empty());

        format.write(&storage, "_0", &sample_infos(), IoContext::Default).unwrap();
        assert!(storage.file_exists("_0.fnm"));
    }

    #[test]
    fn test_builder_assigns_numbers() {
        let mut builder = FieldInfosBuilder::new();
        assert_eq!(
            builder
                .add_or_update("title", Some(IndexOptions::DocsAndFreqs), false, false)
                .number,
            0
        );
        assert_eq!(builder.add_or_update("body", None, false, false).number, 1);
        assert_eq!(
            builder
                .add_or_update("title", Some(IndexOptions::DocsAndFreqs), false, false)
                .number,
            0
        );
        assert_eq!(builder.finish().unwrap().len(), 2);
    }

    #[test]
    fn test_builder_union_rules() {
        let mut builder = FieldInfosBuilder::new();
        builder.add(
            &FieldInfo::new("f", 4, Some(IndexOptions::DocsAndFreqsAndPositions)).with_payloads(),
        );
        builder.add(&FieldInfo::new("f", 7, Some(IndexOptions::DocsAndFreqs)).with_term_vectors());

        let merged = builder.get("f").unwrap();
        assert_eq!(merged.number, 4);
        assert_eq!(merged.index_options, Some(IndexOptions::DocsAndFreqs));
        assert!(merged.store_term_vectors);
        // Payloads do not survive losing positions
        assert!(!merged.store_payloads);

        // A taken preferred number is reassigned
        builder.add(&FieldInfo::new("g", 4, None));
        assert_eq!(builder.get("g").unwrap().number, 0);

        // Indexed wins over not indexed
        builder.add(&FieldInfo::new("g", 0, Some(IndexOptions::DocsOnly)));
        assert!(builder.get("g").unwrap().is_indexed());
    }
}
