//! Segment descriptor: document count, codec, file set and identity of one
//! segment, stored in `<segment>.si`.

use std::collections::{BTreeMap, BTreeSet};

use uuid::Uuid;

use crate::codec::codec_util;
use crate::codec::field_infos::FieldInfos;
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, SEGMENT_INFO_EXTENSION};
use crate::storage::{IoContext, Storage};

/// Metadata of one segment.
///
/// Immutable once written; deletions are tracked by
/// [`SegmentCommitInfo`](crate::index::segment_commit_info::SegmentCommitInfo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentInfo {
    /// Segment name, e.g. `_0`.
    pub name: String,

    /// Number of documents, including deleted ones.
    pub doc_count: u32,

    /// Name of the codec that wrote the segment.
    pub codec: String,

    /// Version of the library that wrote the segment.
    pub version: String,

    /// Random identity, distinguishes segments that reuse a name.
    pub id: Uuid,

    /// Free-form facts about how the segment was produced.
    pub diagnostics: BTreeMap<String, String>,

    files: BTreeSet<String>,
}

impl SegmentInfo {
    /// Create a new segment info with a fresh id and no files.
    pub fn new(name: impl Into<String>, doc_count: u32, codec: impl Into<String>) -> Self {
        SegmentInfo {
            name: name.into(),
            doc_count,
            codec: codec.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            id: Uuid::new_v4(),
            diagnostics: BTreeMap::new(),
            files: BTreeSet::new(),
        }
    }

    /// Record the segment's files. Every name must belong to this segment.
    pub fn set_files<I>(&mut self, files: I) -> Result<()>
    where
        I: IntoIterator<Item = String>,
    {
        let files: BTreeSet<String> = files.into_iter().collect();
        if let Some(foreign) = files
            .iter()
            .find(|f| file_names::parse_segment_name(f) != self.name)
        {
            return Err(QuiverError::invalid_argument(format!(
                "file {foreign} does not belong to segment {}",
                self.name
            )));
        }
        self.files = files;
        Ok(())
    }

    /// Files of the segment, excluding deletion generations.
    pub fn files(&self) -> &BTreeSet<String> {
        &self.files
    }

    /// Name of this segment's `.si` file.
    pub fn file_name(&self) -> String {
        file_names::segment_file_name(&self.name, SEGMENT_INFO_EXTENSION)
    }
}

/// Reads and writes segment descriptors.
pub trait SegmentInfoFormat: Send + Sync {
    /// Read the descriptor of `segment`.
    fn read(&self, storage: &dyn Storage, segment: &str, context: IoContext) -> Result<SegmentInfo>;

    /// Write the descriptor of `info`.
    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        field_infos: &FieldInfos,
        context: IoContext,
    ) -> Result<()>;
}

/// The standard `.si` format.
#[derive(Debug, Clone, Default)]
pub struct Quiver10SegmentInfoFormat;

impl Quiver10SegmentInfoFormat {
    pub const CODEC_NAME: &'static str = "Quiver10SegmentInfo";
    pub const VERSION_START: u32 = 0;
    pub const VERSION_CURRENT: u32 = 0;
}

impl SegmentInfoFormat for Quiver10SegmentInfoFormat {
    fn read(&self, storage: &dyn Storage, segment: &str, context: IoContext) -> Result<SegmentInfo> {
        let file_name = file_names::segment_file_name(segment, SEGMENT_INFO_EXTENSION);
        let mut input = codec_util::read_checked(storage, &file_name, context)?;
        codec_util::check_header(
            &mut input,
            Self::CODEC_NAME,
            Self::VERSION_START,
            Self::VERSION_CURRENT,
        )?;

        let version = input.read_string()?;
        let doc_count = input.read_varint_u32()?;
        let codec = input.read_string()?;
        let id_bytes: [u8; 16] = input
            .read_raw(16)?
            .try_into()
            .map_err(|_| QuiverError::corrupt_index(format!("{file_name}: short segment id")))?;

        let num_diagnostics = input.read_varint()?;
        let mut diagnostics = BTreeMap::new();
        for _ in 0..num_diagnostics {
            let key = input.read_string()?;
            let value = input.read_string()?;
            diagnostics.insert(key, value);
        }

        let num_files = input.read_varint()?;
        let mut files = Vec::new();
        for _ in 0..num_files {
            files.push(input.read_string()?);
        }

        let mut info = SegmentInfo {
            name: segment.to_string(),
            doc_count,
            codec,
            version,
            id: Uuid::from_bytes(id_bytes),
            diagnostics,
            files: BTreeSet::new(),
        };
        info.set_files(files)
            .map_err(|e| QuiverError::corrupt_index(format!("{file_name}: {e}")))?;
        Ok(info)
    }

    fn write(
        &self,
        storage: &dyn Storage,
        info: &SegmentInfo,
        _field_infos: &FieldInfos,
        context: IoContext,
    ) -> Result<()> {
        let file_name = info.file_name();
        let mut output = codec_util::create_output(
            storage,
            &file_name,
            Self::CODEC_NAME,
            Self::VERSION_CURRENT,
            context,
        )?;

        output.write_string(&info.version)?;
        output.write_varint(info.doc_count as u64)?;
        output.write_string(&info.codec)?;
        output.write_raw(info.id.as_bytes())?;

        output.write_varint(info.diagnostics.len() as u64)?;
        for (key, value) in &info.diagnostics {
            output.write_string(key)?;
            output.write_string(value)?;
        }

        output.write_varint(info.files.len() as u64)?;
        for file in &info.files {
            output.write_string(file)?;
        }

        codec_util::finish_output(output)
    }
}
