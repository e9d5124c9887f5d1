//! Codecs: one implementation per artifact format, bound together under a
//! name that is recorded with every segment.
//!
//! A [`Codec`] builds each of its formats lazily on first use and caches the
//! instance for its own lifetime. Readers pick the codec of a segment by name
//! through the [`CodecRegistry`](registry::CodecRegistry).
//!
//! # Example
//!
//! ```
//! use quiver::codec::Codec;
//! use quiver::config::IndexConfig;
//! use quiver::storage::memory::MemoryStorage;
//!
//! let codec = Codec::quiver10(&IndexConfig::default());
//! assert_eq!(codec.name(), "Quiver10");
//!
//! let storage = MemoryStorage::new();
//! assert!(!codec.exists_index(&storage).unwrap());
//! ```

pub mod codec_util;
pub mod commit_log;
pub mod field_infos;
pub mod live_docs;
pub mod postings;
pub mod registry;
pub mod segment_info;
pub mod stored_fields;
pub mod term_vectors;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::commit_log::{CommitLogFormat, Quiver10CommitLogFormat};
use crate::codec::field_infos::{FieldInfosFormat, Quiver10FieldInfosFormat};
use crate::codec::live_docs::{LiveDocsFormat, Quiver10LiveDocsFormat};
use crate::codec::postings::{PostingsFormat, Quiver10PostingsFormat};
use crate::codec::segment_info::{Quiver10SegmentInfoFormat, SegmentInfoFormat};
use crate::codec::stored_fields::StoredFieldsFormat;
use crate::codec::stored_fields::standard::Quiver10StoredFieldsFormat;
use crate::codec::term_vectors::TermVectorsFormat;
use crate::codec::term_vectors::standard::Quiver10TermVectorsFormat;
use crate::config::IndexConfig;
use crate::error::{QuiverError, Result};
use crate::storage::Storage;

type Factory<T> = Box<dyn Fn() -> Result<Arc<T>> + Send + Sync>;

/// A format built on first access and cached afterwards.
///
/// The factory runs under the slot's lock, so concurrent first calls build
/// exactly one instance. A failing factory leaves the slot empty and the
/// next call tries again.
pub struct LazyFormat<T: ?Sized> {
    factory: Factory<T>,
    slot: Mutex<Option<Arc<T>>>,
}

impl<T: ?Sized> LazyFormat<T> {
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn() -> Result<Arc<T>> + Send + Sync + 'static,
    {
        LazyFormat {
            factory: Box::new(factory),
            slot: Mutex::new(None),
        }
    }

    /// The cached instance, building it if needed.
    pub fn get(&self) -> Result<Arc<T>> {
        let mut slot = self.slot.lock();
        if let Some(format) = slot.as_ref() {
            return Ok(Arc::clone(format));
        }
        let format = (self.factory)()?;
        *slot = Some(Arc::clone(&format));
        Ok(format)
    }

    /// Whether the format has been built.
    pub fn is_initialized(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// A named bundle of the seven artifact formats.
pub struct Codec {
    name: String,
    field_infos: LazyFormat<dyn FieldInfosFormat>,
    stored_fields: LazyFormat<dyn StoredFieldsFormat>,
    postings: LazyFormat<dyn PostingsFormat>,
    live_docs: LazyFormat<dyn LiveDocsFormat>,
    term_vectors: LazyFormat<dyn TermVectorsFormat>,
    segment_info: LazyFormat<dyn SegmentInfoFormat>,
    commit_log: LazyFormat<dyn CommitLogFormat>,
}

impl Codec {
    /// Name of the standard codec.
    pub const QUIVER10: &'static str = "Quiver10";

    /// The standard codec configured from `config`.
    pub fn quiver10(config: &IndexConfig) -> Self {
        let term_index_interval = config.codec.term_index_interval;
        let gen_lookahead_count = config.commit.gen_lookahead_count;

        Codec {
            name: Self::QUIVER10.to_string(),
            field_infos: LazyFormat::new(|| {
                Ok(Arc::new(Quiver10FieldInfosFormat) as Arc<dyn FieldInfosFormat>)
            }),
            stored_fields: LazyFormat::new(|| {
                Ok(Arc::new(Quiver10StoredFieldsFormat) as Arc<dyn StoredFieldsFormat>)
            }),
            postings: LazyFormat::new(move || {
                Ok(Arc::new(Quiver10PostingsFormat::new(term_index_interval))
                    as Arc<dyn PostingsFormat>)
            }),
            live_docs: LazyFormat::new(|| {
                Ok(Arc::new(Quiver10LiveDocsFormat) as Arc<dyn LiveDocsFormat>)
            }),
            term_vectors: LazyFormat::new(|| {
                Ok(Arc::new(Quiver10TermVectorsFormat) as Arc<dyn TermVectorsFormat>)
            }),
            segment_info: LazyFormat::new(|| {
                Ok(Arc::new(Quiver10SegmentInfoFormat) as Arc<dyn SegmentInfoFormat>)
            }),
            commit_log: LazyFormat::new(move || {
                Ok(Arc::new(Quiver10CommitLogFormat::new(gen_lookahead_count))
                    as Arc<dyn CommitLogFormat>)
            }),
        }
    }

    /// Start assembling a codec from custom format factories.
    pub fn builder(name: impl Into<String>) -> CodecBuilder {
        CodecBuilder {
            name: name.into(),
            field_infos: None,
            stored_fields: None,
            postings: None,
            live_docs: None,
            term_vectors: None,
            segment_info: None,
            commit_log: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn field_infos_format(&self) -> Result<Arc<dyn FieldInfosFormat>> {
        self.field_infos.get()
    }

    pub fn stored_fields_format(&self) -> Result<Arc<dyn StoredFieldsFormat>> {
        self.stored_fields.get()
    }

    pub fn postings_format(&self) -> Result<Arc<dyn PostingsFormat>> {
        self.postings.get()
    }

    pub fn live_docs_format(&self) -> Result<Arc<dyn LiveDocsFormat>> {
        self.live_docs.get()
    }

    pub fn term_vectors_format(&self) -> Result<Arc<dyn TermVectorsFormat>> {
        self.term_vectors.get()
    }

    pub fn segment_info_format(&self) -> Result<Arc<dyn SegmentInfoFormat>> {
        self.segment_info.get()
    }

    pub fn commit_log_format(&self) -> Result<Arc<dyn CommitLogFormat>> {
        self.commit_log.get()
    }

    /// Whether `storage` holds a readable commit point.
    ///
    /// A missing or unreadable commit yields `false`; other I/O failures are
    /// returned.
    pub fn exists_index(&self, storage: &dyn Storage) -> Result<bool> {
        let format = self.commit_log_format()?;
        let result = commit_log::find_segments_file(
            storage,
            format.gen_lookahead_count(),
            |generation| format.read(storage, generation),
        );
        match result {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() || e.is_corruption() => {
                log::debug!("No valid commit found: {e}");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Codec").field("name", &self.name).finish()
    }
}

/// Assembles a [`Codec`] from one factory per format.
pub struct CodecBuilder {
    name: String,
    field_infos: Option<LazyFormat<dyn FieldInfosFormat>>,
    stored_fields: Option<LazyFormat<dyn StoredFieldsFormat>>,
    postings: Option<LazyFormat<dyn PostingsFormat>>,
    live_docs: Option<LazyFormat<dyn LiveDocsFormat>>,
    term_vectors: Option<LazyFormat<dyn TermVectorsFormat>>,
    segment_info: Option<LazyFormat<dyn SegmentInfoFormat>>,
    commit_log: Option<LazyFormat<dyn CommitLogFormat>>,
}

impl CodecBuilder {
    pub fn field_infos_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn FieldInfosFormat>> + Send + Sync + 'static,
    {
        self.field_infos = Some(LazyFormat::new(factory));
        self
    }

    pub fn stored_fields_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn StoredFieldsFormat>> + Send + Sync + 'static,
    {
        self.stored_fields = Some(LazyFormat::new(factory));
        self
    }

    pub fn postings_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn PostingsFormat>> + Send + Sync + 'static,
    {
        self.postings = Some(LazyFormat::new(factory));
        self
    }

    pub fn live_docs_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn LiveDocsFormat>> + Send + Sync + 'static,
    {
        self.live_docs = Some(LazyFormat::new(factory));
        self
    }

    pub fn term_vectors_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn TermVectorsFormat>> + Send + Sync + 'static,
    {
        self.term_vectors = Some(LazyFormat::new(factory));
        self
    }

    pub fn segment_info_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn SegmentInfoFormat>> + Send + Sync + 'static,
    {
        self.segment_info = Some(LazyFormat::new(factory));
        self
    }

    pub fn commit_log_format<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> Result<Arc<dyn CommitLogFormat>> + Send + Sync + 'static,
    {
        self.commit_log = Some(LazyFormat::new(factory));
        self
    }

    /// Finish the codec. Every format must have a factory.
    pub fn build(self) -> Result<Codec> {
        fn require<T: ?Sized>(
            slot: Option<LazyFormat<T>>,
            codec: &str,
            what: &str,
        ) -> Result<LazyFormat<T>> {
            slot.ok_or_else(|| {
                QuiverError::invalid_argument(format!("codec {codec} has no {what} format"))
            })
        }

        let name = self.name;
        Ok(Codec {
            field_infos: require(self.field_infos, &name, "field infos")?,
            stored_fields: require(self.stored_fields, &name, "stored fields")?,
            postings: require(self.postings, &name, "postings")?,
            live_docs: require(self.live_docs, &name, "live docs")?,
            term_vectors: require(self.term_vectors, &name, "term vectors")?,
            segment_info: require(self.segment_info, &name, "segment info")?,
            commit_log: require(self.commit_log, &name, "commit log")?,
            name,
        })
    }
}
