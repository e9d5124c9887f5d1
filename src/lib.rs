//! # Quiver
//!
//! A pluggable, segment-based inverted index storage engine for Rust.
//!
//! ## Features
//!
//! - Codecs bundling one format per index artifact, resolved by name
//! - Postings with four levels of indexing detail
//! - Stored fields, term vectors and generation-versioned deletions
//! - Two-phase commits with crash-tolerant commit discovery
//! - Segment merging with cooperative cancellation
//! - Pluggable storage backends

pub mod codec;
pub mod config;
pub mod error;
pub mod index;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::codec::Codec;
    pub use crate::codec::registry::CodecRegistry;
    pub use crate::config::IndexConfig;
    pub use crate::error::{QuiverError, Result};
    pub use crate::index::{
        AnalyzedDocument, AnalyzedField, FieldType, IndexReader, SegmentInfos, SegmentMerger,
        SegmentReader, SegmentWriter,
    };
    pub use crate::storage::Storage;
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
