//! Index module for Quiver.
//!
//! Segments and the commit log that ties them together: writing a segment
//! from analyzed documents, opening it again, merging several into one and
//! publishing the result as a new commit generation.

pub mod document;
pub mod file_names;
pub mod merge_state;
pub mod reader;
pub mod segment_commit_info;
pub mod segment_infos;
pub mod segment_merger;
pub mod segment_reader;
pub mod segment_writer;

// Re-export commonly used types
pub use document::{AnalyzedDocument, AnalyzedField, AnalyzedTerm, FieldType};
pub use merge_state::{DocMap, MergeAbortHandle, MergeState};
pub use reader::IndexReader;
pub use segment_commit_info::SegmentCommitInfo;
pub use segment_infos::SegmentInfos;
pub use segment_merger::SegmentMerger;
pub use segment_reader::SegmentReader;
pub use segment_writer::SegmentWriter;
