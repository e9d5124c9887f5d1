//! The in-memory commit log: the segments of the index and the protocol
//! that publishes them as a new `segments_N` generation.
//!
//! # Commit protocol
//!
//! ```text
//! changed()         mark the segment list as modified
//! prepare_commit()  sync segment files, write segments_N without footer
//! finish_commit()   append the footer, sync, record segments.gen
//! rollback_commit() delete the partial segments_N
//! ```
//!
//! A generation handed out by `prepare_commit` is never reused, even when
//! the commit is rolled back.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use crate::codec::Codec;
use crate::codec::commit_log::{self, CommitPoint, CommitSegment, PendingCommit};
use crate::codec::registry::CodecRegistry;
use crate::error::{QuiverError, Result};
use crate::index::file_names;
use crate::index::segment_commit_info::SegmentCommitInfo;
use crate::storage::{IoContext, Storage};

/// The list of segments making up one view of the index.
#[derive(Debug)]
pub struct SegmentInfos {
    segments: Vec<SegmentCommitInfo>,
    user_data: BTreeMap<String, String>,
    /// Generation this view was read from or last committed as.
    generation: Option<u64>,
    /// Highest generation read, committed or handed to a pending commit.
    last_generation: Option<u64>,
    version: u64,
    counter: u64,
    last_committed_version: Option<u64>,
    pending: Option<PendingCommit>,
    codec: Arc<Codec>,
}

impl SegmentInfos {
    /// An empty, never committed segment list whose commits are written
    /// with `codec`'s commit log format.
    pub fn new(codec: Arc<Codec>) -> Self {
        SegmentInfos {
            segments: Vec::new(),
            user_data: BTreeMap::new(),
            generation: None,
            last_generation: None,
            version: 0,
            counter: 0,
            last_committed_version: None,
            pending: None,
            codec,
        }
    }

    /// Read the newest readable commit.
    pub fn read_latest(storage: &dyn Storage, registry: &CodecRegistry) -> Result<Self> {
        let format = registry.default_codec()?.commit_log_format()?;
        commit_log::find_segments_file(storage, format.gen_lookahead_count(), |generation| {
            Self::read_generation(storage, registry, generation)
        })
    }

    /// Read commit `generation` and the descriptor of every segment it lists.
    pub fn read_generation(
        storage: &dyn Storage,
        registry: &CodecRegistry,
        generation: u64,
    ) -> Result<Self> {
        let codec = registry.default_codec()?;
        let commit = codec.commit_log_format()?.read(storage, generation)?;

        let mut segments = Vec::with_capacity(commit.segments.len());
        for segment in &commit.segments {
            let segment_codec = registry.lookup(&segment.codec)?;
            let info = segment_codec.segment_info_format()?.read(
                storage,
                &segment.name,
                IoContext::ReadOnce,
            )?;
            if info.codec != segment.codec {
                return Err(QuiverError::corrupt_index(format!(
                    "segment {} is recorded with codec {} but its descriptor says {}",
                    segment.name, segment.codec, info.codec
                )));
            }
            segments.push(SegmentCommitInfo::with_deletes(
                Arc::new(info),
                segment.del_count,
                segment.del_gen,
            )?);
        }

        log::debug!(
            "Read commit generation {generation} with {} segments (version {})",
            segments.len(),
            commit.version
        );
        Ok(SegmentInfos {
            segments,
            user_data: commit.user_data,
            generation: Some(generation),
            last_generation: Some(generation),
            version: commit.version,
            counter: commit.counter,
            last_committed_version: Some(commit.version),
            pending: None,
            codec,
        })
    }

    pub fn segments(&self) -> &[SegmentCommitInfo] {
        &self.segments
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentCommitInfo> {
        self.segments.iter().find(|s| s.info.name == name)
    }

    /// Mutable access, e.g. to write deletions. Call
    /// [`changed`](Self::changed) afterwards.
    pub fn segment_mut(&mut self, name: &str) -> Option<&mut SegmentCommitInfo> {
        self.segments.iter_mut().find(|s| s.info.name == name)
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Documents across all segments, deleted ones included.
    pub fn total_max_doc(&self) -> u64 {
        self.segments.iter().map(|s| s.info.doc_count as u64).sum()
    }

    /// Live documents across all segments.
    pub fn total_num_docs(&self) -> u64 {
        self.segments.iter().map(|s| s.num_docs() as u64).sum()
    }

    /// Append a segment. The list is not marked changed.
    pub fn add(&mut self, info: SegmentCommitInfo) -> Result<()> {
        if self.segment(&info.info.name).is_some() {
            return Err(QuiverError::invalid_operation(format!(
                "segment {} is already listed",
                info.info.name
            )));
        }
        self.segments.push(info);
        Ok(())
    }

    /// Remove a segment. The list is not marked changed.
    pub fn remove(&mut self, name: &str) -> Option<SegmentCommitInfo> {
        let index = self.segments.iter().position(|s| s.info.name == name)?;
        Some(self.segments.remove(index))
    }

    /// Replace the merged segments by their merge result, which takes the
    /// place of the first of them.
    pub fn apply_merge(&mut self, merged: &[String], result: SegmentCommitInfo) -> Result<()> {
        let Some(insert_at) = self
            .segments
            .iter()
            .position(|s| merged.contains(&s.info.name))
        else {
            return Err(QuiverError::invalid_operation(format!(
                "none of the merged segments {merged:?} is listed"
            )));
        };
        if let Some(missing) = merged.iter().find(|name| self.segment(name).is_none()) {
            return Err(QuiverError::invalid_operation(format!(
                "merged segment {missing} is not listed"
            )));
        }

        self.segments.retain(|s| !merged.contains(&s.info.name));
        self.segments.insert(insert_at.min(self.segments.len()), result);
        self.changed();
        Ok(())
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn set_user_data(&mut self, user_data: BTreeMap<String, String>) {
        self.user_data = user_data;
        self.changed();
    }

    /// Mark the segment list as modified so the next commit writes a new
    /// generation.
    pub fn changed(&mut self) {
        self.version += 1;
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    pub fn generation(&self) -> Option<u64> {
        self.generation
    }

    pub fn last_generation(&self) -> Option<u64> {
        self.last_generation
    }

    /// Name of the commit file this view was read from or committed as.
    pub fn segments_file_name(&self) -> Option<String> {
        self.generation.map(file_names::segments_file_name)
    }

    /// A fresh segment name, `_` followed by the counter in base 36.
    pub fn new_segment_name(&mut self) -> String {
        let name = format!("_{}", file_names::to_base36(self.counter));
        self.counter += 1;
        name
    }

    pub fn has_pending_commit(&self) -> bool {
        self.pending.is_some()
    }

    /// Every file referenced by this view.
    pub fn files(&self, include_segments_file: bool) -> BTreeSet<String> {
        let mut files = BTreeSet::new();
        if include_segments_file {
            files.extend(self.segments_file_name());
        }
        for segment in &self.segments {
            files.extend(segment.files());
        }
        files
    }

    /// One past both this view's last generation and the newest one in
    /// `storage`.
    fn next_generation(&self, storage: &dyn Storage) -> Result<u64> {
        let on_disk = commit_log::current_generation(storage)?;
        Ok(self.last_generation.max(on_disk).map_or(1, |g| g + 1))
    }

    fn commit_point(&self) -> CommitPoint {
        CommitPoint {
            version: self.version,
            counter: self.counter,
            segments: self
                .segments
                .iter()
                .map(|s| CommitSegment {
                    name: s.info.name.clone(),
                    codec: s.info.codec.clone(),
                    del_gen: s.del_gen(),
                    del_count: s.del_count(),
                })
                .collect(),
            user_data: self.user_data.clone(),
        }
    }

    /// Sync the segment files and write the next `segments_N` without its
    /// footer.
    ///
    /// Returns `false` without writing anything when nothing changed since
    /// the last commit.
    pub fn prepare_commit(&mut self, storage: &dyn Storage) -> Result<bool> {
        if self.pending.is_some() {
            return Err(QuiverError::invalid_operation(
                "prepare_commit was already called",
            ));
        }
        if self.generation.is_some() && self.last_committed_version == Some(self.version) {
            log::debug!(
                "Skipping commit: version {} is already committed as generation {:?}",
                self.version,
                self.generation
            );
            return Ok(false);
        }

        let files: Vec<String> = self.files(false).into_iter().collect();
        storage.sync(&files)?;

        let generation = self.next_generation(storage)?;
        self.last_generation = Some(generation);
        let pending = self.codec.commit_log_format()?.write_pending(
            storage,
            generation,
            &self.commit_point(),
        )?;

        log::info!(
            "Prepared commit generation {generation} with {} segments",
            self.segments.len()
        );
        self.pending = Some(pending);
        Ok(true)
    }

    /// Publish the prepared commit.
    pub fn finish_commit(&mut self, storage: &dyn Storage) -> Result<()> {
        let pending = self.pending.take().ok_or_else(|| {
            QuiverError::invalid_operation("finish_commit called without prepare_commit")
        })?;
        let generation = pending.generation();
        let file_name = pending.file_name().to_string();

        let published = pending.finish().and_then(|name| storage.sync(&[name]));
        if let Err(e) = published {
            log::warn!("Commit generation {generation} failed: {e}");
            if storage.file_exists(&file_name) {
                if let Err(delete_error) = storage.delete_file(&file_name) {
                    log::warn!("Failed to delete {file_name}: {delete_error}");
                }
            }
            return Err(e);
        }

        self.generation = Some(generation);
        self.last_committed_version = Some(self.version);
        commit_log::write_segments_gen(storage, generation);

        log::info!("Committed generation {generation} (version {})", self.version);
        Ok(())
    }

    /// Discard the prepared commit. The generation stays consumed.
    pub fn rollback_commit(&mut self, storage: &dyn Storage) {
        if let Some(pending) = self.pending.take() {
            log::info!("Rolling back commit generation {}", pending.generation());
            pending.rollback(storage);
        }
    }

    /// Prepare and finish in one step.
    pub fn commit(&mut self, storage: &dyn Storage) -> Result<bool> {
        if !self.prepare_commit(storage)? {
            return Ok(false);
        }
        if let Err(e) = self.finish_commit(storage) {
            self.rollback_commit(storage);
            return Err(e);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::field_infos::FieldInfos;
    use crate::codec::segment_info::SegmentInfo;
    use crate::config::IndexConfig;
    use crate::storage::memory::MemoryStorage;

    fn write_segment(
        storage: &dyn Storage,
        codec: &Codec,
        name: &str,
        doc_count: u32,
    ) -> SegmentCommitInfo {
        let mut info = SegmentInfo::new(name, doc_count, codec.name());
        info.set_files(vec![format!("{name}.si")]).unwrap();
        codec
            .segment_info_format()
            .unwrap()
            .write(storage, &info, &FieldInfos::default(), IoContext::Default)
            .unwrap();
        SegmentCommitInfo::new(Arc::new(info))
    }

    fn setup() -> (MemoryStorage, CodecRegistry, Arc<Codec>) {
        let registry = CodecRegistry::with_config(&IndexConfig::default());
        let codec = registry.default_codec().unwrap();
        (MemoryStorage::new(), registry, codec)
    }

    #[test]
    fn test_commit_and_read_latest() {
        let (storage, registry, codec) = setup();
        let mut infos = SegmentInfos::new(codec.clone());
        let first = infos.new_segment_name();
        let second = infos.new_segment_name();
        assert_eq!((first.as_str(), second.as_str()), ("_0", "_1"));

        infos.add(write_segment(&storage, &codec, &first, 3)).unwrap();
        infos.add(write_segment(&storage, &codec, &second, 2)).unwrap();
        assert!(infos.add(write_segment(&storage, &codec, &second, 2)).is_err());
        infos.changed();
        assert!(infos.commit(&storage).unwrap());
        assert_eq!(infos.generation(), Some(1));
        assert!(storage.file_exists("segments_1"));
        assert!(storage.file_exists("segments.gen"));

        let read = SegmentInfos::read_latest(&storage, &registry).unwrap();
        assert_eq!(read.generation(), Some(1));
        assert_eq!(read.len(), 2);
        assert_eq!(read.counter(), 2);
        assert_eq!(read.total_max_doc(), 5);
        assert_eq!(read.segments()[0].info.name, "_0");
        assert!(read.files(true).contains("segments_1"));
    }

    #[test]
    fn test_unchanged_commit_is_noop() {
        let (storage, registry, codec) = setup();
        let mut infos = SegmentInfos::new(codec.clone());
        let name = infos.new_segment_name();
        infos.add(write_segment(&storage, &codec, &name, 1)).unwrap();
        infos.changed();
        infos.commit(&storage).unwrap();

        assert!(!infos.prepare_commit(&storage).unwrap());
        assert!(!infos.has_pending_commit());

        // Without changed() the new segment is not published.
        let other = infos.new_segment_name();
        infos.add(write_segment(&storage, &codec, &other, 1)).unwrap();
        assert!(!infos.commit(&storage).unwrap());
        assert_eq!(SegmentInfos::read_latest(&storage, &registry).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_keeps_previous_commit() {
        let (storage, registry, codec) = setup();
        let mut infos = SegmentInfos::new(codec.clone());
        let name = infos.new_segment_name();
        infos.add(write_segment(&storage, &codec, &name, 4)).unwrap();
        infos.changed();
        infos.commit(&storage).unwrap();

        let before = SegmentInfos::read_latest(&storage, &registry).unwrap();

        infos.remove(&name).unwrap();
        infos.changed();
        assert!(infos.prepare_commit(&storage).unwrap());
        assert!(infos.prepare_commit(&storage).is_err());
        infos.rollback_commit(&storage);
        assert!(!storage.file_exists("segments_2"));

        let after = SegmentInfos::read_latest(&storage, &registry).unwrap();
        assert_eq!(after.generation(), before.generation());
        assert_eq!(after.segments(), before.segments());

        // The rolled back generation is not reused.
        infos.commit(&storage).unwrap();
        assert_eq!(infos.generation(), Some(3));
        assert!(SegmentInfos::read_latest(&storage, &registry).unwrap().is_empty());
    }

    #[test]
    fn test_fresh_infos_commit_past_existing_generations() {
        let (storage, registry, codec) = setup();
        let mut infos = SegmentInfos::new(codec.clone());
        for _ in 0..3 {
            infos.changed();
            infos.commit(&storage).unwrap();
        }
        assert_eq!(infos.generation(), Some(3));
        let third = storage.read_all("segments_3").unwrap();

        let mut fresh = SegmentInfos::new(codec);
        let mut user_data = BTreeMap::new();
        user_data.insert("k".to_string(), "v".to_string());
        fresh.set_user_data(user_data.clone());
        assert!(fresh.commit(&storage).unwrap());
        assert_eq!(fresh.generation(), Some(4));
        assert_eq!(storage.read_all("segments_3"), Some(third));

        let latest = SegmentInfos::read_latest(&storage, &registry).unwrap();
        assert_eq!(latest.generation(), Some(4));
        assert_eq!(latest.user_data(), &user_data);
    }

    #[test]
    fn test_finish_without_prepare() {
        let (storage, _, codec) = setup();
        let mut infos = SegmentInfos::new(codec);
        assert!(infos.finish_commit(&storage).is_err());
    }

    #[test]
    fn test_apply_merge() {
        let (storage, _, codec) = setup();
        let mut infos = SegmentInfos::new(codec.clone());
        for doc_count in [1, 2, 3] {
            let name = infos.new_segment_name();
            infos.add(write_segment(&storage, &codec, &name, doc_count)).unwrap();
        }
        let version = infos.version();
        let merged = write_segment(&storage, &codec, "_3", 3);
        infos
            .apply_merge(&["_1".to_string(), "_2".to_string()], merged)
            .unwrap();
        let names: Vec<&str> = infos.segments().iter().map(|s| s.info.name.as_str()).collect();
        assert_eq!(names, vec!["_0", "_3"]);
        assert_eq!(infos.version(), version + 1);

        let again = write_segment(&storage, &codec, "_4", 1);
        assert!(infos.apply_merge(&["_9".to_string()], again).is_err());
    }
}
