//! The commit log: `segments_N` files listing the segments of one commit
//! point, and the discovery of the newest readable generation.
//!
//! A commit is written in two steps. [`CommitLogFormat::write_pending`]
//! writes the body of `segments_N` but not its footer, so a reader that
//! verifies checksums cannot use the file yet. [`PendingCommit::finish`]
//! appends the footer and publishes the generation;
//! [`PendingCommit::rollback`] removes the partial file.

use std::collections::BTreeMap;
use std::io::{Read, Seek};

use crate::codec::codec_util;
use crate::error::{QuiverError, Result};
use crate::index::file_names::{self, SEGMENTS_GEN};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IoContext, Storage, StorageOutput};

/// Format marker of `segments.gen`.
const SEGMENTS_GEN_FORMAT: u32 = -2i32 as u32;

/// One segment as recorded in a commit point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSegment {
    pub name: String,
    /// Codec that wrote the segment; selects the formats used to open it.
    pub codec: String,
    /// Deletion generation, `-1` when the segment has no deletions.
    pub del_gen: i64,
    pub del_count: u32,
}

/// Raw content of one `segments_N` file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitPoint {
    /// Incremented on every change to the segment list.
    pub version: u64,
    /// Source of new segment names.
    pub counter: u64,
    pub segments: Vec<CommitSegment>,
    pub user_data: BTreeMap<String, String>,
}

/// A `segments_N` file whose body is written but whose footer is not.
pub struct PendingCommit {
    generation: u64,
    file_name: String,
    output: StructWriter<Box<dyn StorageOutput>>,
}

impl PendingCommit {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Append the footer and close the file, making the generation visible.
    pub fn finish(self) -> Result<String> {
        codec_util::finish_output(self.output)?;
        Ok(self.file_name)
    }

    /// Close and delete the partial file.
    pub fn rollback(self, storage: &dyn Storage) {
        let PendingCommit {
            file_name, output, ..
        } = self;
        if let Err(e) = output.close() {
            log::debug!("Failed to close pending commit {file_name}: {e}");
        }
        if storage.file_exists(&file_name) {
            if let Err(e) = storage.delete_file(&file_name) {
                log::warn!("Failed to delete pending commit {file_name}: {e}");
            }
        }
    }
}

impl std::fmt::Debug for PendingCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCommit")
            .field("generation", &self.generation)
            .field("file_name", &self.file_name)
            .finish()
    }
}

/// Reads and writes commit points.
pub trait CommitLogFormat: Send + Sync {
    /// Write the body of `segments_<generation>` without its footer.
    fn write_pending(
        &self,
        storage: &dyn Storage,
        generation: u64,
        commit: &CommitPoint,
    ) -> Result<PendingCommit>;

    /// Read and verify `segments_<generation>`.
    fn read(&self, storage: &dyn Storage, generation: u64) -> Result<CommitPoint>;

    /// How many generations past the newest known one discovery probes.
    fn gen_lookahead_count(&self) -> u32;
}

/// The standard `segments_N` format.
#[derive(Debug, Clone)]
pub struct Quiver10CommitLogFormat {
    gen_lookahead_count: u32,
}

impl Quiver10CommitLogFormat {
    pub const CODEC_NAME: &'static str = "segments";
    pub const VERSION_START: u32 = 0;
    pub const VERSION_CURRENT: u32 = 0;

    pub fn new(gen_lookahead_count: u32) -> Self {
        Quiver10CommitLogFormat {
            gen_lookahead_count,
        }
    }

    fn read_segment<R: Read + Seek>(input: &mut StructReader<R>) -> Result<CommitSegment> {
        Ok(CommitSegment {
            name: input.read_string()?,
            codec: input.read_string()?,
            del_gen: input.read_zigzag()?,
            del_count: input.read_varint_u32()?,
        })
    }
}

impl Default for Quiver10CommitLogFormat {
    fn default() -> Self {
        Quiver10CommitLogFormat::new(10)
    }
}

impl CommitLogFormat for Quiver10CommitLogFormat {
    fn write_pending(
        &self,
        storage: &dyn Storage,
        generation: u64,
        commit: &CommitPoint,
    ) -> Result<PendingCommit> {
        let file_name = file_names::segments_file_name(generation);
        let mut output = codec_util::create_output(
            storage,
            &file_name,
            Self::CODEC_NAME,
            Self::VERSION_CURRENT,
            IoContext::Default,
        )?;

        let body = (|| -> Result<()> {
            output.write_u64(commit.version)?;
            output.write_varint(commit.counter)?;
            output.write_varint(commit.segments.len() as u64)?;
            for segment in &commit.segments {
                output.write_string(&segment.name)?;
                output.write_string(&segment.codec)?;
                output.write_zigzag(segment.del_gen)?;
                output.write_varint(segment.del_count as u64)?;
            }
            output.write_varint(commit.user_data.len() as u64)?;
            for (key, value) in &commit.user_data {
                output.write_string(key)?;
                output.write_string(value)?;
            }
            Ok(())
        })();

        if let Err(e) = body {
            drop(output);
            if let Err(delete_error) = storage.delete_file(&file_name) {
                log::debug!("Failed to delete partial {file_name}: {delete_error}");
            }
            return Err(e);
        }

        log::debug!("Prepared commit {file_name}");
        Ok(PendingCommit {
            generation,
            file_name,
            output,
        })
    }

    fn read(&self, storage: &dyn Storage, generation: u64) -> Result<CommitPoint> {
        let file_name = file_names::segments_file_name(generation);
        let mut input = codec_util::read_checked(storage, &file_name, IoContext::ReadOnce)?;
        codec_util::check_header(
            &mut input,
            Self::CODEC_NAME,
            Self::VERSION_START,
            Self::VERSION_CURRENT,
        )?;

        let version = input.read_u64()?;
        let counter = input.read_varint()?;
        let count = input.read_varint_u32()?;
        let mut segments = Vec::with_capacity(count as usize);
        for _ in 0..count {
            segments.push(Self::read_segment(&mut input)?);
        }
        let user_data_count = input.read_varint_u32()?;
        let mut user_data = BTreeMap::new();
        for _ in 0..user_data_count {
            let key = input.read_string()?;
            let value = input.read_string()?;
            user_data.insert(key, value);
        }

        if input.remaining() != 0 {
            return Err(QuiverError::corrupt_index(format!(
                "{file_name}: {} trailing bytes",
                input.remaining()
            )));
        }

        Ok(CommitPoint {
            version,
            counter,
            segments,
            user_data,
        })
    }

    fn gen_lookahead_count(&self) -> u32 {
        self.gen_lookahead_count
    }
}

/// Read `segments.gen`. Returns `None` unless the file is well formed and
/// both copies of the generation agree.
pub fn read_segments_gen(storage: &dyn Storage) -> Option<u64> {
    let result = (|| -> Result<Option<u64>> {
        let input = storage.open_input(SEGMENTS_GEN, IoContext::ReadOnce)?;
        let mut input = StructReader::new(input)?;
        let format = input.read_u32()?;
        if format != SEGMENTS_GEN_FORMAT {
            return Ok(None);
        }
        let first = input.read_u64()?;
        let second = input.read_u64()?;
        Ok((first == second).then_some(first))
    })();

    match result {
        Ok(generation) => generation,
        Err(e) => {
            log::debug!("Ignoring unreadable {SEGMENTS_GEN}: {e}");
            None
        }
    }
}

/// Record `generation` in `segments.gen`. Failures are logged and ignored.
pub fn write_segments_gen(storage: &dyn Storage, generation: u64) {
    let result = (|| -> Result<()> {
        let output = storage.create_output(SEGMENTS_GEN, IoContext::Default)?;
        let mut output = StructWriter::new(output);
        output.write_u32(SEGMENTS_GEN_FORMAT)?;
        output.write_u64(generation)?;
        output.write_u64(generation)?;
        output.close()?;
        storage.sync(&[SEGMENTS_GEN.to_string()])
    })();

    if let Err(e) = result {
        log::warn!("Failed to write {SEGMENTS_GEN} for generation {generation}: {e}");
    }
}

/// Newest generation known from the listing and from `segments.gen`.
pub fn current_generation(storage: &dyn Storage) -> Result<Option<u64>> {
    let files = storage.list_files()?;
    let listed = file_names::last_commit_generation(&files);
    let recorded = read_segments_gen(storage);
    Ok(listed.max(recorded))
}

/// A generation is worth retrying when its file is missing or was torn
/// before the footer was written. A sealed file that fails to read is real
/// corruption.
fn is_transient(storage: &dyn Storage, generation: u64, error: &QuiverError) -> bool {
    if error.is_not_found() {
        return true;
    }
    error.is_corruption()
        && !codec_util::has_footer(storage, &file_names::segments_file_name(generation))
}

/// Run `read` against the newest readable commit generation.
///
/// A generation that is missing or has no footer may belong to a writer in
/// the middle of a commit. Discovery re-lists the storage, then tries up to
/// `gen_lookahead_count` generations past the last one tried, and finally
/// falls back to the generation before the one first discovered. Any other
/// error, including a checksum failure in a sealed file, is returned as is.
pub fn find_segments_file<T, F>(
    storage: &dyn Storage,
    gen_lookahead_count: u32,
    mut read: F,
) -> Result<T>
where
    F: FnMut(u64) -> Result<T>,
{
    let Some(first_generation) = current_generation(storage)? else {
        return Err(QuiverError::index_not_found(format!(
            "no segments file found in {storage:?}"
        )));
    };

    let mut generation = first_generation;
    let mut lookahead = 0u32;
    let mut first_error = None;

    loop {
        match read(generation) {
            Ok(value) => return Ok(value),
            Err(e) if is_transient(storage, generation, &e) => {
                log::debug!("Commit generation {generation} is not readable: {e}");
                first_error.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }

        if let Some(newer) = current_generation(storage)?.filter(|&g| g > generation) {
            log::debug!("Retrying with newer commit generation {newer}");
            generation = newer;
            continue;
        }

        if lookahead < gen_lookahead_count {
            lookahead += 1;
            generation += 1;
            log::debug!(
                "Looking ahead to commit generation {generation} ({lookahead}/{gen_lookahead_count})"
            );
            continue;
        }

        break;
    }

    if first_generation > 0 {
        let previous = first_generation - 1;
        if storage.file_exists(&file_names::segments_file_name(previous)) {
            match read(previous) {
                Ok(value) => {
                    log::warn!(
                        "Commit generation {first_generation} is unreadable; using generation {previous}"
                    );
                    return Ok(value);
                }
                Err(e) => log::debug!("Previous commit generation {previous} is not readable: {e}"),
            }
        }
    }

    Err(first_error.unwrap_or_else(|| {
        QuiverError::index_not_found(format!("no readable segments file in {storage:?}"))
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;

    fn sample_commit() -> CommitPoint {
        let mut user_data = BTreeMap::new();
        user_data.insert("source".to_string(), "test".to_string());
        CommitPoint {
            version: 7,
            counter: 3,
            segments: vec![
                CommitSegment {
                    name: "_0".to_string(),
                    codec: "Quiver10".to_string(),
                    del_gen: -1,
                    del_count: 0,
                },
                CommitSegment {
                    name: "_2".to_string(),
                    codec: "Quiver10".to_string(),
                    del_gen: 4,
                    del_count: 2,
                },
            ],
            user_data,
        }
    }

    #[test]
    fn test_write_read_round_trip() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        let pending = format.write_pending(&storage, 1, &sample_commit()).unwrap();
        assert_eq!(pending.file_name(), "segments_1");
        assert_eq!(pending.finish().unwrap(), "segments_1");

        assert_eq!(format.read(&storage, 1).unwrap(), sample_commit());
    }

    #[test]
    fn test_pending_commit_is_unreadable() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        let pending = format.write_pending(&storage, 1, &sample_commit()).unwrap();
        // Publish the body without a footer, as a crashed writer would.
        drop(pending);

        let err = format.read(&storage, 1).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_rollback_removes_file() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        let pending = format.write_pending(&storage, 2, &sample_commit()).unwrap();
        pending.rollback(&storage);
        assert!(!storage.file_exists("segments_2"));
    }

    #[test]
    fn test_segments_gen_requires_agreeing_copies() {
        let storage = MemoryStorage::new();
        assert_eq!(read_segments_gen(&storage), None);

        write_segments_gen(&storage, 5);
        assert_eq!(read_segments_gen(&storage), Some(5));

        let mut data = storage.read_all(SEGMENTS_GEN).unwrap();
        data[12] ^= 0xff;
        storage.overwrite(SEGMENTS_GEN, data);
        assert_eq!(read_segments_gen(&storage), None);
    }

    #[test]
    fn test_find_missing_index() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();
        let err = find_segments_file(&storage, 10, |g| format.read(&storage, g)).unwrap_err();
        assert!(matches!(err, QuiverError::IndexNotFound(_)));
    }

    #[test]
    fn test_find_falls_back_past_partial_commit() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        format
            .write_pending(&storage, 1, &sample_commit())
            .unwrap()
            .finish()
            .unwrap();
        let mut newer = sample_commit();
        newer.version = 8;
        drop(format.write_pending(&storage, 2, &newer).unwrap());

        let found = find_segments_file(&storage, 3, |g| {
            format.read(&storage, g).map(|commit| (g, commit))
        })
        .unwrap();
        assert_eq!(found.0, 1);
        assert_eq!(found.1.version, 7);
    }

    #[test]
    fn test_find_looks_ahead_of_stale_pointer() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        format
            .write_pending(&storage, 3, &sample_commit())
            .unwrap()
            .finish()
            .unwrap();
        // segments.gen points past the newest commit and nothing is listed
        // there; the read of generation 4 fails, and the previous generation
        // is the published one.
        write_segments_gen(&storage, 4);

        let mut tried = Vec::new();
        let found = find_segments_file(&storage, 2, |g| {
            tried.push(g);
            format.read(&storage, g).map(|_| g)
        })
        .unwrap();
        assert_eq!(found, 3);
        assert_eq!(tried, vec![4, 5, 6, 3]);
    }

    #[test]
    fn test_find_reports_corrupt_sealed_commit() {
        let storage = MemoryStorage::new();
        let format = Quiver10CommitLogFormat::default();

        for generation in 1..=2 {
            format
                .write_pending(&storage, generation, &sample_commit())
                .unwrap()
                .finish()
                .unwrap();
        }
        let mut data = storage.read_all("segments_2").unwrap();
        data[20] ^= 0xff;
        storage.overwrite("segments_2", data);
        assert!(codec_util::has_footer(&storage, "segments_2"));

        let mut tried = Vec::new();
        let err = find_segments_file(&storage, 3, |g| {
            tried.push(g);
            format.read(&storage, g)
        })
        .unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("checksum failed"));
        assert_eq!(tried, vec![2]);
    }
}
