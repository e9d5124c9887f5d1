//! Deterministic naming of index files.
//!
//! Fixed artifacts are named `<segment>.<ext>`; generation-versioned ones are
//! `<segment>_<gen>.<ext>` and the commit log uses `segments_<gen>`.
//! Generations are rendered in base 36.

use crate::error::{QuiverError, Result};

/// Prefix of commit point files.
pub const SEGMENTS: &str = "segments";

/// Name of the generation pointer file.
pub const SEGMENTS_GEN: &str = "segments.gen";

/// Field metadata.
pub const FIELD_INFOS_EXTENSION: &str = "fnm";
/// Stored fields index.
pub const FIELDS_INDEX_EXTENSION: &str = "fdx";
/// Stored fields data.
pub const FIELDS_EXTENSION: &str = "fdt";
/// Term dictionary.
pub const TERMS_EXTENSION: &str = "tim";
/// Term index.
pub const TERMS_INDEX_EXTENSION: &str = "tip";
/// Document and frequency postings.
pub const FREQ_EXTENSION: &str = "frq";
/// Positions, payloads and offsets.
pub const PROX_EXTENSION: &str = "prx";
/// Term vectors index.
pub const VECTORS_INDEX_EXTENSION: &str = "tvx";
/// Term vectors per-document data.
pub const VECTORS_DOCUMENTS_EXTENSION: &str = "tvd";
/// Term vectors per-field data.
pub const VECTORS_FIELDS_EXTENSION: &str = "tvf";
/// Deleted documents.
pub const DELETES_EXTENSION: &str = "del";
/// Segment descriptor.
pub const SEGMENT_INFO_EXTENSION: &str = "si";

const BASE36_DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Render a value in base 36.
pub fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36_DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    // Only ASCII digits were pushed.
    digits.into_iter().map(char::from).collect()
}

/// Parse a base 36 value.
pub fn parse_base36(text: &str) -> Result<u64> {
    u64::from_str_radix(text, 36)
        .map_err(|e| QuiverError::invalid_argument(format!("Invalid base 36 value {text:?}: {e}")))
}

/// `<segment>.<ext>`
pub fn segment_file_name(segment: &str, extension: &str) -> String {
    format!("{segment}.{extension}")
}

/// Name of a generation-versioned file.
///
/// Returns `None` for the "no file" generation `-1`; generation `0` has no
/// suffix.
pub fn file_name_from_generation(base: &str, extension: &str, generation: i64) -> Option<String> {
    let mut name = match generation {
        g if g < 0 => return None,
        0 => base.to_string(),
        g => format!("{base}_{}", to_base36(g as u64)),
    };
    if !extension.is_empty() {
        name.push('.');
        name.push_str(extension);
    }
    Some(name)
}

/// `segments_<gen>`
pub fn segments_file_name(generation: u64) -> String {
    if generation == 0 {
        SEGMENTS.to_string()
    } else {
        format!("{SEGMENTS}_{}", to_base36(generation))
    }
}

/// Parse the generation out of a `segments_N` file name.
///
/// Returns `None` for names that are not commit point files (including
/// `segments.gen`).
pub fn generation_from_segments_file_name(name: &str) -> Option<u64> {
    if name == SEGMENTS {
        return Some(0);
    }
    let suffix = name.strip_prefix(SEGMENTS)?.strip_prefix('_')?;
    parse_base36(suffix).ok()
}

/// Highest commit generation among `files`, if any.
pub fn last_commit_generation<S: AsRef<str>>(files: &[S]) -> Option<u64> {
    files
        .iter()
        .filter_map(|name| generation_from_segments_file_name(name.as_ref()))
        .max()
}

/// The segment a file belongs to (`_3` for `_3.fdt` and `_3_1.del`).
pub fn parse_segment_name(file_name: &str) -> &str {
    let end = file_name
        .char_indices()
        .skip(1)
        .find(|(_, c)| *c == '.' || *c == '_')
        .map(|(i, _)| i)
        .unwrap_or(file_name.len());
    &file_name[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(10), "a");
        assert_eq!(to_base36(36), "10");
        assert_eq!(to_base36(1295), "zz");
        assert_eq!(parse_base36("zz").unwrap(), 1295);
        assert!(parse_base36("!").is_err());
    }

    #[test]
    fn test_generation_names() {
        assert_eq!(file_name_from_generation("_0", "del", -1), None);
        assert_eq!(file_name_from_generation("_0", "del", 0).unwrap(), "_0.del");
        assert_eq!(file_name_from_generation("_0", "del", 11).unwrap(), "_0_b.del");
        assert_eq!(segments_file_name(36), "segments_10");
    }

    #[test]
    fn test_parse_segments_generation() {
        assert_eq!(generation_from_segments_file_name("segments_a"), Some(10));
        assert_eq!(generation_from_segments_file_name("segments"), Some(0));
        assert_eq!(generation_from_segments_file_name("segments.gen"), None);
        assert_eq!(generation_from_segments_file_name("_0.fnm"), None);

        let files = ["_0.fnm", "segments_2", "segments_b", "segments.gen"];
        assert_eq!(last_commit_generation(&files), Some(11));
        assert_eq!(last_commit_generation::<&str>(&[]), None);
    }

    #[test]
    fn test_parse_segment_name() {
        assert_eq!(parse_segment_name("_3.fdt"), "_3");
        assert_eq!(parse_segment_name("_3_1.del"), "_3");
        assert_eq!(parse_segment_name("_a"), "_a");
    }
}
