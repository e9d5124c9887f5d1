//! Codec headers, footers and checksum verification shared by every format.
//!
//! Layout of every artifact file:
//!
//! ```text
//! header: magic u32 | codec name (varint length + utf-8) | version u32
//! body:   format specific
//! footer: !magic u32 | algorithm u32 (0 = crc32) | checksum u64
//! ```
//!
//! The checksum covers every byte before the checksum field itself.

use std::io::{Cursor, Read, Seek, SeekFrom};

use crc32fast::Hasher;

use crate::error::{QuiverError, Result};
use crate::storage::structured::{StructReader, StructWriter};
use crate::storage::{IoContext, Storage, StorageInput, StorageOutput};
use crate::util::varint;

/// Magic number at the start of every codec file.
pub const CODEC_MAGIC: u32 = 0x3fd7_6c17;

/// Magic number at the start of every footer.
pub const FOOTER_MAGIC: u32 = !CODEC_MAGIC;

/// Size in bytes of the footer.
pub const FOOTER_LENGTH: u64 = 16;

const CHECKSUM_ALGORITHM_CRC32: u32 = 0;

/// Length in bytes of a header written for `codec`.
pub fn header_length(codec: &str) -> u64 {
    4 + varint::encode_u64(codec.len() as u64).len() as u64 + codec.len() as u64 + 4
}

/// Write a codec header.
pub fn write_header<W: StorageOutput>(
    output: &mut StructWriter<W>,
    codec: &str,
    version: u32,
) -> Result<()> {
    output.write_u32(CODEC_MAGIC)?;
    output.write_string(codec)?;
    output.write_u32(version)?;
    Ok(())
}

/// Read and validate a codec header, returning the stored version.
pub fn check_header<R: Read + Seek>(
    input: &mut StructReader<R>,
    codec: &str,
    min_version: u32,
    max_version: u32,
) -> Result<u32> {
    let magic = input.read_u32()?;
    if magic != CODEC_MAGIC {
        return Err(QuiverError::corrupt_index(format!(
            "codec header mismatch: actual header={magic:#x} vs expected header={CODEC_MAGIC:#x}"
        )));
    }

    let actual = input.read_string()?;
    if actual != codec {
        return Err(QuiverError::corrupt_index(format!(
            "codec mismatch: actual codec={actual} vs expected codec={codec}"
        )));
    }

    let version = input.read_u32()?;
    if version < min_version || version > max_version {
        return Err(QuiverError::corrupt_index(format!(
            "{codec}: version {version} is not in supported range [{min_version}, {max_version}]"
        )));
    }

    Ok(version)
}

/// Write the footer with the running checksum of `output`.
pub fn write_footer<W: StorageOutput>(output: &mut StructWriter<W>) -> Result<()> {
    output.write_u32(FOOTER_MAGIC)?;
    output.write_u32(CHECKSUM_ALGORITHM_CRC32)?;
    let checksum = output.checksum();
    output.write_u64(checksum as u64)?;
    Ok(())
}

/// Write the footer and close the output.
pub fn finish_output<W: StorageOutput>(mut output: StructWriter<W>) -> Result<()> {
    write_footer(&mut output)?;
    output.close()
}

/// Create a writer for `name` with a fresh header.
pub fn create_output(
    storage: &dyn Storage,
    name: &str,
    codec: &str,
    version: u32,
    context: IoContext,
) -> Result<StructWriter<Box<dyn StorageOutput>>> {
    let mut output = StructWriter::new(storage.create_output(name, context)?);
    write_header(&mut output, codec, version)?;
    Ok(output)
}

fn decode_footer(footer: &[u8]) -> Result<u64> {
    let mut reader = StructReader::new(Cursor::new(footer))?;
    let magic = reader.read_u32()?;
    if magic != FOOTER_MAGIC {
        return Err(QuiverError::corrupt_index(format!(
            "codec footer mismatch: actual footer={magic:#x} vs expected footer={FOOTER_MAGIC:#x}"
        )));
    }
    let algorithm = reader.read_u32()?;
    if algorithm != CHECKSUM_ALGORITHM_CRC32 {
        return Err(QuiverError::corrupt_index(format!(
            "codec footer mismatch: unknown checksum algorithm={algorithm}"
        )));
    }
    let checksum = reader.read_u64()?;
    if checksum >> 32 != 0 {
        return Err(QuiverError::corrupt_index(format!(
            "Illegal checksum value {checksum:#x}"
        )));
    }
    Ok(checksum)
}

/// Verify the footer of an in-memory copy of a whole file.
pub fn check_footer_bytes(data: &[u8], name: &str) -> Result<()> {
    if (data.len() as u64) < FOOTER_LENGTH {
        return Err(QuiverError::corrupt_index(format!(
            "{name}: file is too short ({} bytes) to contain a footer",
            data.len()
        )));
    }

    let footer_start = data.len() - FOOTER_LENGTH as usize;
    let expected = decode_footer(&data[footer_start..])?;
    let actual = crc32fast::hash(&data[..data.len() - 8]) as u64;
    if actual != expected {
        return Err(QuiverError::corrupt_index(format!(
            "{name}: checksum failed (actual={actual:#x} vs expected={expected:#x})"
        )));
    }
    Ok(())
}

/// Read a small file fully, verify its checksum and return a reader over the
/// body (everything before the footer).
pub fn read_checked(
    storage: &dyn Storage,
    name: &str,
    context: IoContext,
) -> Result<StructReader<Cursor<Vec<u8>>>> {
    let mut input = storage.open_input(name, context)?;
    let mut data = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut data)?;

    check_footer_bytes(&data, name)?;
    data.truncate(data.len() - FOOTER_LENGTH as usize);
    StructReader::new(Cursor::new(data))
}

/// Validate the footer of a large file without hashing it and return the
/// stored checksum. Leaves the input at an unspecified position.
pub fn retrieve_checksum(input: &mut dyn StorageInput, name: &str) -> Result<u64> {
    let size = input.size()?;
    if size < FOOTER_LENGTH {
        return Err(QuiverError::corrupt_index(format!(
            "{name}: file is too short ({size} bytes) to contain a footer"
        )));
    }
    input.seek(SeekFrom::Start(size - FOOTER_LENGTH))?;
    let mut footer = [0u8; FOOTER_LENGTH as usize];
    input.read_exact(&mut footer)?;
    decode_footer(&footer)
}

/// Whether `name` ends in a well formed footer. The checksum itself is not
/// verified, so a file that fails [`read_checked`] may still have one.
pub fn has_footer(storage: &dyn Storage, name: &str) -> bool {
    storage
        .open_input(name, IoContext::ReadOnce)
        .and_then(|mut input| retrieve_checksum(input.as_mut(), name))
        .is_ok()
}

/// Hash a whole file and compare against its footer.
///
/// Reads the entire file; used by `check_integrity` on large artifacts.
pub fn checksum_entire_file(input: &mut dyn StorageInput, name: &str) -> Result<u32> {
    let expected = retrieve_checksum(input, name)?;
    let size = input.size()?;

    input.seek(SeekFrom::Start(0))?;
    let mut hasher = Hasher::new();
    let mut remaining = size - 8;
    let mut buffer = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let chunk = remaining.min(buffer.len() as u64) as usize;
        input.read_exact(&mut buffer[..chunk])?;
        hasher.update(&buffer[..chunk]);
        remaining -= chunk as u64;
    }

    let actual = hasher.finalize();
    if actual as u64 != expected {
        return Err(QuiverError::corrupt_index(format!(
            "{name}: checksum failed (actual={actual:#x} vs expected={expected:#x})"
        )));
    }
    Ok(actual)
}

/// Open a large file, validate its header and footer structure, and return
/// a reader positioned right after the header.
pub fn open_checked_input(
    storage: &dyn Storage,
    name: &str,
    codec: &str,
    min_version: u32,
    max_version: u32,
    context: IoContext,
) -> Result<StructReader<Box<dyn StorageInput>>> {
    let mut input = storage.open_input(name, context)?;
    retrieve_checksum(input.as_mut(), name)?;
    input.seek(SeekFrom::Start(0))?;
    let mut reader = StructReader::new(input)?;
    check_header(&mut reader, codec, min_version, max_version)?;
    Ok(reader)
}
