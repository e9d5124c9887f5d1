//! Variable-length integer encoding utilities.
//!
//! Unsigned values use LEB128 (7 bits per byte, high bit = continuation).
//! Signed values, which only appear for the `-1` "not tracked" sentinels, are
//! zig-zag mapped first so small negatives stay short.

use std::io::{Read, Write};

use byteorder::ReadBytesExt;

use crate::error::{QuiverError, Result};

/// Encode a u64 value using variable-length encoding.
pub fn encode_u64(value: u64) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(10);
    let mut val = value;

    loop {
        let mut byte = (val & 0x7F) as u8;
        val >>= 7;

        if val != 0 {
            byte |= 0x80; // Set continuation bit
        }

        bytes.push(byte);

        if val == 0 {
            break;
        }
    }

    bytes
}

/// Decode a u64 value from the front of `bytes`.
///
/// Returns the value and the number of bytes consumed.
pub fn decode_u64(bytes: &[u8]) -> Result<(u64, usize)> {
    let mut result = 0u64;
    let mut shift = 0;

    for (i, &byte) in bytes.iter().enumerate() {
        if shift >= 64 {
            return Err(QuiverError::corrupt_index("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok((result, i + 1));
        }

        shift += 7;
    }

    Err(QuiverError::corrupt_index("Incomplete VarInt"))
}

/// Write a variable-length encoded u64 to a writer.
pub fn write_u64<W: Write + ?Sized>(writer: &mut W, value: u64) -> Result<usize> {
    let bytes = encode_u64(value);
    writer.write_all(&bytes)?;
    Ok(bytes.len())
}

/// Write a variable-length encoded u32 to a writer.
pub fn write_u32<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<usize> {
    write_u64(writer, value as u64)
}

/// Read a variable-length encoded u64 from a reader.
pub fn read_u64<R: Read + ?Sized>(reader: &mut R) -> Result<u64> {
    let mut result = 0u64;
    let mut shift = 0;

    loop {
        let byte = reader.read_u8()?;

        if shift >= 64 {
            return Err(QuiverError::corrupt_index("VarInt overflow"));
        }

        result |= ((byte & 0x7F) as u64) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

/// Read a variable-length encoded u32 from a reader.
pub fn read_u32<R: Read + ?Sized>(reader: &mut R) -> Result<u32> {
    let value = read_u64(reader)?;
    u32::try_from(value)
        .map_err(|_| QuiverError::corrupt_index(format!("VarInt {value} does not fit in u32")))
}

/// Map a signed value onto an unsigned one: 0, -1, 1, -2, ... -> 0, 1, 2, 3, ...
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

/// Inverse of [`zigzag_encode`].
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// Write a zig-zag encoded i64 to a writer.
pub fn write_i64<W: Write + ?Sized>(writer: &mut W, value: i64) -> Result<usize> {
    write_u64(writer, zigzag_encode(value))
}

/// Read a zig-zag encoded i64 from a reader.
pub fn read_i64<R: Read + ?Sized>(reader: &mut R) -> Result<i64> {
    Ok(zigzag_decode(read_u64(reader)?))
}
