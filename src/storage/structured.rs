//! Structured file I/O for binary data serialization.
//!
//! [`StructWriter`] keeps a running CRC32 over every byte it writes so the
//! codec footer can be appended without re-reading the file.
//! [`StructReader`] works over any seekable source: a [`StorageInput`] for
//! large files read lazily, or an in-memory cursor for small files that were
//! verified up front.
//!
//! [`StorageInput`]: crate::storage::StorageInput

use std::io::{Read, Seek, SeekFrom};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{QuiverError, Result};
use crate::storage::StorageOutput;
use crate::util::varint;

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
}

impl<W: StorageOutput> std::fmt::Debug for StructWriter<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StructWriter")
            .field("position", &self.position)
            .finish()
    }
}

impl<W: StorageOutput> StructWriter<W> {
    /// Create a new structured file writer.
    pub fn new(writer: W) -> Self {
        StructWriter {
            writer,
            hasher: Hasher::new(),
            position: 0,
        }
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.update_checksum(&[value]);
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.update_checksum(&value.to_le_bytes());
        Ok(())
    }

    /// Write a i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.write_u64(value as u64)
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = varint::encode_u64(value);
        self.write_raw(&encoded)
    }

    /// Write a zig-zag encoded variable-length signed integer.
    pub fn write_zigzag(&mut self, value: i64) -> Result<()> {
        self.write_varint(varint::zigzag_encode(value))
    }

    /// Write a f32 value (little-endian).
    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.write_u32(value.to_bits())
    }

    /// Write a f64 value (little-endian).
    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.write_u64(value.to_bits())
    }

    /// Write a string with length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.write_raw(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.writer.write_all(value)?;
        self.update_checksum(value);
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CRC32 of every byte written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    fn update_checksum(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Flush, sync and close the underlying output.
    ///
    /// Callers that need the output to carry a codec footer write it first
    /// (see `codec::codec_util::write_footer`).
    pub fn close(mut self) -> Result<()> {
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
#[derive(Debug)]
pub struct StructReader<R: Read + Seek> {
    reader: R,
    position: u64,
    file_size: u64,
}

impl<R: Read + Seek> StructReader<R> {
    /// Create a new structured file reader positioned at the start.
    pub fn new(mut reader: R) -> Result<Self> {
        let file_size = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;
        Ok(StructReader {
            reader,
            position: 0,
            file_size,
        })
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self.reader.read_u8()?;
        self.position += 1;
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.position += 4;
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.position += 8;
        Ok(value)
    }

    /// Read a i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_u64()? as i64)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0;
        loop {
            let byte = self.read_u8()?;
            if shift >= 64 {
                return Err(QuiverError::corrupt_index("VarInt overflow"));
            }
            value |= ((byte & 0x7F) as u64) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    /// Read a variable-length integer that must fit in a u32.
    pub fn read_varint_u32(&mut self) -> Result<u32> {
        let value = self.read_varint()?;
        u32::try_from(value)
            .map_err(|_| QuiverError::corrupt_index(format!("VarInt {value} does not fit in u32")))
    }

    /// Read a zig-zag encoded variable-length signed integer.
    pub fn read_zigzag(&mut self) -> Result<i64> {
        Ok(varint::zigzag_decode(self.read_varint()?))
    }

    /// Read a f32 value (little-endian).
    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_bits(self.read_u32()?))
    }

    /// Read a f64 value (little-endian).
    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_bits(self.read_u64()?))
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes)
            .map_err(|e| QuiverError::corrupt_index(format!("Invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()?;
        self.read_raw(self.checked_len(length)?)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        let mut bytes = vec![0u8; self.checked_len(length as u64)?];
        self.reader.read_exact(&mut bytes)?;
        self.position += length as u64;
        Ok(bytes)
    }

    /// Skip over a length-prefixed byte string without decoding it.
    pub fn skip_bytes(&mut self) -> Result<()> {
        let length = self.read_varint()?;
        let length = self.checked_len(length)?;
        self.seek(self.position + length as u64)
    }

    /// Move to an absolute position.
    pub fn seek(&mut self, position: u64) -> Result<()> {
        if position > self.file_size {
            return Err(QuiverError::corrupt_index(format!(
                "Seek to {position} past end of file ({} bytes)",
                self.file_size
            )));
        }
        self.reader.seek(SeekFrom::Start(position))?;
        self.position = position;
        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Bytes left before the end of the file.
    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.position)
    }

    /// Access the underlying reader.
    pub fn get_ref(&self) -> &R {
        &self.reader
    }

    // Lengths come from the file itself; a damaged length must not trigger a
    // huge allocation.
    fn checked_len(&self, length: u64) -> Result<usize> {
        if length > self.remaining() {
            return Err(QuiverError::corrupt_index(format!(
                "Length {length} exceeds remaining {} bytes",
                self.remaining()
            )));
        }
        Ok(length as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{IoContext, Storage};
    use std::io::Cursor;

    #[test]
    fn test_struct_write_read() {
        let storage = MemoryStorage::new();

        let output = storage.create_output("test.struct", IoContext::Default).unwrap();
        let mut writer = StructWriter::new(output);

        writer.write_u8(42).unwrap();
        writer.write_u32(12345).unwrap();
        writer.write_u64(9876543210).unwrap();
        writer.write_varint(300).unwrap();
        writer.write_zigzag(-1).unwrap();
        writer.write_f32(std::f32::consts::PI).unwrap();
        writer.write_f64(std::f64::consts::E).unwrap();
        writer.write_string("Hello, World!").unwrap();
        writer.write_bytes(&[1, 2, 3]).unwrap();
        let position = writer.position();
        writer.close().unwrap();

        assert_eq!(storage.file_size("test.struct").unwrap(), position);

        let input = storage.open_input("test.struct", IoContext::Default).unwrap();
        let mut reader = StructReader::new(input).unwrap();

        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u32().unwrap(), 12345);
        assert_eq!(reader.read_u64().unwrap(), 9876543210);
        assert_eq!(reader.read_varint().unwrap(), 300);
        assert_eq!(reader.read_zigzag().unwrap(), -1);
        assert_eq!(reader.read_f32().unwrap(), std::f32::consts::PI);
        assert_eq!(reader.read_f64().unwrap(), std::f64::consts::E);
        assert_eq!(reader.read_string().unwrap(), "Hello, World!");
        assert_eq!(reader.read_bytes().unwrap(), vec![1, 2, 3]);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_checksum_covers_all_bytes() {
        let storage = MemoryStorage::new();
        let output = storage.create_output("crc", IoContext::Default).unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_raw(b"first").unwrap();
        writer.write_raw(b"second").unwrap();

        assert_eq!(writer.checksum(), crc32fast::hash(b"firstsecond"));
    }

    #[test]
    fn test_seek_and_skip() {
        let mut data = Vec::new();
        varint::write_u64(&mut data, 3).unwrap();
        data.extend_from_slice(b"abc");
        data.push(7);

        let mut reader = StructReader::new(Cursor::new(data)).unwrap();
        reader.skip_bytes().unwrap();
        assert_eq!(reader.read_u8().unwrap(), 7);

        reader.seek(1).unwrap();
        assert_eq!(reader.read_raw(3).unwrap(), b"abc");
        assert!(reader.seek(100).is_err());
    }

    #[test]
    fn test_damaged_length_is_corruption() {
        let mut data = Vec::new();
        varint::write_u64(&mut data, 1_000_000).unwrap();

        let mut reader = StructReader::new(Cursor::new(data)).unwrap();
        assert!(reader.read_bytes().unwrap_err().is_corruption());
    }
}
