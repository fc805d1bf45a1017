//! Checksummed structured I/O.
//!
//! [`StructWriter`] and [`StructReader`] read and write little-endian
//! primitives, varints and length-prefixed byte strings while accumulating a
//! CRC32 over everything that passes through them. The writer appends the
//! checksum when it is closed, and the reader checks it with
//! [`StructReader::verify_checksum`]. The TOC file is written this way.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, WhorlError};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{decode_u64, encode_u64};

/// A structured file writer for binary data.
pub struct StructWriter<W: StorageOutput> {
    writer: W,
    hasher: Hasher,
    position: u64,
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

    fn put(&mut self, bytes: &[u8]) -> Result<()> {
        self.writer.write_all(bytes)?;
        self.hasher.update(bytes);
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.put(&[value])
    }

    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f32(&mut self, value: f32) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    pub fn write_f64(&mut self, value: f64) -> Result<()> {
        self.put(&value.to_le_bytes())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        self.put(&encode_u64(value))
    }

    /// Write a string with a varint length prefix.
    pub fn write_string(&mut self, value: &str) -> Result<()> {
        self.write_bytes(value.as_bytes())
    }

    /// Write raw bytes with a varint length prefix.
    pub fn write_bytes(&mut self, value: &[u8]) -> Result<()> {
        self.write_varint(value.len() as u64)?;
        self.put(value)
    }

    /// Write raw bytes without length prefix.
    pub fn write_raw(&mut self, value: &[u8]) -> Result<()> {
        self.put(value)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    /// Append the checksum, then flush and close the output.
    pub fn close(mut self) -> Result<()> {
        let checksum = self.checksum();
        self.writer.write_u32::<LittleEndian>(checksum)?;
        self.writer.flush_and_sync()?;
        self.writer.close()?;
        Ok(())
    }
}

/// A structured file reader for binary data.
pub struct StructReader<R: StorageInput> {
    reader: R,
    hasher: Hasher,
    position: u64,
    file_size: u64,
}

impl<R: StorageInput> StructReader<R> {
    /// Create a new structured file reader.
    pub fn new(reader: R) -> Result<Self> {
        let file_size = reader.size()?;
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    fn take(&mut self, length: usize) -> Result<Vec<u8>> {
        // The trailing checksum is not payload.
        if self.position + length as u64 + 4 > self.file_size {
            return Err(WhorlError::format(format!(
                "read of {length} bytes at {} runs past the end of the data",
                self.position
            )));
        }
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.hasher.update(&bytes);
        self.position += length as u64;
        Ok(bytes)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let bytes = self.take(N)?;
        let mut array = [0u8; N];
        array.copy_from_slice(&bytes);
        Ok(array)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_le_bytes(self.take_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }

    pub fn read_f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.take_array()?))
    }

    pub fn read_f64(&mut self) -> Result<f64> {
        Ok(f64::from_le_bytes(self.take_array()?))
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let mut bytes = Vec::new();
        loop {
            let byte = self.read_u8()?;
            bytes.push(byte);
            if byte & 0x80 == 0 || bytes.len() >= 10 {
                break;
            }
        }

        let (value, _) = decode_u64(&bytes)?;
        Ok(value)
    }

    /// Read a string with a varint length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| WhorlError::format(format!("Invalid UTF-8: {e}")))
    }

    /// Read bytes with a varint length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        self.take(length)
    }

    /// Read an exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        self.take(length)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Whether all payload bytes (everything but the checksum) have been read.
    pub fn is_eof(&self) -> bool {
        self.position + 4 >= self.file_size
    }

    /// Check the stored checksum against the bytes read so far.
    ///
    /// Only meaningful once the whole payload has been consumed.
    pub fn verify_checksum(&mut self) -> Result<bool> {
        if self.position + 4 != self.file_size {
            return Err(WhorlError::format(format!(
                "{} unread bytes before the checksum",
                self.file_size.saturating_sub(self.position + 4)
            )));
        }

        let stored = self.reader.read_u32::<LittleEndian>()?;
        Ok(stored == self.hasher.clone().finalize())
    }

    /// Close the reader.
    pub fn close(mut self) -> Result<()> {
        self.reader.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Storage;
    use crate::storage::memory::MemoryStorage;
    use std::io::Write;

    #[test]
    fn test_struct_writer_reader() {
        let storage = MemoryStorage::new_default();

        {
            let output = storage.create_output("test.struct").unwrap();
            let mut writer = StructWriter::new(output);

            writer.write_u8(42).unwrap();
            writer.write_u16(1234).unwrap();
            writer.write_i32(-12345).unwrap();
            writer.write_u64(9876543210).unwrap();
            writer.write_varint(12345).unwrap();
            writer.write_f32(std::f32::consts::PI).unwrap();
            writer.write_f64(std::f64::consts::E).unwrap();
            writer.write_string("Hello, World!").unwrap();
            writer.write_bytes(b"binary data").unwrap();
            assert_eq!(writer.position(), 1 + 2 + 4 + 8 + 2 + 4 + 8 + 14 + 12);

            writer.close().unwrap();
        }

        let input = storage.open_input("test.struct").unwrap();
        let mut reader = StructReader::new(input).unwrap();

        assert_eq!(reader.read_u8().unwrap(), 42);
        assert_eq!(reader.read_u16().unwrap(), 1234);
        assert_eq!(reader.read_i32().unwrap(), -12345);
        assert_eq!(reader.read_u64().unwrap(), 9876543210);
        assert_eq!(reader.read_varint().unwrap(), 12345);
        assert!((reader.read_f32().unwrap() - std::f32::consts::PI).abs() < 0.0001);
        assert!((reader.read_f64().unwrap() - std::f64::consts::E).abs() < 0.000000001);
        assert_eq!(reader.read_string().unwrap(), "Hello, World!");
        assert_eq!(reader.read_bytes().unwrap(), b"binary data");
        assert!(reader.is_eof());

        assert!(reader.verify_checksum().unwrap());
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let storage = MemoryStorage::new_default();

        let output = storage.create_output("a").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_string("generation").unwrap();
        writer.write_u64(7).unwrap();
        writer.close().unwrap();

        let mut bytes = storage.open_bytes("a").unwrap().as_slice().to_vec();
        bytes[3] ^= 0xff;
        let mut output = storage.create_output("b").unwrap();
        output.write_all(&bytes).unwrap();
        output.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("b").unwrap()).unwrap();
        reader.read_bytes().unwrap();
        reader.read_u64().unwrap();
        assert!(!reader.verify_checksum().unwrap());
    }

    #[test]
    fn test_checksum_accumulates_over_all_writes() {
        let storage = MemoryStorage::new_default();
        let output = storage.create_output("c").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u32(1).unwrap();
        writer.write_u32(2).unwrap();

        let mut expected = Hasher::new();
        expected.update(&1u32.to_le_bytes());
        expected.update(&2u32.to_le_bytes());
        assert_eq!(writer.checksum(), expected.finalize());
    }

    #[test]
    fn test_read_past_payload_is_format_error() {
        let storage = MemoryStorage::new_default();
        let output = storage.create_output("short").unwrap();
        let mut writer = StructWriter::new(output);
        writer.write_u8(1).unwrap();
        writer.close().unwrap();

        let mut reader = StructReader::new(storage.open_input("short").unwrap()).unwrap();
        assert!(matches!(reader.read_u32(), Err(WhorlError::Format(_))));
    }
}
