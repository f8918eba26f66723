//! Checksummed binary records.
//!
//! Every binary file the engine writes (versions, patches, deletion maps,
//! attribute columns) is a [`StructWriter`] stream: a 4-byte magic, a layout
//! version, little-endian fixed-width fields and varints, and a trailing
//! CRC32 over every byte before it. [`StructReader`] recomputes the CRC as it
//! reads so a torn or bit-flipped file is detected at
//! [`StructReader::finish`].

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::{Result, TesseraError};
use crate::storage::{StorageInput, StorageOutput};
use crate::util::varint::{encode_u64, read_u64_raw, zigzag_decode, zigzag_encode};

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

    /// Write a magic tag followed by a layout version.
    pub fn write_header(&mut self, magic: &[u8; 4], layout_version: u16) -> Result<()> {
        self.write_raw(magic)?;
        self.write_u16(layout_version)
    }

    /// Write a u8 value.
    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.writer.write_u8(value)?;
        self.track(&[value]);
        Ok(())
    }

    /// Write a u16 value (little-endian).
    pub fn write_u16(&mut self, value: u16) -> Result<()> {
        self.writer.write_u16::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u32 value (little-endian).
    pub fn write_u32(&mut self, value: u32) -> Result<()> {
        self.writer.write_u32::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i32 value (little-endian).
    pub fn write_i32(&mut self, value: i32) -> Result<()> {
        self.writer.write_i32::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a u64 value (little-endian).
    pub fn write_u64(&mut self, value: u64) -> Result<()> {
        self.writer.write_u64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write an i64 value (little-endian).
    pub fn write_i64(&mut self, value: i64) -> Result<()> {
        self.writer.write_i64::<LittleEndian>(value)?;
        self.track(&value.to_le_bytes());
        Ok(())
    }

    /// Write a variable-length integer.
    pub fn write_varint(&mut self, value: u64) -> Result<()> {
        let encoded = encode_u64(value);
        self.writer.write_all(&encoded)?;
        self.track(&encoded);
        Ok(())
    }

    /// Write a zigzag-encoded signed varint.
    pub fn write_signed_varint(&mut self, value: i64) -> Result<()> {
        self.write_varint(zigzag_encode(value))
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
        self.track(value);
        Ok(())
    }

    /// Write a strictly increasing u32 sequence as varint gaps.
    pub fn write_delta_compressed_u32s(&mut self, values: &[u32]) -> Result<()> {
        self.write_varint(values.len() as u64)?;

        let mut previous = 0u32;
        for &value in values {
            self.write_varint(value.wrapping_sub(previous) as u64)?;
            previous = value;
        }

        Ok(())
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// CRC32 of everything written so far.
    pub fn checksum(&self) -> u32 {
        self.hasher.clone().finalize()
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Write the checksum trailer, then flush, sync and close.
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
        if file_size < 4 {
            return Err(TesseraError::corrupt("file too short for checksum"));
        }
        Ok(StructReader {
            reader,
            hasher: Hasher::new(),
            position: 0,
            file_size,
        })
    }

    /// Read and check the magic tag. Returns the layout version.
    pub fn read_header(&mut self, magic: &[u8; 4]) -> Result<u16> {
        let found = self.read_raw(4)?;
        if found.as_slice() != magic {
            return Err(TesseraError::corrupt(format!(
                "bad magic: expected {:?}, found {:?}",
                String::from_utf8_lossy(magic),
                String::from_utf8_lossy(&found)
            )));
        }
        self.read_u16()
    }

    /// Read a u8 value.
    pub fn read_u8(&mut self) -> Result<u8> {
        self.ensure_available(1)?;
        let value = self.reader.read_u8()?;
        self.track(&[value]);
        Ok(value)
    }

    /// Read a u16 value (little-endian).
    pub fn read_u16(&mut self) -> Result<u16> {
        self.ensure_available(2)?;
        let value = self.reader.read_u16::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a u32 value (little-endian).
    pub fn read_u32(&mut self) -> Result<u32> {
        self.ensure_available(4)?;
        let value = self.reader.read_u32::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read an i32 value (little-endian).
    pub fn read_i32(&mut self) -> Result<i32> {
        self.ensure_available(4)?;
        let value = self.reader.read_i32::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a u64 value (little-endian).
    pub fn read_u64(&mut self) -> Result<u64> {
        self.ensure_available(8)?;
        let value = self.reader.read_u64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read an i64 value (little-endian).
    pub fn read_i64(&mut self) -> Result<i64> {
        self.ensure_available(8)?;
        let value = self.reader.read_i64::<LittleEndian>()?;
        self.track(&value.to_le_bytes());
        Ok(value)
    }

    /// Read a variable-length integer.
    pub fn read_varint(&mut self) -> Result<u64> {
        let (value, raw) = read_u64_raw(&mut self.reader)?;
        self.track(&raw);
        if self.position > self.payload_len() {
            return Err(TesseraError::corrupt("varint runs into checksum trailer"));
        }
        Ok(value)
    }

    /// Read a zigzag-encoded signed varint.
    pub fn read_signed_varint(&mut self) -> Result<i64> {
        Ok(zigzag_decode(self.read_varint()?))
    }

    /// Read a string with length prefix.
    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes).map_err(|e| TesseraError::corrupt(format!("Invalid UTF-8: {e}")))
    }

    /// Read bytes with length prefix.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let length = self.read_varint()? as usize;
        self.read_raw(length)
    }

    /// Read exact number of raw bytes.
    pub fn read_raw(&mut self, length: usize) -> Result<Vec<u8>> {
        self.ensure_available(length as u64)?;
        let mut bytes = vec![0u8; length];
        self.reader.read_exact(&mut bytes)?;
        self.track(&bytes);
        Ok(bytes)
    }

    /// Read a delta-compressed integer array.
    pub fn read_delta_compressed_u32s(&mut self) -> Result<Vec<u32>> {
        let length = self.read_varint()? as usize;
        let mut values = Vec::with_capacity(length.min(1 << 20));
        let mut previous = 0u32;

        for _ in 0..length {
            let value = previous.wrapping_add(self.read_varint()? as u32);
            values.push(value);
            previous = value;
        }

        Ok(values)
    }

    /// Get current file position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Get file size, trailer included.
    pub fn size(&self) -> u64 {
        self.file_size
    }

    /// Whether every payload byte has been consumed.
    pub fn is_eof(&self) -> bool {
        self.position >= self.payload_len()
    }

    fn payload_len(&self) -> u64 {
        self.file_size - 4
    }

    fn ensure_available(&self, length: u64) -> Result<()> {
        if self.position + length > self.payload_len() {
            return Err(TesseraError::corrupt(format!(
                "truncated record: need {length} bytes at offset {}",
                self.position
            )));
        }
        Ok(())
    }

    fn track(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.position += data.len() as u64;
    }

    /// Check that the payload is fully consumed and the trailer matches.
    pub fn finish(mut self) -> Result<()> {
        if self.position != self.payload_len() {
            return Err(TesseraError::corrupt(format!(
                "trailing bytes: consumed {} of {}",
                self.position,
                self.payload_len()
            )));
        }
        let stored = self.reader.read_u32::<LittleEndian>()?;
        let computed = self.hasher.clone().finalize();
        if stored != computed {
            return Err(TesseraError::corrupt(format!(
                "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
            )));
        }
        self.reader.close()
    }
}
