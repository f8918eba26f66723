//! Per-segment attribute column files.
//!
//! `segment_<id>/attribute/<field>/data` holds one value (or null) for each
//! document the segment was built with:
//!
//! ```text
//! "TSAC" | layout u16 | field type u8 | doc count u32
//!        | null flags (bytes) | values (bytes) | crc32
//! ```

use bit_vec::BitVec;

use crate::error::{Result, TesseraError};
use crate::schema::{AttributeValue, FieldType};
use crate::segment::id::DocId;
use crate::storage::{
    Storage, StorageInput, StorageOutput, StructReader, StructWriter, write_struct_atomic,
};
use crate::util::varint;

const COLUMN_MAGIC: &[u8; 4] = b"TSAC";
const COLUMN_LAYOUT: u16 = 1;

/// Name of the column file inside a field directory.
pub const COLUMN_FILE: &str = "data";

/// A run of typed values with null flags, shared by column and patch
/// files. Fixed-width values are stored back to back; strings carry a
/// varint length prefix.
#[derive(Debug, Clone)]
pub struct ValueBuffer {
    field_type: FieldType,
    nulls: BitVec,
    slots: Vec<Option<(usize, usize)>>,
    values: Vec<u8>,
}

impl ValueBuffer {
    pub fn new(field_type: FieldType) -> Self {
        ValueBuffer {
            field_type,
            nulls: BitVec::new(),
            slots: Vec::new(),
            values: Vec::new(),
        }
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Append a value that already has this buffer's type.
    pub fn push(&mut self, value: Option<&AttributeValue>) -> Result<()> {
        match value {
            Some(value) if value.field_type() != self.field_type => {
                Err(TesseraError::schema_mismatch(format!(
                    "{} value in a {} column",
                    value.field_type(),
                    self.field_type
                )))
            }
            Some(value) => {
                let mut encoded = Vec::new();
                value.encode(&mut encoded);
                self.push_encoded(Some(&encoded));
                Ok(())
            }
            None => {
                self.push_encoded(None);
                Ok(())
            }
        }
    }

    fn push_encoded(&mut self, bytes: Option<&[u8]>) {
        match bytes {
            Some(bytes) => {
                if self.field_type.fixed_size().is_none() {
                    varint::encode_u64_into(bytes.len() as u64, &mut self.values);
                }
                let start = self.values.len();
                self.values.extend_from_slice(bytes);
                self.slots.push(Some((start, bytes.len())));
                self.nulls.push(false);
            }
            None => {
                self.slots.push(None);
                self.nulls.push(true);
            }
        }
    }

    /// Encoded value at `index`, `None` for null.
    pub fn get_bytes(&self, index: usize) -> Option<&[u8]> {
        self.slots
            .get(index)
            .copied()
            .flatten()
            .map(|(start, len)| &self.values[start..start + len])
    }

    pub fn get(&self, index: usize) -> Result<Option<AttributeValue>> {
        self.get_bytes(index)
            .map(|bytes| AttributeValue::decode(self.field_type, bytes))
            .transpose()
    }

    pub fn write_to<W: StorageOutput>(&self, w: &mut StructWriter<W>) -> Result<()> {
        w.write_bytes(&self.nulls.to_bytes())?;
        w.write_bytes(&self.values)
    }

    /// Read `count` values written by [`ValueBuffer::write_to`].
    pub fn read_from<R: StorageInput>(
        r: &mut StructReader<R>,
        field_type: FieldType,
        count: usize,
    ) -> Result<Self> {
        let null_bytes = r.read_bytes()?;
        let values = r.read_bytes()?;
        if null_bytes.len() != count.div_ceil(8) {
            return Err(TesseraError::corrupt("null flags do not match the value count"));
        }
        let mut nulls = BitVec::from_bytes(&null_bytes);
        nulls.truncate(count);

        let mut slots = Vec::with_capacity(count);
        let mut offset = 0usize;
        for i in 0..count {
            if nulls.get(i).unwrap_or(false) {
                slots.push(None);
                continue;
            }
            let (start, len) = match field_type.fixed_size() {
                Some(size) => (offset, size),
                None => {
                    let (len, read) = varint::decode_u64(values.get(offset..).unwrap_or(&[]))?;
                    (offset + read, len as usize)
                }
            };
            if start + len > values.len() {
                return Err(TesseraError::corrupt("value section is truncated"));
            }
            slots.push(Some((start, len)));
            offset = start + len;
        }
        if offset != values.len() {
            return Err(TesseraError::corrupt("value section has trailing bytes"));
        }

        Ok(ValueBuffer {
            field_type,
            nulls,
            slots,
            values,
        })
    }
}

/// Builds the column of one field of a segment.
#[derive(Debug)]
pub struct AttributeColumnWriter {
    buffer: ValueBuffer,
}

impl AttributeColumnWriter {
    pub fn new(field_type: FieldType) -> Self {
        AttributeColumnWriter {
            buffer: ValueBuffer::new(field_type),
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.buffer.len() as u32
    }

    /// Append the value of the next document, converting it to the column
    /// type.
    pub fn add(&mut self, value: Option<&AttributeValue>) -> Result<()> {
        match value {
            Some(value) if value.field_type() != self.buffer.field_type() => {
                let converted = value.convert_to(self.buffer.field_type())?;
                self.buffer.push(Some(&converted))
            }
            other => self.buffer.push(other),
        }
    }

    /// Pad with nulls up to `doc_count` documents.
    pub fn fill_to(&mut self, doc_count: u32) {
        while self.doc_count() < doc_count {
            self.buffer.push_encoded(None);
        }
    }

    pub fn write(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        write_struct_atomic(storage, path, |w| {
            w.write_header(COLUMN_MAGIC, COLUMN_LAYOUT)?;
            w.write_u8(self.buffer.field_type().tag())?;
            w.write_u32(self.doc_count())?;
            self.buffer.write_to(w)
        })
    }
}

/// A loaded column.
#[derive(Debug, Clone)]
pub struct AttributeColumn {
    buffer: ValueBuffer,
}

impl AttributeColumn {
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(path)?)?;
        let layout = reader.read_header(COLUMN_MAGIC)?;
        if layout != COLUMN_LAYOUT {
            return Err(TesseraError::unsupported(format!(
                "{path}: column layout {layout}"
            )));
        }
        let field_type = FieldType::from_tag(reader.read_u8()?)?;
        let doc_count = reader.read_u32()?;
        let buffer = ValueBuffer::read_from(&mut reader, field_type, doc_count as usize)
            .map_err(|e| TesseraError::corrupt(format!("{path}: {e}")))?;
        reader.finish()?;
        Ok(AttributeColumn { buffer })
    }

    pub fn field_type(&self) -> FieldType {
        self.buffer.field_type()
    }

    pub fn doc_count(&self) -> u32 {
        self.buffer.len() as u32
    }

    pub fn get(&self, doc_id: DocId) -> Result<Option<AttributeValue>> {
        self.buffer.get(doc_id as usize)
    }
}
