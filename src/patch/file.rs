//! Attribute patch files.
//!
//! A patch file holds the updates one segment (the source) made to one
//! field of another, older segment (the target). Its name carries its
//! provenance, `<src>_<target>_<op>.patch`, and it lives under
//! `segment_<src>/attribute/<field>/`. The body is a checksummed record:
//!
//! ```text
//! "TSPF" | layout u16 | field type u8 | op varint | src i32 | target i32
//!        | doc ids (count, varint gaps) | null flags (bytes)
//!        | values (fixed width, or varint length + bytes) | crc32
//! ```
//!
//! Doc ids are strictly increasing within a file.

use std::fmt;

use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::attribute::column::ValueBuffer;
use crate::error::{Result, TesseraError};
use crate::schema::{AttributeValue, FieldType};
use crate::segment::id::{DocId, OperationId, SegmentId, segment_dir_name};
use crate::storage::{Storage, StructReader, write_struct_atomic};

const PATCH_MAGIC: &[u8; 4] = b"TSPF";
const PATCH_LAYOUT: u16 = 1;

lazy_static! {
    static ref PATCH_FILE_RE: Regex =
        Regex::new(r"^(0|[1-9][0-9]*)_(0|[1-9][0-9]*)_(0|[1-9][0-9]*)\.patch$").unwrap();
}

/// Provenance encoded in a patch file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct PatchFileName {
    pub src_segment_id: SegmentId,
    pub target_segment_id: SegmentId,
    pub operation_id: OperationId,
}

impl PatchFileName {
    pub fn new(
        src_segment_id: SegmentId,
        target_segment_id: SegmentId,
        operation_id: OperationId,
    ) -> Self {
        PatchFileName {
            src_segment_id,
            target_segment_id,
            operation_id,
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        let caps = PATCH_FILE_RE.captures(name)?;
        Some(PatchFileName {
            src_segment_id: caps[1].parse().ok()?,
            target_segment_id: caps[2].parse().ok()?,
            operation_id: caps[3].parse().ok()?,
        })
    }

    /// Path relative to the partition root for `field`.
    pub fn path(&self, field: &str) -> String {
        format!(
            "{}/{}",
            attribute_dir(self.src_segment_id, field),
            self
        )
    }
}

impl fmt::Display for PatchFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}.patch",
            self.src_segment_id, self.target_segment_id, self.operation_id
        )
    }
}

/// `segment_<id>/attribute/<field>`
pub fn attribute_dir(segment_id: SegmentId, field: &str) -> String {
    format!("{}/attribute/{field}", segment_dir_name(segment_id))
}

/// Accumulates the records of one patch file.
#[derive(Debug)]
pub struct PatchFileWriter {
    name: PatchFileName,
    doc_ids: Vec<DocId>,
    values: ValueBuffer,
}

impl PatchFileWriter {
    pub fn new(field_type: FieldType, name: PatchFileName) -> Self {
        PatchFileWriter {
            name,
            doc_ids: Vec::new(),
            values: ValueBuffer::new(field_type),
        }
    }

    pub fn name(&self) -> &PatchFileName {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    /// Append one record. Doc ids must be strictly increasing and the value
    /// must already have the field's type.
    pub fn add(&mut self, doc_id: DocId, value: Option<&AttributeValue>) -> Result<()> {
        if self.doc_ids.last().is_some_and(|&last| doc_id <= last) {
            return Err(TesseraError::invalid_argument(format!(
                "patch doc id {doc_id} is not increasing"
            )));
        }
        self.values.push(value)?;
        self.doc_ids.push(doc_id);
        Ok(())
    }

    /// Write the file atomically under `storage` at `path`.
    pub fn write(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        write_struct_atomic(storage, path, |w| {
            w.write_header(PATCH_MAGIC, PATCH_LAYOUT)?;
            w.write_u8(self.values.field_type().tag())?;
            w.write_varint(self.name.operation_id as u64)?;
            w.write_i32(self.name.src_segment_id)?;
            w.write_i32(self.name.target_segment_id)?;
            w.write_delta_compressed_u32s(&self.doc_ids)?;
            self.values.write_to(w)
        })
    }
}

/// A decoded patch file held in memory.
#[derive(Debug, Clone)]
pub struct PatchFileData {
    pub name: PatchFileName,
    doc_ids: Vec<DocId>,
    values: ValueBuffer,
}

impl PatchFileData {
    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(path)?)?;
        let layout = reader.read_header(PATCH_MAGIC)?;
        if layout != PATCH_LAYOUT {
            return Err(TesseraError::unsupported(format!(
                "{path}: patch layout {layout}"
            )));
        }
        let field_type = FieldType::from_tag(reader.read_u8()?)?;
        let operation_id = reader.read_varint()? as OperationId;
        let src_segment_id = reader.read_i32()?;
        let target_segment_id = reader.read_i32()?;
        let doc_ids = reader.read_delta_compressed_u32s()?;
        let values = ValueBuffer::read_from(&mut reader, field_type, doc_ids.len())
            .map_err(|e| TesseraError::corrupt(format!("{path}: {e}")))?;
        reader.finish()?;

        if doc_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(TesseraError::corrupt(format!(
                "{path}: doc ids are not strictly increasing"
            )));
        }

        Ok(PatchFileData {
            name: PatchFileName::new(src_segment_id, target_segment_id, operation_id),
            doc_ids,
            values,
        })
    }

    pub fn field_type(&self) -> FieldType {
        self.values.field_type()
    }

    pub fn len(&self) -> usize {
        self.doc_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doc_ids.is_empty()
    }

    pub fn doc_ids(&self) -> &[DocId] {
        &self.doc_ids
    }

    /// Encoded value of record `index`, `None` for null.
    pub fn value_bytes(&self, index: usize) -> Option<&[u8]> {
        self.values.get_bytes(index)
    }

    /// First record index at or after `from` whose doc id is `>= doc_id`.
    pub fn lower_bound(&self, from: usize, doc_id: DocId) -> usize {
        from + self.doc_ids[from..].partition_point(|&d| d < doc_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_name_grammar() {
        let name = PatchFileName::new(5, 2, 1);
        assert_eq!(name.to_string(), "5_2_1.patch");
        assert_eq!(name.path("price"), "segment_5/attribute/price/5_2_1.patch");
        assert_eq!(PatchFileName::parse("5_2_1.patch"), Some(name));
        assert_eq!(PatchFileName::parse("5_2_1.patch.tmp"), None);
        assert_eq!(PatchFileName::parse("05_2_1.patch"), None);
        assert_eq!(PatchFileName::parse("data"), None);
    }

    #[test]
    fn test_write_and_load() {
        let storage = MemoryStorage::new_default();
        let mut writer = PatchFileWriter::new(FieldType::String, PatchFileName::new(3, 0, 0));
        writer.add(1, Some(&AttributeValue::from("x"))).unwrap();
        writer.add(4, None).unwrap();
        writer.add(9, Some(&AttributeValue::from(""))).unwrap();
        writer.write(&storage, "p").unwrap();

        let data = PatchFileData::load(&storage, "p").unwrap();
        assert_eq!(data.doc_ids(), &[1, 4, 9]);
        assert_eq!(data.value_bytes(0), Some(&b"x"[..]));
        assert_eq!(data.value_bytes(1), None);
        assert_eq!(data.value_bytes(2), Some(&b""[..]));
        assert_eq!(data.lower_bound(0, 5), 2);
        assert_eq!(data.name, PatchFileName::new(3, 0, 0));
    }

    #[test]
    fn test_writer_rejects_bad_records() {
        let mut writer = PatchFileWriter::new(FieldType::Int32, PatchFileName::new(1, 0, 0));
        writer.add(2, Some(&AttributeValue::Int32(7))).unwrap();
        assert!(writer.add(2, None).is_err());
        assert!(matches!(
            writer.add(3, Some(&AttributeValue::from("7"))),
            Err(TesseraError::SchemaMismatch(_))
        ));
    }
}
