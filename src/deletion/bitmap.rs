//! Expandable, monotonic deletion bitmap.
//!
//! On disk a bitmap is a checksummed record:
//!
//! ```text
//! "TSDM" | layout u16 | bit length u32 | deleted count u32 | bytes | crc32
//! ```

use bit_vec::BitVec;

use crate::error::{Result, TesseraError};
use crate::segment::id::DocId;
use crate::storage::{Storage, StructReader, write_struct_atomic};

const DELETION_MAGIC: &[u8; 4] = b"TSDM";
const DELETION_LAYOUT: u16 = 1;

/// One bit per local document, set when the document is deleted.
///
/// Bits only go from clear to set and the bitmap never shrinks.
#[derive(Debug, Clone, PartialEq)]
pub struct DeletionBitmap {
    bits: BitVec,
    deleted_count: u32,
}

impl DeletionBitmap {
    pub fn new(doc_count: u32) -> Self {
        DeletionBitmap {
            bits: BitVec::from_elem(doc_count as usize, false),
            deleted_count: 0,
        }
    }

    /// Number of documents covered.
    pub fn len(&self) -> u32 {
        self.bits.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted_count
    }

    pub fn live_count(&self) -> u32 {
        self.len() - self.deleted_count
    }

    pub fn deletion_ratio(&self) -> f64 {
        if self.bits.is_empty() {
            0.0
        } else {
            self.deleted_count as f64 / self.bits.len() as f64
        }
    }

    /// Out-of-range ids are reported as live.
    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.bits.get(doc_id as usize).unwrap_or(false)
    }

    /// Mark `doc_id` deleted. `false` if it is out of range or already
    /// deleted.
    pub fn delete(&mut self, doc_id: DocId) -> bool {
        match self.bits.get(doc_id as usize) {
            Some(false) => {
                self.bits.set(doc_id as usize, true);
                self.deleted_count += 1;
                true
            }
            _ => false,
        }
    }

    /// Grow to cover `doc_count` documents. Never shrinks.
    pub fn expand(&mut self, doc_count: u32) {
        let len = self.bits.len();
        if doc_count as usize > len {
            self.bits.grow(doc_count as usize - len, false);
        }
    }

    /// OR `other` into this bitmap, growing as needed.
    pub fn union_with(&mut self, other: &DeletionBitmap) {
        self.expand(other.len());
        for doc_id in other.iter_deleted() {
            self.delete(doc_id);
        }
    }

    /// Deleted doc ids, ascending.
    pub fn iter_deleted(&self) -> impl Iterator<Item = DocId> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|&(_, bit)| bit)
            .map(|(doc_id, _)| doc_id as DocId)
    }

    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        write_struct_atomic(storage, path, |w| {
            w.write_header(DELETION_MAGIC, DELETION_LAYOUT)?;
            w.write_u32(self.len())?;
            w.write_u32(self.deleted_count)?;
            w.write_bytes(&self.bits.to_bytes())
        })
    }

    pub fn load(storage: &dyn Storage, path: &str) -> Result<Self> {
        let mut reader = StructReader::new(storage.open_input(path)?)?;
        let layout = reader.read_header(DELETION_MAGIC)?;
        if layout != DELETION_LAYOUT {
            return Err(TesseraError::unsupported(format!(
                "{path}: deletion map layout {layout}"
            )));
        }
        let len = reader.read_u32()?;
        let deleted_count = reader.read_u32()?;
        let bytes = reader.read_bytes()?;
        reader.finish()?;

        if bytes.len() != (len as usize).div_ceil(8) {
            return Err(TesseraError::corrupt(format!(
                "{path}: {} bitmap bytes for {len} bits",
                bytes.len()
            )));
        }
        let mut bits = BitVec::from_bytes(&bytes);
        bits.truncate(len as usize);
        let counted = bits.iter().filter(|&bit| bit).count() as u32;
        if counted != deleted_count {
            return Err(TesseraError::corrupt(format!(
                "{path}: header says {deleted_count} deleted, bitmap has {counted}"
            )));
        }
        Ok(DeletionBitmap {
            bits,
            deleted_count,
        })
    }
}
