//! One virtual segment id space over several partition directories.
//!
//! Parallel builders each produce their own [`SegmentDirectory`]. A
//! [`MultiPartSegmentDirectory`] stacks them so a merge can address every
//! segment without renumbering: the part index lives in the high bits of the
//! virtual id and the physical id in the low 23 bits.

use crate::error::{Result, TesseraError};
use crate::segment::directory::{SegmentData, SegmentDirectory};
use crate::segment::id::{DocId, SegmentId};

/// Bits reserved for the physical segment id.
pub const PHYSICAL_ID_BITS: u32 = 23;
/// Largest physical segment id a part may contain.
pub const MAX_PHYSICAL_SEGMENT_ID: SegmentId = (1 << PHYSICAL_ID_BITS) - 1;
/// Maximum number of parts.
pub const MAX_PARTS: usize = 256;

/// Encode `(part, physical)` as a virtual segment id.
pub fn encode_segment_id(part: usize, physical: SegmentId) -> Result<SegmentId> {
    if part >= MAX_PARTS {
        return Err(TesseraError::invalid_argument(format!(
            "part index {part} exceeds {}",
            MAX_PARTS - 1
        )));
    }
    if !(0..=MAX_PHYSICAL_SEGMENT_ID).contains(&physical) {
        return Err(TesseraError::invalid_argument(format!(
            "physical segment id {physical} is not encodable"
        )));
    }
    // 255 << 23 still leaves the sign bit clear.
    Ok(((part as i32) << PHYSICAL_ID_BITS) | physical)
}

/// Inverse of [`encode_segment_id`].
pub fn decode_segment_id(virtual_id: SegmentId) -> Result<(usize, SegmentId)> {
    if virtual_id < 0 {
        return Err(TesseraError::invalid_argument(format!(
            "virtual segment id {virtual_id} is negative"
        )));
    }
    Ok((
        (virtual_id >> PHYSICAL_ID_BITS) as usize,
        virtual_id & MAX_PHYSICAL_SEGMENT_ID,
    ))
}

/// A segment of one part seen through the virtual id space.
#[derive(Debug, Clone, Copy)]
pub struct VirtualSegment<'a> {
    pub virtual_id: SegmentId,
    pub part: usize,
    /// Base doc id across all parts.
    pub base_doc_id: DocId,
    pub data: &'a SegmentData,
}

impl VirtualSegment<'_> {
    pub fn doc_count(&self) -> u32 {
        self.data.doc_count()
    }
}

#[derive(Debug, Clone)]
pub struct MultiPartSegmentDirectory {
    parts: Vec<SegmentDirectory>,
    part_bases: Vec<DocId>,
    total_doc_count: u32,
}

impl MultiPartSegmentDirectory {
    /// Compose `parts` in order. Every physical id must be encodable.
    pub fn new(parts: Vec<SegmentDirectory>) -> Result<Self> {
        if parts.len() > MAX_PARTS {
            return Err(TesseraError::invalid_argument(format!(
                "{} parts exceed the limit of {MAX_PARTS}",
                parts.len()
            )));
        }

        let mut part_bases = Vec::with_capacity(parts.len());
        let mut base: u64 = 0;
        for (index, part) in parts.iter().enumerate() {
            for segment in part.iter_segments() {
                encode_segment_id(index, segment.segment_id())?;
            }
            part_bases.push(base as DocId);
            base += part.total_doc_count() as u64;
            if base > DocId::MAX as u64 {
                return Err(TesseraError::invalid_argument(
                    "parts exceed the global doc id space",
                ));
            }
        }

        Ok(MultiPartSegmentDirectory {
            parts,
            part_bases,
            total_doc_count: base as u32,
        })
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn part(&self, index: usize) -> Option<&SegmentDirectory> {
        self.parts.get(index)
    }

    pub fn total_doc_count(&self) -> u32 {
        self.total_doc_count
    }

    /// Every segment in part order, then segment order.
    pub fn iter_segments(&self) -> impl Iterator<Item = VirtualSegment<'_>> {
        self.parts.iter().enumerate().flat_map(move |(index, part)| {
            let part_base = self.part_bases[index];
            part.iter_segments().map(move |data| VirtualSegment {
                virtual_id: ((index as i32) << PHYSICAL_ID_BITS) | data.segment_id(),
                part: index,
                base_doc_id: part_base + data.base_doc_id(),
                data,
            })
        })
    }

    pub fn get_segment_data(&self, virtual_id: SegmentId) -> Option<VirtualSegment<'_>> {
        let (index, physical) = decode_segment_id(virtual_id).ok()?;
        let data = self.parts.get(index)?.get_segment_data(physical)?;
        Some(VirtualSegment {
            virtual_id,
            part: index,
            base_doc_id: self.part_bases[index] + data.base_doc_id(),
            data,
        })
    }

    /// Map a global doc id to `(virtual_segment_id, local_doc_id)`.
    pub fn locate(&self, global_doc_id: DocId) -> Option<(SegmentId, DocId)> {
        if global_doc_id >= self.total_doc_count {
            return None;
        }
        let index = self
            .part_bases
            .partition_point(|&base| base <= global_doc_id)
            .checked_sub(1)?;
        // Empty parts share a base with their successor.
        (0..=index).rev().find_map(|i| {
            let local = global_doc_id - self.part_bases[i];
            let (physical, local) = self.parts[i].locate(local)?;
            Some((((i as i32) << PHYSICAL_ID_BITS) | physical, local))
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PartitionOptions;
    use crate::segment::info::SegmentInfo;
    use crate::storage::{MemoryStorage, Storage};

    fn part(doc_counts: &[(SegmentId, u32)]) -> SegmentDirectory {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let options = PartitionOptions::default();
        let mut directory = SegmentDirectory::load(Arc::clone(&storage), &options).unwrap();
        for &(segment_id, doc_count) in doc_counts {
            SegmentInfo::new(doc_count, 0)
                .store(&*storage, segment_id)
                .unwrap();
        }
        let ids: Vec<SegmentId> = doc_counts.iter().map(|&(id, _)| id).collect();
        directory.commit(&ids, &[], &options).unwrap();
        directory
    }

    #[test]
    fn test_round_trip() {
        for (p, s) in [
            (0, 0),
            (0, 1),
            (1, 0),
            (3, 77),
            (255, 0),
            (0, MAX_PHYSICAL_SEGMENT_ID),
            (255, MAX_PHYSICAL_SEGMENT_ID),
        ] {
            let virtual_id = encode_segment_id(p, s).unwrap();
            assert!(virtual_id >= 0);
            assert_eq!(decode_segment_id(virtual_id).unwrap(), (p, s));
        }
    }

    #[test]
    fn test_out_of_range() {
        assert!(encode_segment_id(256, 0).is_err());
        assert!(encode_segment_id(0, MAX_PHYSICAL_SEGMENT_ID + 1).is_err());
        assert!(encode_segment_id(0, -1).is_err());
        assert!(decode_segment_id(-5).is_err());
    }

    #[test]
    fn test_bases_continue_across_parts() {
        let multi = MultiPartSegmentDirectory::new(vec![
            part(&[(0, 4), (1, 2)]),
            part(&[]),
            part(&[(0, 3)]),
        ])
        .unwrap();

        assert_eq!(multi.total_doc_count(), 9);
        let segments: Vec<(SegmentId, DocId)> = multi
            .iter_segments()
            .map(|s| (s.virtual_id, s.base_doc_id))
            .collect();
        let third = encode_segment_id(2, 0).unwrap();
        assert_eq!(segments, vec![(0, 0), (1, 4), (third, 6)]);

        assert_eq!(multi.locate(5), Some((1, 1)));
        assert_eq!(multi.locate(6), Some((third, 0)));
        assert_eq!(multi.locate(9), None);
        assert_eq!(multi.get_segment_data(third).unwrap().doc_count(), 3);
        assert!(multi.get_segment_data(encode_segment_id(1, 0).unwrap()).is_none());
    }
}
