//! Write side of deletion maps.
//!
//! Deletes collect in memory until the writer commits, then each dirty
//! bitmap is dumped as `deletionmap/data_<target>` inside the new segment.

use std::collections::{BTreeMap, BTreeSet};

use crate::deletion::bitmap::DeletionBitmap;
use crate::deletion::reader::DeletionMapReader;
use crate::error::{Result, TesseraError};
use crate::patch::finder::deletion_file_name;
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{BUILDING_SEGMENT_ID, DocId, SegmentId, segment_dir_name};
use crate::storage::Storage;

/// Records deletes against a version plus the building segment.
///
/// Global doc ids past the last sealed segment address the building
/// segment. Only bitmaps that received new deletes are dumped.
#[derive(Debug, Clone)]
pub struct DeletionMapWriter {
    directory: SegmentDirectory,
    bitmaps: BTreeMap<SegmentId, DeletionBitmap>,
    building: DeletionBitmap,
    dirty: BTreeSet<SegmentId>,
}

impl DeletionMapWriter {
    /// Start from the effective deletions of `reader`'s version.
    pub fn new(reader: DeletionMapReader) -> Self {
        let directory = reader.directory().clone();
        DeletionMapWriter {
            directory,
            bitmaps: reader.into_bitmaps(),
            building: DeletionBitmap::new(0),
            dirty: BTreeSet::new(),
        }
    }

    pub fn open(directory: &SegmentDirectory) -> Result<Self> {
        Ok(Self::new(DeletionMapReader::open(directory)?))
    }

    /// Grow the building segment bitmap to `doc_count` documents.
    pub fn set_building_doc_count(&mut self, doc_count: u32) {
        self.building.expand(doc_count);
    }

    /// Delete a global doc id. `false` if out of range or already deleted.
    pub fn delete(&mut self, global_doc_id: DocId) -> bool {
        let sealed = self.directory.total_doc_count();
        if global_doc_id >= sealed {
            return self.delete_in_segment(BUILDING_SEGMENT_ID, global_doc_id - sealed);
        }
        match self.directory.locate(global_doc_id) {
            Some((segment_id, local)) => self.delete_in_segment(segment_id, local),
            None => false,
        }
    }

    /// Delete `local_doc_id` of `segment_id` (or of the building segment).
    pub fn delete_in_segment(&mut self, segment_id: SegmentId, local_doc_id: DocId) -> bool {
        let deleted = if segment_id == BUILDING_SEGMENT_ID {
            self.building.delete(local_doc_id)
        } else {
            self.bitmaps
                .get_mut(&segment_id)
                .is_some_and(|bitmap| bitmap.delete(local_doc_id))
        };
        if deleted {
            self.dirty.insert(segment_id);
        }
        deleted
    }

    pub fn is_deleted(&self, global_doc_id: DocId) -> bool {
        let sealed = self.directory.total_doc_count();
        if global_doc_id >= sealed {
            return self.building.is_deleted(global_doc_id - sealed);
        }
        self.directory
            .locate(global_doc_id)
            .and_then(|(segment_id, local)| {
                self.bitmaps.get(&segment_id).map(|b| b.is_deleted(local))
            })
            .unwrap_or(false)
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Segments with deletes not yet dumped; the building segment shows as
    /// `BUILDING_SEGMENT_ID`.
    pub fn dirty_segments(&self) -> Vec<SegmentId> {
        self.dirty.iter().copied().collect()
    }

    pub fn building_bitmap(&self) -> &DeletionBitmap {
        &self.building
    }

    /// Write every dirty bitmap into `segment_<dest>/deletionmap/`, the
    /// building segment's under the name of `dest_segment_id` itself.
    /// Returns the targets written.
    pub fn dump(&mut self, storage: &dyn Storage, dest_segment_id: SegmentId) -> Result<Vec<SegmentId>> {
        let mut written = Vec::with_capacity(self.dirty.len());
        for &segment_id in &self.dirty {
            let (target, bitmap) = if segment_id == BUILDING_SEGMENT_ID {
                (dest_segment_id, &self.building)
            } else {
                if segment_id >= dest_segment_id {
                    return Err(TesseraError::invalid_operation(format!(
                        "segment {dest_segment_id} cannot hold deletes for newer segment {segment_id}"
                    )));
                }
                let bitmap = self.bitmaps.get(&segment_id).ok_or_else(|| {
                    TesseraError::internal(format!("no bitmap for segment {segment_id}"))
                })?;
                (segment_id, bitmap)
            };
            let path = format!(
                "{}/{}",
                segment_dir_name(dest_segment_id),
                deletion_file_name(target)
            );
            bitmap.store(storage, &path)?;
            written.push(target);
        }
        if !written.is_empty() {
            log::debug!("dumped deletion maps for {written:?} into segment {dest_segment_id}");
        }
        self.dirty.clear();
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::PartitionOptions;
    use crate::segment::info::SegmentInfo;
    use crate::storage::MemoryStorage;

    fn directory(storage: &Arc<dyn Storage>, counts: &[(SegmentId, u32)]) -> SegmentDirectory {
        let options = PartitionOptions::default();
        for &(segment_id, doc_count) in counts {
            SegmentInfo::new(doc_count, 0).store(storage.as_ref(), segment_id).unwrap();
        }
        let mut directory = SegmentDirectory::load(Arc::clone(storage), &options).unwrap();
        let ids: Vec<SegmentId> = counts.iter().map(|&(id, _)| id).collect();
        directory.commit(&ids, &[], &options).unwrap();
        directory
    }

    #[test]
    fn test_delete_is_idempotent() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let mut writer = DeletionMapWriter::open(&directory(&storage, &[(0, 4), (1, 3)])).unwrap();
        writer.set_building_doc_count(2);

        assert!(writer.delete(2));
        assert!(!writer.delete(2));
        assert!(writer.delete(5));
        assert!(writer.delete(8));
        assert!(!writer.delete(9));
        assert!(writer.is_deleted(5));
        assert!(writer.is_deleted(8));
        assert!(!writer.is_deleted(0));
        assert_eq!(writer.dirty_segments(), vec![BUILDING_SEGMENT_ID, 0, 1]);
    }

    #[test]
    fn test_dump_only_dirty_and_read_back() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let options = PartitionOptions::default();
        let mut dir = directory(&storage, &[(0, 4), (1, 3)]);
        let mut writer = DeletionMapWriter::open(&dir).unwrap();
        writer.set_building_doc_count(2);
        writer.delete(1);
        writer.delete(8);

        let written = writer.dump(storage.as_ref(), 2).unwrap();
        assert_eq!(written, vec![2, 0]);
        assert!(storage.file_exists("segment_2/deletionmap/data_0"));
        assert!(storage.file_exists("segment_2/deletionmap/data_2"));
        assert!(!storage.file_exists("segment_2/deletionmap/data_1"));
        assert!(!writer.is_dirty());

        SegmentInfo::new(2, 0).store(storage.as_ref(), 2).unwrap();
        dir.commit(&[2], &[], &options).unwrap();
        let reader = DeletionMapReader::open(&dir).unwrap();
        assert!(reader.is_deleted(1));
        assert!(reader.is_deleted(8));
        assert!(!reader.is_deleted(7));
        assert_eq!(reader.deleted_count(0), 1);
        assert_eq!(reader.deleted_count(1), 0);
        assert_eq!(reader.deleted_count(2), 1);
    }

    #[test]
    fn test_generations_are_ored() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let options = PartitionOptions::default();
        let mut dir = directory(&storage, &[(0, 4)]);

        for (dest, doc) in [(1, 0), (2, 3)] {
            let mut writer = DeletionMapWriter::open(&dir).unwrap();
            writer.delete(doc);
            writer.dump(storage.as_ref(), dest).unwrap();
            SegmentInfo::new(0, 0).store(storage.as_ref(), dest).unwrap();
            dir.commit(&[dest], &[], &options).unwrap();
        }

        let reader = DeletionMapReader::open(&dir).unwrap();
        let bitmap = reader.bitmap(0).unwrap();
        assert_eq!(bitmap.iter_deleted().collect::<Vec<_>>(), vec![0, 3]);
        assert!(bitmap.deleted_count() <= bitmap.len());
    }
}
