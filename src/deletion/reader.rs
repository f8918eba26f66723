//! Read side of deletion maps: every generation targeting a segment, ORed.

use std::collections::BTreeMap;

use crate::deletion::bitmap::DeletionBitmap;
use crate::error::{Result, TesseraError};
use crate::patch::finder::{PatchCatalog, PatchFileFinder};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{DocId, SegmentId};

/// Effective deletions of every segment in a version.
///
/// The bitmap of a segment is the OR of every deletion file that targets it
/// from a live segment.
#[derive(Debug, Clone)]
pub struct DeletionMapReader {
    directory: SegmentDirectory,
    bitmaps: BTreeMap<SegmentId, DeletionBitmap>,
}

impl DeletionMapReader {
    /// Open with every deletion file of the version.
    pub fn open(directory: &SegmentDirectory) -> Result<Self> {
        let catalog = PatchFileFinder::find(directory)?;
        Self::open_with_catalog(directory, &catalog)
    }

    /// Open with the deletion files of an already scanned (and possibly
    /// filtered) catalog.
    pub fn open_with_catalog(directory: &SegmentDirectory, catalog: &PatchCatalog) -> Result<Self> {
        let storage = directory.storage();
        let mut bitmaps = BTreeMap::new();

        for segment in directory.iter_segments() {
            let mut bitmap = DeletionBitmap::new(segment.doc_count());
            for info in catalog.deletion.get(&segment.segment_id()).into_iter().flatten() {
                let generation = DeletionBitmap::load(storage.as_ref(), &info.path)?;
                if generation.len() > segment.doc_count() {
                    return Err(TesseraError::corrupt(format!(
                        "{} covers {} docs, segment {} has {}",
                        info.path,
                        generation.len(),
                        segment.segment_id(),
                        segment.doc_count()
                    )));
                }
                bitmap.union_with(&generation);
            }
            bitmaps.insert(segment.segment_id(), bitmap);
        }

        Ok(DeletionMapReader {
            directory: directory.clone(),
            bitmaps,
        })
    }

    pub fn directory(&self) -> &SegmentDirectory {
        &self.directory
    }

    pub fn is_deleted(&self, global_doc_id: DocId) -> bool {
        self.directory
            .locate(global_doc_id)
            .is_some_and(|(segment_id, local)| self.is_deleted_in_segment(segment_id, local))
    }

    pub fn is_deleted_in_segment(&self, segment_id: SegmentId, local_doc_id: DocId) -> bool {
        self.bitmaps
            .get(&segment_id)
            .is_some_and(|bitmap| bitmap.is_deleted(local_doc_id))
    }

    pub fn bitmap(&self, segment_id: SegmentId) -> Option<&DeletionBitmap> {
        self.bitmaps.get(&segment_id)
    }

    pub fn deleted_count(&self, segment_id: SegmentId) -> u32 {
        self.bitmaps
            .get(&segment_id)
            .map_or(0, DeletionBitmap::deleted_count)
    }

    pub fn total_deleted_count(&self) -> u64 {
        self.bitmaps.values().map(|b| b.deleted_count() as u64).sum()
    }

    pub(crate) fn into_bitmaps(self) -> BTreeMap<SegmentId, DeletionBitmap> {
        self.bitmaps
    }
}
