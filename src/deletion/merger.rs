//! Deletion maps of merge outputs and of segments left outside a merge.

use std::collections::BTreeMap;

use crate::deletion::bitmap::DeletionBitmap;
use crate::error::{Result, TesseraError};
use crate::merge::file_system::MergeFileSystem;
use crate::merge::plan::{OutputSegmentMergeInfo, SegmentMergeInfo};
use crate::merge::reclaim::ReclaimMap;
use crate::merge::resource::{MergeTaskResourceManager, ResourceId};
use crate::patch::finder::deletion_file_name;
use crate::segment::id::{SegmentId, segment_dir_name};

/// Writes the deletion maps of merge outputs.
///
/// Merged documents that were deleted are not copied at all, so every
/// output starts with a clean bitmap sized to its final doc count. Segments
/// outside the merge whose deletion files lived in a merged segment get
/// their effective bitmap carried into the first output.
#[derive(Debug, Default)]
pub struct DeletionMapMerger {
    carried: BTreeMap<SegmentId, DeletionBitmap>,
}

impl DeletionMapMerger {
    pub fn new() -> Self {
        DeletionMapMerger::default()
    }

    /// Carry the bitmap of a segment that stays outside the merge.
    pub fn carry(&mut self, segment_id: SegmentId, bitmap: DeletionBitmap) {
        self.carried.insert(segment_id, bitmap);
    }

    pub fn carried_segments(&self) -> Vec<SegmentId> {
        self.carried.keys().copied().collect()
    }

    pub fn merge(
        &self,
        resource: &MergeTaskResourceManager,
        reclaim_map: ResourceId,
        segment_merge_infos: &[SegmentMergeInfo],
        output_segment_merge_infos: &[OutputSegmentMergeInfo],
        file_system: &MergeFileSystem,
    ) -> Result<()> {
        let reclaim = resource.require::<ReclaimMap>(reclaim_map)?;

        for source in segment_merge_infos {
            if source.deleted_count > source.doc_count {
                return Err(TesseraError::corrupt(format!(
                    "segment {} has {} deletes for {} docs",
                    source.segment_id, source.deleted_count, source.doc_count
                )));
            }
        }

        for (index, output) in output_segment_merge_infos.iter().enumerate() {
            if reclaim.output_doc_count(index) != output.doc_count {
                return Err(TesseraError::internal(format!(
                    "output segment {} expects {} docs, reclaim map has {}",
                    output.segment_id,
                    output.doc_count,
                    reclaim.output_doc_count(index)
                )));
            }
            let bitmap = DeletionBitmap::new(output.doc_count);
            let path = format!(
                "{}/{}",
                segment_dir_name(output.segment_id),
                deletion_file_name(output.segment_id)
            );
            file_system.stage(&path, |storage, staged| bitmap.store(storage, staged))?;
        }

        if let Some(first) = output_segment_merge_infos.first() {
            for (&target, bitmap) in &self.carried {
                if target >= first.segment_id {
                    return Err(TesseraError::internal(format!(
                        "cannot carry deletes of segment {target} into older segment {}",
                        first.segment_id
                    )));
                }
                let path = format!(
                    "{}/{}",
                    segment_dir_name(first.segment_id),
                    deletion_file_name(target)
                );
                file_system.stage(&path, |storage, staged| bitmap.store(storage, staged))?;
            }
        }

        log::debug!(
            "merged deletion maps of {} segments into {} outputs, carried {:?}",
            segment_merge_infos.len(),
            output_segment_merge_infos.len(),
            self.carried_segments()
        );
        Ok(())
    }
}
