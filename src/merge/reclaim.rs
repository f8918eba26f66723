//! Doc id mapping from merge sources to merge outputs.
//!
//! Deleted documents are dropped. Surviving documents keep their relative
//! order and fill outputs one after another, each up to the configured
//! maximum.

use ahash::AHashMap;

use crate::deletion::DeletionMapReader;
use crate::merge::plan::{MergePlan, OutputSegmentMergeInfo};
use crate::segment::id::{DocId, SegmentId};

#[derive(Debug, Clone)]
pub struct ReclaimMap {
    /// Per source: `(output index, new local id)` or `None` when deleted.
    old_to_new: AHashMap<SegmentId, Vec<Option<(usize, DocId)>>>,
    /// Per output: `(source segment, old local id)` in new id order.
    new_to_old: Vec<Vec<(SegmentId, DocId)>>,
}

impl ReclaimMap {
    pub fn build(plan: &MergePlan, deletions: &DeletionMapReader) -> Self {
        let capacity = plan.max_docs_per_output.unwrap_or(u32::MAX).max(1) as usize;
        let mut old_to_new = AHashMap::with_capacity(plan.sources().len());
        let mut new_to_old: Vec<Vec<(SegmentId, DocId)>> = vec![Vec::new()];

        for source in plan.sources() {
            let mut mapping = Vec::with_capacity(source.doc_count as usize);
            for local in 0..source.doc_count {
                if deletions.is_deleted_in_segment(source.segment_id, local) {
                    mapping.push(None);
                    continue;
                }
                if new_to_old.last().is_some_and(|out| out.len() >= capacity) {
                    new_to_old.push(Vec::new());
                }
                let output = new_to_old.len() - 1;
                let new_local = new_to_old[output].len() as DocId;
                new_to_old[output].push((source.segment_id, local));
                mapping.push(Some((output, new_local)));
            }
            old_to_new.insert(source.segment_id, mapping);
        }

        ReclaimMap {
            old_to_new,
            new_to_old,
        }
    }

    /// Number of outputs; at least one even if nothing survives.
    pub fn output_count(&self) -> usize {
        self.new_to_old.len()
    }

    pub fn output_doc_count(&self, output: usize) -> u32 {
        self.new_to_old.get(output).map_or(0, |docs| docs.len() as u32)
    }

    pub fn live_doc_count(&self) -> u64 {
        self.new_to_old.iter().map(|docs| docs.len() as u64).sum()
    }

    /// New location of `(segment, local)`; `None` when it was deleted or is
    /// not part of the merge.
    pub fn map(&self, segment_id: SegmentId, local_doc_id: DocId) -> Option<(usize, DocId)> {
        self.old_to_new
            .get(&segment_id)?
            .get(local_doc_id as usize)
            .copied()
            .flatten()
    }

    /// Source documents of `output` in new doc id order.
    pub fn output_docs(&self, output: usize) -> &[(SegmentId, DocId)] {
        self.new_to_old.get(output).map_or(&[], Vec::as_slice)
    }

    /// Describe the outputs given their segment ids.
    pub fn output_infos(&self, segment_ids: &[SegmentId]) -> Vec<OutputSegmentMergeInfo> {
        let mut base = 0;
        segment_ids
            .iter()
            .enumerate()
            .map(|(output, &segment_id)| {
                let doc_count = self.output_doc_count(output);
                let info = OutputSegmentMergeInfo {
                    segment_id,
                    doc_count,
                    base_doc_id: base,
                };
                base += doc_count;
                info
            })
            .collect()
    }

    /// Rough size in bytes, used as a resource estimate.
    pub fn memory_usage(&self) -> u64 {
        let entries: usize = self.old_to_new.values().map(Vec::len).sum();
        (entries * std::mem::size_of::<Option<(usize, DocId)>>()
            + self.live_doc_count() as usize * std::mem::size_of::<(SegmentId, DocId)>())
            as u64
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::deletion::DeletionMapWriter;
    use crate::merge::plan::SegmentMergeInfo;
    use crate::segment::directory::SegmentDirectory;
    use crate::segment::info::SegmentInfo;
    use crate::segment::version::Version;
    use crate::storage::{MemoryStorage, Storage};

    fn load(storage: &Arc<dyn Storage>, segments: &[(SegmentId, u32)]) -> SegmentDirectory {
        let mut version = Version::new(0);
        for &(id, docs) in segments {
            SegmentInfo::new(docs, 0).store(storage.as_ref(), id).unwrap();
            version.add_segment(id);
        }
        SegmentDirectory::from_version(Arc::clone(storage), version, Default::default()).unwrap()
    }

    /// Segment 0 with 4 docs (1 deleted) and segment 1 with 3 docs (0 and 2
    /// deleted); the deletes are held by segment 2.
    fn setup() -> (MergePlan, DeletionMapReader) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let before = load(&storage, &[(0, 4), (1, 3)]);
        let mut writer = DeletionMapWriter::open(&before).unwrap();
        writer.delete_in_segment(0, 1);
        writer.delete_in_segment(1, 0);
        writer.delete_in_segment(1, 2);
        writer.dump(storage.as_ref(), 2).unwrap();

        let directory = load(&storage, &[(0, 4), (1, 3), (2, 0)]);
        let deletions = DeletionMapReader::open(&directory).unwrap();
        let mut plan = MergePlan::new();
        for segment in directory.iter_segments().take(2) {
            plan.add_source(SegmentMergeInfo {
                segment_id: segment.segment_id(),
                doc_count: segment.doc_count(),
                deleted_count: deletions.deleted_count(segment.segment_id()),
                base_doc_id: segment.base_doc_id(),
            });
        }
        (plan, deletions)
    }

    #[test]
    fn test_deleted_docs_are_dropped() {
        let (plan, deletions) = setup();
        let reclaim = ReclaimMap::build(&plan, &deletions);

        assert_eq!(reclaim.output_count(), 1);
        assert_eq!(reclaim.live_doc_count(), 4);
        assert_eq!(reclaim.map(0, 0), Some((0, 0)));
        assert_eq!(reclaim.map(0, 1), None);
        assert_eq!(reclaim.map(0, 3), Some((0, 2)));
        assert_eq!(reclaim.map(1, 1), Some((0, 3)));
        assert_eq!(reclaim.map(1, 2), None);
        assert_eq!(reclaim.map(7, 0), None);
        assert_eq!(reclaim.output_docs(0), &[(0, 0), (0, 2), (0, 3), (1, 1)]);
    }

    #[test]
    fn test_outputs_split_at_max_docs() {
        let (plan, deletions) = setup();
        let reclaim = ReclaimMap::build(&plan.with_max_docs_per_output(Some(3)), &deletions);

        assert_eq!(reclaim.output_count(), 2);
        assert_eq!(reclaim.map(1, 1), Some((1, 0)));
        let infos = reclaim.output_infos(&[5, 6]);
        assert_eq!(infos[0].doc_count, 3);
        assert_eq!((infos[1].segment_id, infos[1].doc_count, infos[1].base_doc_id), (6, 1, 3));
    }
}
