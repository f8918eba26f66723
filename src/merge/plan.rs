//! What a merge consumes and produces.

use serde::Serialize;

use crate::segment::id::{DocId, SegmentId};

/// A source segment of a merge.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SegmentMergeInfo {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    pub deleted_count: u32,
    /// Base doc id in the version the merge started from.
    pub base_doc_id: DocId,
}

impl SegmentMergeInfo {
    pub fn live_count(&self) -> u32 {
        self.doc_count - self.deleted_count
    }
}

/// An output segment of a merge, filled in once the reclaim map is known.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSegmentMergeInfo {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    /// Base doc id among the merge outputs.
    pub base_doc_id: DocId,
}

/// Which segments to merge, as chosen by a merge policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MergePlan {
    sources: Vec<SegmentMergeInfo>,
    /// Split outputs at this many documents.
    pub max_docs_per_output: Option<u32>,
}

impl MergePlan {
    pub fn new() -> Self {
        MergePlan::default()
    }

    /// Add a source; sources are kept in ascending segment id order.
    pub fn add_source(&mut self, info: SegmentMergeInfo) {
        let at = self
            .sources
            .partition_point(|s| s.segment_id < info.segment_id);
        if self.sources.get(at).is_some_and(|s| s.segment_id == info.segment_id) {
            return;
        }
        self.sources.insert(at, info);
    }

    pub fn with_max_docs_per_output(mut self, max_docs: Option<u32>) -> Self {
        self.max_docs_per_output = max_docs;
        self
    }

    pub fn sources(&self) -> &[SegmentMergeInfo] {
        &self.sources
    }

    pub fn source_ids(&self) -> Vec<SegmentId> {
        self.sources.iter().map(|s| s.segment_id).collect()
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.sources.iter().any(|s| s.segment_id == segment_id)
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    pub fn total_doc_count(&self) -> u64 {
        self.sources.iter().map(|s| s.doc_count as u64).sum()
    }

    pub fn live_doc_count(&self) -> u64 {
        self.sources.iter().map(|s| s.live_count() as u64).sum()
    }
}
