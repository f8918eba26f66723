//! Merge of one attribute field.

use std::sync::Arc;

use ahash::AHashMap;

use crate::attribute::column::AttributeColumnWriter;
use crate::attribute::reader::{SegmentAttributeReader, column_path};
use crate::error::{Result, TesseraError};
use crate::merge::file_system::MergeFileSystem;
use crate::merge::plan::OutputSegmentMergeInfo;
use crate::merge::reclaim::ReclaimMap;
use crate::merge::resource::{MergeTaskResourceManager, ResourceId};
use crate::merge::work_item::MergeWorkItem;
use crate::patch::finder::PatchInfos;
use crate::schema::FieldConfig;
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{SegmentId, segment_dir_name};

const VARIABLE_VALUE_ESTIMATE: u64 = 32;

/// Rewrites one field of the merge sources into the outputs, in reclaim
/// map order, with every patch of the sources folded in.
#[derive(Debug)]
pub struct AttributeMergeWorkItem {
    name: String,
    field: FieldConfig,
    snapshot: SegmentDirectory,
    patches: PatchInfos,
    sources: Vec<SegmentId>,
    outputs: Vec<OutputSegmentMergeInfo>,
    resource: Arc<MergeTaskResourceManager>,
    reclaim_map: ResourceId,
    file_system: Arc<MergeFileSystem>,
}

impl AttributeMergeWorkItem {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        field: FieldConfig,
        snapshot: SegmentDirectory,
        patches: PatchInfos,
        sources: Vec<SegmentId>,
        outputs: Vec<OutputSegmentMergeInfo>,
        resource: Arc<MergeTaskResourceManager>,
        reclaim_map: ResourceId,
        file_system: Arc<MergeFileSystem>,
    ) -> Self {
        AttributeMergeWorkItem {
            name: format!("attribute:{}", field.name),
            field,
            snapshot,
            patches,
            sources,
            outputs,
            resource,
            reclaim_map,
            file_system,
        }
    }

    fn source_doc_count(&self) -> u64 {
        self.sources
            .iter()
            .filter_map(|id| self.snapshot.get_segment_data(*id))
            .map(|s| s.doc_count() as u64)
            .sum()
    }
}

impl MergeWorkItem for AttributeMergeWorkItem {
    fn name(&self) -> &str {
        &self.name
    }

    /// Decoded source values plus the output buffers.
    fn required_resource(&self) -> u64 {
        let per_value = self
            .field
            .field_type
            .fixed_size()
            .map_or(VARIABLE_VALUE_ESTIMATE, |size| size as u64 + 8);
        self.source_doc_count() * per_value * 2
    }

    fn process(&mut self) -> Result<()> {
        let reclaim = self.resource.require::<ReclaimMap>(self.reclaim_map)?;

        let mut readers = AHashMap::with_capacity(self.sources.len());
        for &segment_id in &self.sources {
            let segment = self.snapshot.get_segment_data(segment_id).ok_or_else(|| {
                TesseraError::internal(format!("merge source {segment_id} left the snapshot"))
            })?;
            let patches = self
                .patches
                .get(&segment_id)
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            readers.insert(
                segment_id,
                SegmentAttributeReader::open(&self.snapshot, segment, &self.field, patches)?,
            );
        }

        for (index, output) in self.outputs.iter().enumerate() {
            let mut writer = AttributeColumnWriter::new(self.field.field_type);
            for (segment_id, local) in reclaim.output_docs(index) {
                let reader = readers.get(segment_id).ok_or_else(|| {
                    TesseraError::internal(format!("no reader for merge source {segment_id}"))
                })?;
                writer.add(reader.get(*local))?;
            }
            let path = format!(
                "{}/{}",
                segment_dir_name(output.segment_id),
                column_path(&self.field.name)
            );
            self.file_system
                .stage(&path, |storage, staged| writer.write(storage, staged))?;
        }
        log::debug!(
            "merged field {} of segments {:?} into {} outputs",
            self.field.name,
            self.sources,
            self.outputs.len()
        );
        Ok(())
    }
}
