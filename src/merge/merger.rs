//! Partition merge: turns a policy's plan into merged segments and a new
//! version.
//!
//! The merge reads a pinned snapshot and never touches it. Output segment
//! ids are reserved on disk before any file is written, so concurrent
//! commits allocate around them. Files written by retired segments for
//! segments outside the merge (deletion maps and patches) are carried into
//! the first output. The final commit happens under the partition commit
//! lock against the latest version and is refused when a source was retired
//! or received new deletes or patches in the meantime.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use serde::Serialize;

use crate::attribute::merger::AttributeMergeWorkItem;
use crate::config::PartitionOptions;
use crate::deletion::{DeletionMapMerger, DeletionMapReader};
use crate::error::{Result, TesseraError};
use crate::merge::file_system::MergeFileSystem;
use crate::merge::plan::{MergePlan, OutputSegmentMergeInfo, SegmentMergeInfo};
use crate::merge::policy::{MergePolicy, MergePolicyRegistry};
use crate::merge::reclaim::ReclaimMap;
use crate::merge::resource::{MergeTaskResourceManager, ResourceId};
use crate::merge::thread_pool::{SchedulerStats, create_scheduler};
use crate::merge::truncate::MultiTruncateWriterScheduler;
use crate::merge::work_item::{FnWorkItem, MergeWorkItem};
use crate::patch::file::{PatchFileName, PatchFileWriter};
use crate::patch::finder::{PatchCatalog, PatchFileFinder, PatchFileInfo};
use crate::patch::reader::AttributePatchReader;
use crate::schema::{FieldConfig, Schema, SchemaId};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{SegmentId, VersionId, segment_dir_name};
use crate::segment::info::{SEGMENT_INFO_FILE, SegmentInfo};
use crate::segment::tracker::VersionTracker;
use crate::segment::version::Version;
use crate::storage::Storage;

/// What a merge produced.
#[derive(Debug, Clone, Serialize)]
pub struct MergeResult {
    pub version_id: VersionId,
    pub merged_segments: Vec<SegmentId>,
    pub output_segments: Vec<OutputSegmentMergeInfo>,
    /// Non-merged segments whose deletion maps moved into the first output.
    pub carried_deletions: Vec<SegmentId>,
    /// `(field, target)` pairs whose patches moved into the first output.
    pub carried_patches: Vec<(String, SegmentId)>,
    pub removed_docs: u64,
    pub scheduler: SchedulerStats,
    pub elapsed_ms: u64,
}

pub struct PartitionMerger {
    storage: Arc<dyn Storage>,
    options: PartitionOptions,
    commit_lock: Arc<Mutex<()>>,
    tracker: VersionTracker,
}

impl std::fmt::Debug for PartitionMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionMerger")
            .field("storage", &self.storage)
            .field("policy", &self.options.merge.policy)
            .finish()
    }
}

/// Output ids reserved on disk; released or removed on every exit path.
struct Reservation<'a> {
    storage: &'a dyn Storage,
    segment_ids: Vec<SegmentId>,
    committed: bool,
}

impl Reservation<'_> {
    fn release(&mut self) {
        for &segment_id in &self.segment_ids {
            if let Err(e) = SegmentDirectory::release_segment_id(self.storage, segment_id) {
                log::warn!("failed to release merge reservation of segment {segment_id}: {e}");
            }
        }
        self.segment_ids.clear();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if self.committed {
            self.release();
            return;
        }
        for &segment_id in &self.segment_ids {
            match self.storage.delete_dir(&segment_dir_name(segment_id)) {
                Ok(removed) => {
                    log::info!("discarded {removed} files of aborted merge output {segment_id}")
                }
                Err(e) => log::warn!("failed to discard merge output {segment_id}: {e}"),
            }
        }
    }
}

impl PartitionMerger {
    pub fn new(
        storage: Arc<dyn Storage>,
        options: PartitionOptions,
        commit_lock: Arc<Mutex<()>>,
        tracker: VersionTracker,
    ) -> Self {
        PartitionMerger {
            storage,
            options,
            commit_lock,
            tracker,
        }
    }

    /// Merge the latest version with the configured policy. `None` when
    /// the policy found nothing to do.
    pub fn merge(&self, registry: &MergePolicyRegistry) -> Result<Option<MergeResult>> {
        let policy = registry.create(&self.options.merge.policy, &self.options.merge.policy_params)?;
        let snapshot = SegmentDirectory::load(Arc::clone(&self.storage), &self.options)?;
        self.merge_with_policy(&snapshot, policy.as_ref())
    }

    pub fn merge_with_policy(
        &self,
        snapshot: &SegmentDirectory,
        policy: &dyn MergePolicy,
    ) -> Result<Option<MergeResult>> {
        let _pin = self.tracker.pin(snapshot.version().version_id());
        let deletions = DeletionMapReader::open(snapshot)?;
        let infos: Vec<SegmentMergeInfo> = snapshot
            .iter_segments()
            .map(|segment| SegmentMergeInfo {
                segment_id: segment.segment_id(),
                doc_count: segment.doc_count(),
                deleted_count: deletions.deleted_count(segment.segment_id()),
                base_doc_id: segment.base_doc_id(),
            })
            .collect();

        let Some(plan) = policy.create_plan(&infos) else {
            log::info!(
                "merge policy {} found nothing to merge in version {}",
                policy.name(),
                snapshot.version().version_id()
            );
            return Ok(None);
        };
        let plan = plan.with_max_docs_per_output(self.options.merge.max_docs_per_output_segment);
        self.execute(snapshot, plan, &deletions).map(Some)
    }

    /// Run `plan` against `snapshot`, whose deletes are `deletions`.
    pub fn execute(
        &self,
        snapshot: &SegmentDirectory,
        plan: MergePlan,
        deletions: &DeletionMapReader,
    ) -> Result<MergeResult> {
        let start = Instant::now();
        if plan.is_empty() {
            return Err(TesseraError::invalid_argument("merge plan has no sources"));
        }
        for source in plan.sources() {
            if !snapshot.version().contains(source.segment_id) {
                return Err(TesseraError::invalid_argument(format!(
                    "merge source {} is not in version {}",
                    source.segment_id,
                    snapshot.version().version_id()
                )));
            }
        }
        let _pin = self.tracker.pin(snapshot.version().version_id());
        let source_ids = plan.source_ids();
        log::info!(
            "merging segments {source_ids:?} of version {} ({} of {} docs live)",
            snapshot.version().version_id(),
            plan.live_doc_count(),
            plan.total_doc_count()
        );

        let schema = Schema::load_by_id(&*self.storage, snapshot.version().schema_id())?;
        let catalog = PatchFileFinder::find(snapshot)?;
        let reclaim = ReclaimMap::build(&plan, deletions);

        let mut reservation = self.reserve_outputs(snapshot, reclaim.output_count())?;
        let outputs = reclaim.output_infos(&reservation.segment_ids);

        let resource = Arc::new(MergeTaskResourceManager::new());
        let reclaim_bytes = reclaim.memory_usage();
        let reclaim_id = resource.declare(reclaim, reclaim_bytes);
        let file_system = Arc::new(MergeFileSystem::new(Arc::clone(&self.storage)));

        let carried_deletions = carried_deletion_targets(&catalog, snapshot, &plan);
        let carried_patches = carried_patch_targets(&catalog, snapshot, &plan);

        let mut items: Vec<Box<dyn MergeWorkItem>> = Vec::new();
        for field in schema.fields() {
            items.push(Box::new(AttributeMergeWorkItem::new(
                field.clone(),
                snapshot.clone(),
                catalog
                    .attribute_patches(&field.name)
                    .cloned()
                    .unwrap_or_default(),
                source_ids.clone(),
                outputs.clone(),
                Arc::clone(&resource),
                reclaim_id,
                Arc::clone(&file_system),
            )));
        }
        items.push(self.deletion_work_item(
            deletions,
            &carried_deletions,
            &plan,
            &outputs,
            &resource,
            reclaim_id,
            &file_system,
        )?);
        for (field_name, target) in &carried_patches {
            let Some(field) = schema.field_by_name(field_name).cloned() else {
                log::warn!("dropping patches of unknown field {field_name} for segment {target}");
                continue;
            };
            let infos = catalog
                .attribute_patches(field_name)
                .and_then(|p| p.get(target))
                .cloned()
                .unwrap_or_default();
            items.push(carry_patch_work_item(
                field,
                *target,
                infos,
                outputs[0].segment_id,
                Arc::clone(&self.storage),
                Arc::clone(&file_system),
            ));
        }

        let scheduler = create_scheduler(&self.options.merge);
        let stats = scheduler.run(items, &file_system)?;
        resource.release(reclaim_id);

        self.write_segment_infos(&outputs, &source_ids, schema.schema_id(), &file_system)?;
        file_system.commit_all()?;

        let version = match self.commit(
            snapshot,
            &source_ids,
            &outputs,
            &carried_deletions,
            &carried_patches,
        ) {
            Ok(version) => version,
            Err(e) => {
                // Outputs referenced by a stored version must survive.
                reservation.committed = self.is_published(&outputs);
                return Err(e);
            }
        };
        reservation.committed = true;
        reservation.release();

        let result = MergeResult {
            version_id: version.version_id(),
            merged_segments: source_ids,
            output_segments: outputs,
            carried_deletions,
            carried_patches,
            removed_docs: plan.total_doc_count() - plan.live_doc_count(),
            scheduler: stats,
            elapsed_ms: start.elapsed().as_millis() as u64,
        };
        log::info!(
            "merge committed version {} with outputs {:?} in {} ms",
            result.version_id,
            result
                .output_segments
                .iter()
                .map(|o| o.segment_id)
                .collect::<Vec<_>>(),
            result.elapsed_ms
        );
        Ok(result)
    }

    fn reserve_outputs(
        &self,
        snapshot: &SegmentDirectory,
        count: usize,
    ) -> Result<Reservation<'_>> {
        let _guard = self.commit_lock.lock();
        let first = snapshot.next_segment_id()?;
        let mut reservation = Reservation {
            storage: &*self.storage,
            segment_ids: Vec::with_capacity(count),
            committed: false,
        };
        for offset in 0..count {
            let segment_id = first + offset as SegmentId;
            SegmentDirectory::reserve_segment_id(&*self.storage, segment_id)?;
            reservation.segment_ids.push(segment_id);
        }
        log::debug!("reserved merge outputs {:?}", reservation.segment_ids);
        Ok(reservation)
    }

    #[allow(clippy::too_many_arguments)]
    fn deletion_work_item(
        &self,
        deletions: &DeletionMapReader,
        carried: &[SegmentId],
        plan: &MergePlan,
        outputs: &[OutputSegmentMergeInfo],
        resource: &Arc<MergeTaskResourceManager>,
        reclaim_id: ResourceId,
        file_system: &Arc<MergeFileSystem>,
    ) -> Result<Box<dyn MergeWorkItem>> {
        let mut merger = DeletionMapMerger::new();
        for &target in carried {
            let bitmap = deletions.bitmap(target).cloned().ok_or_else(|| {
                TesseraError::internal(format!("no deletion map for carried segment {target}"))
            })?;
            merger.carry(target, bitmap);
        }
        let bytes = outputs.iter().map(|o| o.doc_count as u64 / 8 + 1).sum::<u64>()
            + carried
                .iter()
                .filter_map(|t| deletions.bitmap(*t))
                .map(|b| b.len() as u64 / 8 + 1)
                .sum::<u64>();

        let sources = plan.sources().to_vec();
        let outputs = outputs.to_vec();
        let resource = Arc::clone(resource);
        let file_system = Arc::clone(file_system);
        Ok(FnWorkItem::boxed("deletionmap", bytes, move || {
            merger.merge(&resource, reclaim_id, &sources, &outputs, &file_system)
        }))
    }

    fn write_segment_infos(
        &self,
        outputs: &[OutputSegmentMergeInfo],
        sources: &[SegmentId],
        schema_id: SchemaId,
        file_system: &Arc<MergeFileSystem>,
    ) -> Result<()> {
        let mut writer = MultiTruncateWriterScheduler::new(
            self.options.merge.truncate_thread_count,
            self.options.merge.truncate_queue_capacity,
        );
        for output in outputs {
            let info = SegmentInfo::merged_from(output.doc_count, schema_id, sources.to_vec());
            let path = format!("{}/{SEGMENT_INFO_FILE}", segment_dir_name(output.segment_id));
            let file_system = Arc::clone(file_system);
            writer.push_work_item(FnWorkItem::boxed(
                format!("segment_info:{}", output.segment_id),
                0,
                move || file_system.stage(&path, |storage, staged| info.store_at(storage, staged)),
            ))?;
        }
        writer.wait_finished()?;
        Ok(())
    }

    fn is_published(&self, outputs: &[OutputSegmentMergeInfo]) -> bool {
        match Version::load_latest(&*self.storage) {
            Ok(latest) => outputs.iter().any(|o| latest.contains(o.segment_id)),
            Err(_) => true,
        }
    }

    /// Publish the merge on top of the latest version.
    ///
    /// Refused when a segment committed after `snapshot` holds a deletion or
    /// patch file for a source or for a carried target. Carried files are
    /// held by an output whose id outranks that segment, so publishing would
    /// let the folded snapshot state hide the newer record.
    fn commit(
        &self,
        snapshot: &SegmentDirectory,
        sources: &[SegmentId],
        outputs: &[OutputSegmentMergeInfo],
        carried_deletions: &[SegmentId],
        carried_patches: &[(String, SegmentId)],
    ) -> Result<Version> {
        let _guard = self.commit_lock.lock();
        let mut latest = SegmentDirectory::load(Arc::clone(&self.storage), &self.options)?;

        for &source in sources {
            if !latest.version().contains(source) {
                return Err(TesseraError::invalid_operation(format!(
                    "merge source {source} was retired by version {}",
                    latest.version().version_id()
                )));
            }
        }
        let latest_catalog = PatchFileFinder::find(&latest)?;
        let newcomer = all_files(&latest_catalog).find(|info| {
            sources.contains(&info.target_segment_id())
                && !snapshot.version().contains(info.src_segment_id())
        });
        if let Some(info) = newcomer {
            return Err(TesseraError::invalid_operation(format!(
                "merge source {} received {} after version {}",
                info.target_segment_id(),
                info.path,
                snapshot.version().version_id()
            )));
        }

        let is_new = |info: &&PatchFileInfo| !snapshot.version().contains(info.src_segment_id());
        let carried_deletion = carried_deletions.iter().find_map(|target| {
            latest_catalog
                .deletion
                .get(target)
                .and_then(|infos| infos.iter().find(|info| is_new(info)))
        });
        let carried_patch = carried_patches.iter().find_map(|(field, target)| {
            latest_catalog
                .attribute_patches(field)
                .and_then(|p| p.get(target))
                .and_then(|infos| infos.iter().find(|info| is_new(info)))
        });
        if let Some(info) = carried_deletion.or(carried_patch) {
            return Err(TesseraError::invalid_operation(format!(
                "carried segment {} received {} after version {}",
                info.target_segment_id(),
                info.path,
                snapshot.version().version_id()
            )));
        }

        let output_ids: Vec<SegmentId> = outputs.iter().map(|o| o.segment_id).collect();
        latest.commit(&output_ids, sources, &self.options)
    }
}

fn all_files(catalog: &PatchCatalog) -> impl Iterator<Item = &PatchFileInfo> {
    catalog
        .attribute
        .values()
        .flat_map(|infos| infos.values().flatten())
        .chain(catalog.deletion.values().flatten())
}

/// Live segments outside the merge with a deletion file held by a source.
fn carried_deletion_targets(
    catalog: &PatchCatalog,
    snapshot: &SegmentDirectory,
    plan: &MergePlan,
) -> Vec<SegmentId> {
    let targets: BTreeSet<SegmentId> = catalog
        .deletion
        .iter()
        .filter(|(target, infos)| {
            !plan.contains(**target)
                && snapshot.version().contains(**target)
                && infos.iter().any(|i| plan.contains(i.src_segment_id()))
        })
        .map(|(target, _)| *target)
        .collect();
    targets.into_iter().collect()
}

/// `(field, target)` pairs outside the merge with a patch held by a source.
fn carried_patch_targets(
    catalog: &PatchCatalog,
    snapshot: &SegmentDirectory,
    plan: &MergePlan,
) -> Vec<(String, SegmentId)> {
    let mut targets = Vec::new();
    for (field, infos) in &catalog.attribute {
        for (target, files) in infos {
            if !plan.contains(*target)
                && snapshot.version().contains(*target)
                && files.iter().any(|i| plan.contains(i.src_segment_id()))
            {
                targets.push((field.clone(), *target));
            }
        }
    }
    targets
}

/// Fold every patch generation of `target` into one file held by `dest`,
/// ranked with the highest operation id among them.
fn carry_patch_work_item(
    field: FieldConfig,
    target: SegmentId,
    infos: Vec<PatchFileInfo>,
    dest: SegmentId,
    storage: Arc<dyn Storage>,
    file_system: Arc<MergeFileSystem>,
) -> Box<dyn MergeWorkItem> {
    let bytes = infos.len() as u64 * 64 * 1024;
    FnWorkItem::boxed(format!("carry:{}:{target}", field.name), bytes, move || {
        let operation_id = infos.iter().map(|i| i.name.operation_id).max().unwrap_or(0);
        let name = PatchFileName::new(dest, target, operation_id);
        let mut reader =
            AttributePatchReader::open(storage.as_ref(), target, field.field_type, &infos)?;
        let mut writer = PatchFileWriter::new(field.field_type, name);
        while let Some((doc_id, value)) = reader.next_value()? {
            writer.add(doc_id, value.as_ref())?;
        }
        if writer.is_empty() {
            return Ok(());
        }
        file_system.stage(&name.path(&field.name), |s, staged| writer.write(s, staged))
    })
}
