use std::sync::Arc;

use tessera::config::{PartitionOptions, SchedulerKind};
use tessera::deletion::DeletionMapReader;
use tessera::error::TesseraError;
use tessera::merge::{MergePlan, MergePolicyRegistry, SegmentMergeInfo};
use tessera::partition::IndexPartition;
use tessera::schema::{AttributeValue, Document, FieldType, Schema};
use tessera::segment::SegmentDirectory;
use tessera::storage::{MemoryStorage, Storage};

fn partition_with(options: PartitionOptions) -> IndexPartition {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let schema = Schema::builder()
        .add_field("title", FieldType::String)
        .unwrap()
        .add_field("price", FieldType::Int64)
        .unwrap()
        .build();
    IndexPartition::create(storage, &schema, options).unwrap()
}

fn doc(i: i64) -> Document {
    Document::new()
        .with("title", format!("t{i}"))
        .with("price", i * 10)
}

/// Segment 0 with docs 0..4, segment 1 with docs 4..7 which also deletes
/// doc 1 and retitles doc 2 in segment 0.
fn two_segments(partition: &IndexPartition) {
    let mut writer = partition.writer().unwrap();
    for i in 0..4 {
        writer.add_document(doc(i)).unwrap();
    }
    writer.commit().unwrap();
    for i in 4..7 {
        writer.add_document(doc(i)).unwrap();
    }
    writer.delete_document(1);
    writer
        .update_field(2, "title", Some(AttributeValue::String("patched".into())))
        .unwrap();
    writer.delete_document(5);
    writer.commit().unwrap();
}

fn title(partition: &IndexPartition, doc_id: u32) -> Option<AttributeValue> {
    partition
        .reader()
        .unwrap()
        .get_value(doc_id, "title")
        .unwrap()
        .cloned()
}

fn plan_for(snapshot: &SegmentDirectory, deletions: &DeletionMapReader, ids: &[i32]) -> MergePlan {
    let mut plan = MergePlan::new();
    for segment in snapshot.iter_segments() {
        if ids.contains(&segment.segment_id()) {
            plan.add_source(SegmentMergeInfo {
                segment_id: segment.segment_id(),
                doc_count: segment.doc_count(),
                deleted_count: deletions.deleted_count(segment.segment_id()),
                base_doc_id: segment.base_doc_id(),
            });
        }
    }
    plan
}

#[test]
fn test_optimize_merge_drops_deletes_and_folds_patches() {
    for scheduler in [SchedulerKind::Simple, SchedulerKind::ResourceControl] {
        let partition = partition_with(PartitionOptions::default().with_scheduler(scheduler));
        two_segments(&partition);

        let result = partition
            .merge(&MergePolicyRegistry::with_defaults())
            .unwrap()
            .unwrap();
        assert_eq!(result.merged_segments, vec![0, 1]);
        assert_eq!(result.output_segments.len(), 1);
        assert_eq!(result.output_segments[0].segment_id, 2);
        assert_eq!(result.output_segments[0].doc_count, 5);
        assert_eq!(result.removed_docs, 2);
        assert!(result.scheduler.failed.is_empty());

        let reader = partition.reader().unwrap();
        assert_eq!(reader.version().segment_ids(), vec![2]);
        assert_eq!(reader.doc_count(), 5);
        assert_eq!(reader.live_doc_count(), 5);

        // Survivors in order: 0, 2, 3, 4, 6.
        let titles: Vec<_> = (0..5)
            .map(|d| reader.get_value(d, "title").unwrap().cloned())
            .collect();
        assert_eq!(
            titles,
            ["t0", "patched", "t3", "t4", "t6"]
                .iter()
                .map(|t| Some(AttributeValue::String(t.to_string())))
                .collect::<Vec<_>>()
        );
        assert_eq!(
            reader.get_value(4, "price").unwrap(),
            Some(&AttributeValue::Int64(60))
        );
    }
}

#[test]
fn test_merge_carries_deletes_and_patches_of_other_segments() {
    let partition = partition_with(PartitionOptions::default());
    two_segments(&partition);

    let snapshot = partition.directory().unwrap();
    let deletions = DeletionMapReader::open(&snapshot).unwrap();
    let plan = plan_for(&snapshot, &deletions, &[1]);
    let result = partition.merger().execute(&snapshot, plan, &deletions).unwrap();

    assert_eq!(result.carried_deletions, vec![0]);
    assert_eq!(result.carried_patches, vec![("title".to_string(), 0)]);

    let reader = partition.reader().unwrap();
    assert_eq!(reader.version().segment_ids(), vec![0, 2]);
    assert_eq!(reader.doc_count(), 6);
    assert!(reader.is_deleted(1));
    assert_eq!(reader.live_doc_count(), 5);
    assert_eq!(
        reader.get_value(2, "title").unwrap(),
        Some(&AttributeValue::String("patched".into()))
    );
    // Segment 2 starts at global 4 and holds docs 4 and 6.
    assert_eq!(
        reader.get_value(5, "title").unwrap(),
        Some(&AttributeValue::String("t6".into()))
    );
    assert!(
        partition
            .storage()
            .file_exists("segment_2/deletionmap/data_0")
    );
    assert!(
        partition
            .storage()
            .file_exists("segment_2/attribute/title/2_0_0.patch")
    );

    // Once segment 1 is cleaned up the carried files keep the state alive.
    partition.cleanup().unwrap();
    let reader = partition.reader().unwrap();
    assert!(reader.is_deleted(1));
    assert_eq!(
        reader.get_value(2, "title").unwrap(),
        Some(&AttributeValue::String("patched".into()))
    );
}

#[test]
fn test_merge_splits_output() {
    let mut options = PartitionOptions::default();
    options.merge.max_docs_per_output_segment = Some(2);
    let partition = partition_with(options);
    two_segments(&partition);

    let result = partition
        .merge(&MergePolicyRegistry::with_defaults())
        .unwrap()
        .unwrap();
    let counts: Vec<u32> = result.output_segments.iter().map(|o| o.doc_count).collect();
    assert_eq!(counts, vec![2, 2, 1]);
    assert_eq!(
        partition.latest_version().unwrap().segment_ids(),
        vec![2, 3, 4]
    );
    assert_eq!(title(&partition, 4), Some(AttributeValue::String("t6".into())));
}

#[test]
fn test_nothing_to_merge() {
    let partition = partition_with(PartitionOptions::default());
    let mut writer = partition.writer().unwrap();
    writer.add_document(doc(0)).unwrap();
    writer.commit().unwrap();
    assert!(
        partition
            .merge(&MergePolicyRegistry::with_defaults())
            .unwrap()
            .is_none()
    );

    let mut options = PartitionOptions::default();
    options.merge.policy = "no_such_policy".to_string();
    let storage = Arc::clone(partition.storage());
    drop(writer);
    let partition = IndexPartition::open(storage, options).unwrap();
    assert!(matches!(
        partition.merge(&MergePolicyRegistry::with_defaults()),
        Err(TesseraError::InvalidArgument(_))
    ));
}

#[test]
fn test_merge_fails_when_source_changed_meanwhile() {
    let partition = partition_with(PartitionOptions::default());
    two_segments(&partition);

    let snapshot = partition.directory().unwrap();
    let deletions = DeletionMapReader::open(&snapshot).unwrap();
    let plan = plan_for(&snapshot, &deletions, &[0, 1]);

    // A delete against segment 0 lands after the merge took its snapshot.
    {
        let mut writer = partition.writer().unwrap();
        assert!(writer.delete_document(0));
        writer.commit().unwrap();
    }
    let latest_before = partition.latest_version().unwrap();

    let err = partition
        .merger()
        .execute(&snapshot, plan, &deletions)
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    // Nothing was published and the outputs are gone.
    assert_eq!(partition.latest_version().unwrap(), latest_before);
    let leftovers: Vec<String> = partition
        .storage()
        .list_files()
        .unwrap()
        .into_iter()
        .filter(|f| f.starts_with("segment_3/") || f.starts_with("_merge/"))
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    assert!(partition.reader().unwrap().is_deleted(0));
}

#[test]
fn test_merge_refuses_to_fold_over_newer_patch_of_carried_segment() {
    let partition = partition_with(PartitionOptions::default());
    two_segments(&partition);

    let snapshot = partition.directory().unwrap();
    let deletions = DeletionMapReader::open(&snapshot).unwrap();
    let plan = plan_for(&snapshot, &deletions, &[1]);

    // Segment 0 is not merged but segment 1 holds a patch for it. A newer
    // patch for the same doc lands before the merge reserves its outputs.
    {
        let mut writer = partition.writer().unwrap();
        writer
            .update_field(2, "title", Some(AttributeValue::String("newest".into())))
            .unwrap();
        writer.commit().unwrap();
    }
    let latest_before = partition.latest_version().unwrap();

    let err = partition
        .merger()
        .execute(&snapshot, plan, &deletions)
        .unwrap_err();
    assert!(matches!(err, TesseraError::InvalidOperation(_)));

    assert_eq!(partition.latest_version().unwrap(), latest_before);
    assert_eq!(title(&partition, 2), Some(AttributeValue::String("newest".into())));
    assert!(
        partition
            .storage()
            .list_files()
            .unwrap()
            .iter()
            .all(|f| !f.starts_with("segment_3/"))
    );

    // A merge planned on the new version goes through and keeps the value.
    partition
        .merge(&MergePolicyRegistry::with_defaults())
        .unwrap()
        .unwrap();
    assert_eq!(title(&partition, 2), Some(AttributeValue::String("newest".into())));
}

#[test]
fn test_merge_refuses_when_carried_segment_gets_newer_delete() {
    let partition = partition_with(PartitionOptions::default());
    two_segments(&partition);

    let snapshot = partition.directory().unwrap();
    let deletions = DeletionMapReader::open(&snapshot).unwrap();
    let plan = plan_for(&snapshot, &deletions, &[1]);
    {
        let mut writer = partition.writer().unwrap();
        assert!(writer.delete_document(3));
        writer.commit().unwrap();
    }
    assert!(matches!(
        partition.merger().execute(&snapshot, plan, &deletions),
        Err(TesseraError::InvalidOperation(_))
    ));

    let reader = partition.reader().unwrap();
    assert!(reader.is_deleted(1));
    assert!(reader.is_deleted(3));
}

#[test]
fn test_writer_commit_fails_when_target_was_merged_away() {
    let partition = partition_with(PartitionOptions::default());
    let mut writer = partition.writer().unwrap();
    for i in 0..3 {
        writer.add_document(doc(i)).unwrap();
        writer.commit().unwrap();
    }

    partition
        .merge(&MergePolicyRegistry::with_defaults())
        .unwrap()
        .unwrap();

    // The writer still sees segments 0..3 and deletes in segment 0.
    assert!(writer.delete_document(0));
    assert!(matches!(
        writer.commit(),
        Err(TesseraError::InvalidOperation(_))
    ));
    assert!(writer.has_pending_changes());
    drop(writer);

    // A fresh writer works against the merged version.
    let mut writer = partition.writer().unwrap();
    assert!(writer.delete_document(0));
    writer.commit().unwrap();
    assert!(partition.reader().unwrap().is_deleted(0));
}

#[test]
fn test_merge_after_alter_keeps_converted_values() {
    let partition = partition_with(PartitionOptions::default());
    two_segments(&partition);
    partition.alter_field("price", FieldType::String).unwrap();

    partition
        .merge(&MergePolicyRegistry::with_defaults())
        .unwrap()
        .unwrap();
    let reader = partition.reader().unwrap();
    assert_eq!(reader.schema().schema_id(), 1);
    assert_eq!(
        reader.get_value(0, "price").unwrap(),
        Some(&AttributeValue::String("0".into()))
    );
    assert_eq!(
        reader.get_value(4, "price").unwrap(),
        Some(&AttributeValue::String("60".into()))
    );
}
