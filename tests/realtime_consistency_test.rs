use std::sync::Arc;

use tessera::config::PartitionOptions;
use tessera::partition::IndexPartition;
use tessera::schema::{AttributeValue, Document, FieldType, Schema};
use tessera::storage::{MemoryStorage, Storage};

fn text(value: &str) -> Option<AttributeValue> {
    Some(AttributeValue::String(value.to_string()))
}

/// Segment 0 holds docs 0..4. Segment 1 deletes doc 1 and retitles doc 2,
/// segment 2 deletes doc 0 and retitles doc 3.
fn build() -> Arc<dyn Storage> {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    let schema = Schema::builder()
        .add_field("title", FieldType::String)
        .unwrap()
        .build();
    let partition =
        IndexPartition::create(Arc::clone(&storage), &schema, PartitionOptions::default())
            .unwrap();

    let mut writer = partition.writer().unwrap();
    for i in 0..4 {
        writer
            .add_document(Document::new().with("title", format!("t{i}")))
            .unwrap();
    }
    writer.commit().unwrap();

    assert!(writer.delete_document(1));
    writer.update_field(2, "title", text("one")).unwrap();
    writer.commit().unwrap();

    assert!(writer.delete_document(0));
    writer.update_field(3, "title", text("two")).unwrap();
    let version = writer.commit().unwrap();
    assert_eq!(version.segment_ids(), vec![0, 1, 2]);
    storage
}

#[test]
fn test_everything_applies_without_realtime_consistency() {
    let storage = build();
    let partition = IndexPartition::open(storage, PartitionOptions::default()).unwrap();
    let reader = partition.reader().unwrap();

    assert!(reader.is_deleted(0));
    assert!(reader.is_deleted(1));
    assert_eq!(reader.live_doc_count(), 2);
    assert_eq!(reader.get_value(2, "title").unwrap().cloned(), text("one"));
    assert_eq!(reader.get_value(3, "title").unwrap().cloned(), text("two"));
}

#[test]
fn test_realtime_consistency_hides_older_patches_and_deletes() {
    let storage = build();
    let options = PartitionOptions::default().with_realtime_consistency(2);
    let partition = IndexPartition::open(storage, options).unwrap();
    let reader = partition.reader().unwrap();

    // Segment 1 is older than the first realtime segment.
    assert!(!reader.is_deleted(1));
    assert_eq!(reader.get_value(2, "title").unwrap().cloned(), text("t2"));

    // Segment 2 is loaded.
    assert!(reader.is_deleted(0));
    assert_eq!(reader.get_value(3, "title").unwrap().cloned(), text("two"));
    assert_eq!(reader.live_doc_count(), 3);
    assert!(reader.get_document(1).unwrap().is_some());
}

#[test]
fn test_realtime_consistency_from_first_segment_keeps_everything() {
    let storage = build();
    let options = PartitionOptions::default().with_realtime_consistency(0);
    let partition = IndexPartition::open(storage, options).unwrap();
    let reader = partition.reader().unwrap();

    assert!(reader.is_deleted(1));
    assert_eq!(reader.get_value(2, "title").unwrap().cloned(), text("one"));
}
