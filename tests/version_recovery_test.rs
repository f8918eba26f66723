use std::sync::Arc;

use tessera::config::PartitionOptions;
use tessera::error::TesseraError;
use tessera::format::{INDEX_FORMAT_VERSION_FILE, IndexFormatVersion};
use tessera::partition::IndexPartition;
use tessera::schema::{Document, FieldType, Schema};
use tessera::segment::Version;
use tessera::storage::{MemoryStorage, Storage};

/// A partition with three versions: 0 (empty), 1 and 2 (one doc each).
fn setup() -> (Arc<MemoryStorage>, IndexPartition) {
    let memory = Arc::new(MemoryStorage::new_default());
    let storage: Arc<dyn Storage> = memory.clone();
    let schema = Schema::builder()
        .add_field("n", FieldType::Int32)
        .unwrap()
        .build();
    let partition = IndexPartition::create(storage, &schema, PartitionOptions::default()).unwrap();
    let mut writer = partition.writer().unwrap();
    for i in 0..2 {
        writer.add_document(Document::new().with("n", i)).unwrap();
        writer.commit().unwrap();
    }
    (memory, partition)
}

fn reopen(memory: &Arc<MemoryStorage>, options: PartitionOptions) -> tessera::error::Result<IndexPartition> {
    let storage: Arc<dyn Storage> = memory.clone();
    IndexPartition::open(storage, options)
}

#[test]
fn test_unpublished_version_is_ignored_and_cleaned() {
    let (memory, partition) = setup();
    let bytes = memory.get_bytes("version.2").unwrap();
    memory.put_bytes("version.3.tmp", &bytes[..bytes.len() / 2]);

    let reopened = reopen(&memory, PartitionOptions::default()).unwrap();
    assert_eq!(reopened.latest_version().unwrap().version_id(), 2);
    assert_eq!(reopened.versions().unwrap(), vec![0, 1, 2]);

    partition.cleanup().unwrap();
    assert!(!memory.file_exists("version.3.tmp"));

    // The next commit does not collide with the leftover id.
    let mut writer = reopened.writer().unwrap();
    writer.add_document(Document::new().with("n", 5)).unwrap();
    assert_eq!(writer.commit().unwrap().version_id(), 3);
}

#[test]
fn test_torn_latest_version_falls_back() {
    let (memory, _partition) = setup();
    let bytes = memory.get_bytes("version.2").unwrap();
    memory.put_bytes("version.2", &bytes[..bytes.len() - 4]);

    assert!(matches!(
        Version::load(&*memory, 2),
        Err(TesseraError::CorruptVersion(_))
    ));
    let reopened = reopen(&memory, PartitionOptions::default()).unwrap();
    let reader = reopened.reader().unwrap();
    assert_eq!(reader.version().version_id(), 1);
    assert_eq!(reader.doc_count(), 1);

    // The torn id is never reused.
    let mut writer = reopened.writer().unwrap();
    writer.add_document(Document::new().with("n", 9)).unwrap();
    assert_eq!(writer.commit().unwrap().version_id(), 3);
}

#[test]
fn test_missing_segment_is_corrupt_version() {
    let (memory, _partition) = setup();
    memory.delete_dir("segment_1").unwrap();

    assert!(matches!(
        reopen(&memory, PartitionOptions::default()),
        Err(TesseraError::CorruptVersion(_))
    ));
}

#[test]
fn test_missing_format_stamp() {
    let (memory, _partition) = setup();
    memory.delete_file(INDEX_FORMAT_VERSION_FILE).unwrap();

    let reopened = reopen(&memory, PartitionOptions::default()).unwrap();
    assert_eq!(
        reopened.directory().unwrap().format_version(),
        &IndexFormatVersion::legacy()
    );

    let mut strict = PartitionOptions::default();
    strict.online.tolerate_missing_format_version = false;
    assert!(matches!(
        reopen(&memory, strict),
        Err(TesseraError::NotFound(_))
    ));
}

#[test]
fn test_newer_format_is_unsupported() {
    let (memory, _partition) = setup();
    IndexFormatVersion::new(vec![9, 0, 0])
        .store(&*memory, INDEX_FORMAT_VERSION_FILE)
        .unwrap();

    assert!(matches!(
        reopen(&memory, PartitionOptions::default()),
        Err(TesseraError::Unsupported(_))
    ));
}

#[test]
fn test_open_without_versions_is_not_found() {
    let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
    assert!(matches!(
        IndexPartition::open(storage, PartitionOptions::default()),
        Err(TesseraError::NotFound(_))
    ));
}
