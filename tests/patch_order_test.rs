use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tessera::patch::{AttributePatchReader, PatchFileInfo, PatchFileName, PatchFileWriter};
use tessera::schema::{AttributeValue, FieldType};
use tessera::storage::{MemoryStorage, Storage};

const TARGET: i32 = 0;
const DOCS: u32 = 200;

type Expected = BTreeMap<u32, ((u32, i32), Option<AttributeValue>)>;

/// Write `files` random patch files for the target segment and compute the
/// value that must win for every doc: the record of the highest
/// `(operation_id, src_segment_id)`.
fn random_files(storage: &dyn Storage, rng: &mut StdRng, files: i32) -> (Vec<PatchFileInfo>, Expected) {
    let mut expected: Expected = BTreeMap::new();
    let mut infos = Vec::new();
    for src in 1..=files {
        let operation_id = rng.random_range(0..3u32);
        let name = PatchFileName::new(src, TARGET, operation_id);
        let mut writer = PatchFileWriter::new(FieldType::Int64, name);
        for doc in 0..DOCS {
            if !rng.random_bool(0.3) {
                continue;
            }
            let value = if rng.random_bool(0.1) {
                None
            } else {
                Some(AttributeValue::Int64(rng.random_range(-1000..1000)))
            };
            writer.add(doc, value.as_ref()).unwrap();

            let rank = (operation_id, src);
            let slot = expected.entry(doc).or_insert((rank, value.clone()));
            if rank >= slot.0 {
                *slot = (rank, value);
            }
        }
        let path = name.path("price");
        writer.write(storage, &path).unwrap();
        infos.push(PatchFileInfo { name, path });
    }
    (infos, expected)
}

fn replay(storage: &dyn Storage, infos: &[PatchFileInfo]) -> Vec<(u32, Option<AttributeValue>)> {
    let mut reader = AttributePatchReader::new(TARGET, FieldType::Int64);
    for info in infos {
        reader
            .add_patch_file(storage, &info.path, info.src_segment_id())
            .unwrap();
    }
    let mut records = Vec::new();
    while let Some(record) = reader.next_value().unwrap() {
        records.push(record);
    }
    records
}

#[test]
fn test_registration_order_does_not_change_result() {
    let mut rng = StdRng::seed_from_u64(0x7e55e7a);
    for round in 0..10 {
        let storage = MemoryStorage::new_default();
        let (mut infos, expected) = random_files(&storage, &mut rng, 2 + round % 5);
        let want: Vec<_> = expected
            .into_iter()
            .map(|(doc, (_, value))| (doc, value))
            .collect();

        for _ in 0..5 {
            infos.shuffle(&mut rng);
            assert_eq!(replay(&storage, &infos), want, "round {round}");
        }
    }
}

#[test]
fn test_seek_matches_iteration() {
    let mut rng = StdRng::seed_from_u64(42);
    let storage = MemoryStorage::new_default();
    let (infos, expected) = random_files(&storage, &mut rng, 4);

    let mut reader = AttributePatchReader::new(TARGET, FieldType::Int64);
    for info in infos.iter().rev() {
        reader
            .add_patch_file(&storage, &info.path, info.src_segment_id())
            .unwrap();
    }
    let mut buffer = [0u8; 8];
    for doc in (0..DOCS).step_by(7) {
        let found = reader.seek(doc, &mut buffer).unwrap();
        match expected.get(&doc) {
            Some((_, value)) => {
                let record = found.unwrap();
                assert_eq!(record.doc_id, doc);
                assert_eq!(record.is_null, value.is_none());
                if let Some(AttributeValue::Int64(v)) = value {
                    assert_eq!(i64::from_le_bytes(buffer), *v);
                }
            }
            None => assert!(found.is_none(), "doc {doc}"),
        }
    }
}
