//! Document-ordered streams of attribute patches across fields and
//! segments.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::sync::Arc;

use crate::error::{Result, TesseraError};
use crate::patch::finder::PatchCatalog;
use crate::patch::reader::AttributePatchReader;
use crate::schema::{AttributeValue, FieldId, Schema};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{DocId, SegmentId};

/// One winning update of one field of one document.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributePatch {
    /// Global doc id in the iterated version.
    pub doc_id: DocId,
    pub segment_id: SegmentId,
    pub local_doc_id: DocId,
    pub field_id: FieldId,
    pub value: Option<AttributeValue>,
}

#[derive(Debug)]
struct FieldStream {
    reader: AttributePatchReader,
    field_id: FieldId,
    base_doc_id: DocId,
    pending: Option<(DocId, Option<AttributeValue>)>,
}

impl FieldStream {
    fn advance(&mut self) -> Result<()> {
        self.pending = self.reader.next_value()?;
        Ok(())
    }

    fn pending_global(&self) -> Option<DocId> {
        self.pending
            .as_ref()
            .map(|(local, _)| self.base_doc_id + local)
    }
}

/// Merges the patch readers of every (segment, updatable field) pair into
/// one stream ordered by `(global doc id, field id)`.
#[derive(Debug)]
pub struct MultiFieldPatchIterator {
    streams: Vec<FieldStream>,
    heap: BinaryHeap<Reverse<(DocId, FieldId, usize)>>,
}

impl MultiFieldPatchIterator {
    pub fn new(
        directory: &SegmentDirectory,
        schema: &Schema,
        catalog: &PatchCatalog,
    ) -> Result<Self> {
        let mut iterator = MultiFieldPatchIterator {
            streams: Vec::new(),
            heap: BinaryHeap::new(),
        };
        for field in schema.updatable_fields() {
            let Some(patches) = catalog.attribute_patches(&field.name) else {
                continue;
            };
            for segment in directory.iter_segments() {
                let Some(infos) = patches.get(&segment.segment_id()) else {
                    continue;
                };
                let reader = AttributePatchReader::open(
                    directory.storage().as_ref(),
                    segment.segment_id(),
                    field.field_type,
                    infos,
                )?;
                iterator.push_stream(FieldStream {
                    reader,
                    field_id: field.id,
                    base_doc_id: segment.base_doc_id(),
                    pending: None,
                })?;
            }
        }
        Ok(iterator)
    }

    fn push_stream(&mut self, mut stream: FieldStream) -> Result<()> {
        stream.advance()?;
        if let Some(doc_id) = stream.pending_global() {
            self.heap
                .push(Reverse((doc_id, stream.field_id, self.streams.len())));
        }
        self.streams.push(stream);
        Ok(())
    }

    pub fn has_next(&self) -> bool {
        !self.heap.is_empty()
    }

    /// Global doc id of the next patch.
    pub fn peek_doc_id(&self) -> Option<DocId> {
        self.heap.peek().map(|Reverse((doc_id, _, _))| *doc_id)
    }

    pub fn next(&mut self) -> Result<Option<AttributePatch>> {
        let Some(Reverse((doc_id, field_id, index))) = self.heap.pop() else {
            return Ok(None);
        };
        let stream = &mut self.streams[index];
        let Some((local_doc_id, value)) = stream.pending.take() else {
            return Err(TesseraError::internal("patch stream lost its pending record"));
        };
        let patch = AttributePatch {
            doc_id,
            segment_id: stream.reader.segment_id(),
            local_doc_id,
            field_id,
            value,
        };
        stream.advance()?;
        if let Some(next_doc) = stream.pending_global() {
            self.heap.push(Reverse((next_doc, field_id, index)));
        }
        Ok(Some(patch))
    }

    /// Every pending patch of the next document, in field id order. Empty
    /// once the iterator is exhausted.
    pub fn next_doc(&mut self) -> Result<Vec<AttributePatch>> {
        let mut patches = Vec::new();
        let Some(doc_id) = self.peek_doc_id() else {
            return Ok(patches);
        };
        while self.peek_doc_id() == Some(doc_id) {
            if let Some(patch) = self.next()? {
                patches.push(patch);
            }
        }
        Ok(patches)
    }
}

/// A patch from the main or the sub document stream.
#[derive(Debug, Clone, PartialEq)]
pub enum SubDocPatch {
    Main(AttributePatch),
    /// A sub document patch and the main document it belongs to.
    Sub {
        main_doc_id: DocId,
        patch: AttributePatch,
    },
}

/// Interleaves the patches of main documents and of their sub documents.
///
/// `sub_to_main[sub_doc]` is the main document that owns a sub document;
/// it must be non-decreasing. Patches of a main document come before the
/// patches of its sub documents.
#[derive(Debug)]
pub struct SubDocPatchIterator {
    main: MultiFieldPatchIterator,
    sub: MultiFieldPatchIterator,
    sub_to_main: Arc<[DocId]>,
}

impl SubDocPatchIterator {
    pub fn new(
        main: MultiFieldPatchIterator,
        sub: MultiFieldPatchIterator,
        sub_to_main: Arc<[DocId]>,
    ) -> Self {
        SubDocPatchIterator {
            main,
            sub,
            sub_to_main,
        }
    }

    fn parent_of(&self, sub_doc_id: DocId) -> Result<DocId> {
        self.sub_to_main
            .get(sub_doc_id as usize)
            .copied()
            .ok_or_else(|| {
                TesseraError::corrupt(format!(
                    "sub document {sub_doc_id} has no main document, join table has {} entries",
                    self.sub_to_main.len()
                ))
            })
    }

    pub fn has_next(&self) -> bool {
        self.main.has_next() || self.sub.has_next()
    }

    pub fn next(&mut self) -> Result<Option<SubDocPatch>> {
        let sub_parent = match self.sub.peek_doc_id() {
            Some(sub_doc) => Some(self.parent_of(sub_doc)?),
            None => None,
        };
        let take_main = match (self.main.peek_doc_id(), sub_parent) {
            (None, None) => return Ok(None),
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(main_doc), Some(parent)) => main_doc <= parent,
        };

        if take_main {
            Ok(self.main.next()?.map(SubDocPatch::Main))
        } else {
            let main_doc_id = sub_parent.unwrap_or_default();
            Ok(self
                .sub
                .next()?
                .map(|patch| SubDocPatch::Sub { main_doc_id, patch }))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::patch::file::{PatchFileName, PatchFileWriter};
    use crate::patch::finder::PatchFileFinder;
    use crate::schema::FieldType;
    use crate::segment::info::SegmentInfo;
    use crate::segment::version::Version;
    use crate::storage::{MemoryStorage, Storage};

    fn schema() -> Schema {
        Schema::builder()
            .add_field("price", FieldType::Int64)
            .unwrap()
            .add_field("title", FieldType::String)
            .unwrap()
            .build()
    }

    fn write_patch(
        storage: &dyn Storage,
        field: &str,
        field_type: FieldType,
        name: PatchFileName,
        records: &[(DocId, Option<AttributeValue>)],
    ) {
        let mut writer = PatchFileWriter::new(field_type, name);
        for (doc, value) in records {
            writer.add(*doc, value.as_ref()).unwrap();
        }
        writer.write(storage, &name.path(field)).unwrap();
    }

    /// Segments 0 (3 docs), 1 (2 docs) and 2 (0 docs, holds patches).
    fn build(storage: &Arc<dyn Storage>) -> SegmentDirectory {
        let mut version = Version::new(0);
        for (id, docs) in [(0, 3), (1, 2), (2, 0)] {
            SegmentInfo::new(docs, 0).store(storage.as_ref(), id).unwrap();
            version.add_segment(id);
        }
        write_patch(
            storage.as_ref(),
            "price",
            FieldType::Int64,
            PatchFileName::new(2, 0, 0),
            &[(1, Some(AttributeValue::Int64(5))), (2, None)],
        );
        write_patch(
            storage.as_ref(),
            "title",
            FieldType::String,
            PatchFileName::new(2, 0, 0),
            &[(1, Some(AttributeValue::String("b".into())))],
        );
        write_patch(
            storage.as_ref(),
            "price",
            FieldType::Int64,
            PatchFileName::new(2, 1, 0),
            &[(0, Some(AttributeValue::Int64(9)))],
        );
        SegmentDirectory::from_version(Arc::clone(storage), version, Default::default()).unwrap()
    }

    #[test]
    fn test_multi_field_order() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let directory = build(&storage);
        let catalog = PatchFileFinder::find(&directory).unwrap();
        let mut iter = MultiFieldPatchIterator::new(&directory, &schema(), &catalog).unwrap();

        let first = iter.next_doc().unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!((first[0].doc_id, first[0].field_id), (1, 0));
        assert_eq!((first[1].doc_id, first[1].field_id), (1, 1));
        assert_eq!(first[1].value, Some(AttributeValue::String("b".into())));

        let second = iter.next().unwrap().unwrap();
        assert_eq!((second.doc_id, second.value), (2, None));

        let third = iter.next().unwrap().unwrap();
        assert_eq!(third.doc_id, 3);
        assert_eq!((third.segment_id, third.local_doc_id), (1, 0));
        assert!(iter.next().unwrap().is_none());
        assert!(iter.next_doc().unwrap().is_empty());
    }

    #[test]
    fn test_sub_doc_interleave() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let main_dir = build(&storage);
        let main_catalog = PatchFileFinder::find(&main_dir).unwrap();

        let sub_storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let sub_dir = build(&sub_storage);
        let sub_catalog = PatchFileFinder::find(&sub_dir).unwrap();

        // Sub docs 0..5 belong to main docs 0,0,1,3,4.
        let join: Arc<[DocId]> = Arc::from(vec![0, 0, 1, 3, 4]);
        let mut iter = SubDocPatchIterator::new(
            MultiFieldPatchIterator::new(&main_dir, &schema(), &main_catalog).unwrap(),
            MultiFieldPatchIterator::new(&sub_dir, &schema(), &sub_catalog).unwrap(),
            join,
        );

        let mut order = Vec::new();
        while let Some(patch) = iter.next().unwrap() {
            order.push(match patch {
                SubDocPatch::Main(p) => ("main", p.doc_id, p.field_id),
                SubDocPatch::Sub { main_doc_id, patch } => {
                    assert_eq!(main_doc_id, [0, 0, 1, 3, 4][patch.doc_id as usize]);
                    ("sub", patch.doc_id, patch.field_id)
                }
            });
        }
        assert_eq!(
            order,
            vec![
                ("sub", 1, 0),
                ("sub", 1, 1),
                ("main", 1, 0),
                ("main", 1, 1),
                ("sub", 2, 0),
                ("main", 2, 0),
                ("main", 3, 0),
                ("sub", 3, 0),
            ]
        );
        assert!(!iter.has_next());
    }
}
