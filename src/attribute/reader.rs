//! Field values of a version: column data with patches applied on load.

use ahash::AHashMap;

use crate::attribute::column::{AttributeColumn, COLUMN_FILE};
use crate::error::{Result, TesseraError};
use crate::patch::finder::{PatchCatalog, PatchFileInfo};
use crate::patch::reader::AttributePatchReader;
use crate::schema::{AttributeValue, FieldConfig, FieldType};
use crate::segment::directory::{SegmentData, SegmentDirectory};
use crate::segment::id::{DocId, SegmentId};

/// Path of a field's column inside its segment.
pub fn column_path(field: &str) -> String {
    format!("attribute/{field}/{COLUMN_FILE}")
}

/// One field of one segment.
#[derive(Debug, Clone)]
pub struct SegmentAttributeReader {
    segment_id: SegmentId,
    field_type: FieldType,
    values: Vec<Option<AttributeValue>>,
    patched_docs: usize,
}

impl SegmentAttributeReader {
    /// Load `field` of `segment` and apply `patches` (ascending rank).
    ///
    /// A segment built before the field existed reads as all nulls. Column
    /// values of an older type are converted to the field's current type.
    pub fn open(
        directory: &SegmentDirectory,
        segment: &SegmentData,
        field: &FieldConfig,
        patches: &[PatchFileInfo],
    ) -> Result<Self> {
        let doc_count = segment.doc_count();
        let path = column_path(&field.name);
        let mut values = Vec::with_capacity(doc_count as usize);

        if segment.storage().file_exists(&path) {
            let column = AttributeColumn::load(segment.storage().as_ref(), &path)?;
            if column.doc_count() != doc_count {
                return Err(TesseraError::corrupt(format!(
                    "{}/{path} has {} docs, segment has {doc_count}",
                    segment.directory_name(),
                    column.doc_count()
                )));
            }
            for doc_id in 0..doc_count {
                let value = match column.get(doc_id)? {
                    Some(v) if v.field_type() != field.field_type => {
                        Some(v.convert_to(field.field_type)?)
                    }
                    other => other,
                };
                values.push(value);
            }
        } else {
            values.resize(doc_count as usize, None);
        }

        let mut patched_docs = 0;
        if !patches.is_empty() {
            let mut reader = AttributePatchReader::open(
                directory.storage().as_ref(),
                segment.segment_id(),
                field.field_type,
                patches,
            )?;
            while let Some((doc_id, value)) = reader.next_value()? {
                let slot = values.get_mut(doc_id as usize).ok_or_else(|| {
                    TesseraError::corrupt(format!(
                        "patch for doc {doc_id} of segment {} with {doc_count} docs",
                        segment.segment_id()
                    ))
                })?;
                *slot = value;
                patched_docs += 1;
            }
        }

        Ok(SegmentAttributeReader {
            segment_id: segment.segment_id(),
            field_type: field.field_type,
            values,
            patched_docs,
        })
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn field_type(&self) -> FieldType {
        self.field_type
    }

    pub fn doc_count(&self) -> u32 {
        self.values.len() as u32
    }

    /// Number of documents whose value came from a patch.
    pub fn patched_docs(&self) -> usize {
        self.patched_docs
    }

    pub fn get(&self, local_doc_id: DocId) -> Option<&AttributeValue> {
        self.values.get(local_doc_id as usize).and_then(Option::as_ref)
    }
}

/// One field across every segment of a version.
#[derive(Debug, Clone)]
pub struct AttributeReader {
    field: FieldConfig,
    directory: SegmentDirectory,
    segments: AHashMap<SegmentId, SegmentAttributeReader>,
}

impl AttributeReader {
    pub fn open(
        directory: &SegmentDirectory,
        field: &FieldConfig,
        catalog: &PatchCatalog,
    ) -> Result<Self> {
        let patches = catalog.attribute_patches(&field.name);
        let mut segments = AHashMap::with_capacity(directory.segment_count());
        for segment in directory.iter_segments() {
            let infos = patches
                .and_then(|p| p.get(&segment.segment_id()))
                .map(Vec::as_slice)
                .unwrap_or(&[]);
            segments.insert(
                segment.segment_id(),
                SegmentAttributeReader::open(directory, segment, field, infos)?,
            );
        }
        Ok(AttributeReader {
            field: field.clone(),
            directory: directory.clone(),
            segments,
        })
    }

    pub fn field(&self) -> &FieldConfig {
        &self.field
    }

    pub fn segment(&self, segment_id: SegmentId) -> Option<&SegmentAttributeReader> {
        self.segments.get(&segment_id)
    }

    /// Value of a global doc id; `None` for null or out of range.
    pub fn get(&self, global_doc_id: DocId) -> Option<&AttributeValue> {
        let (segment_id, local) = self.directory.locate(global_doc_id)?;
        self.get_in_segment(segment_id, local)
    }

    pub fn get_in_segment(
        &self,
        segment_id: SegmentId,
        local_doc_id: DocId,
    ) -> Option<&AttributeValue> {
        self.segments.get(&segment_id)?.get(local_doc_id)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::attribute::column::AttributeColumnWriter;
    use crate::config::PartitionOptions;
    use crate::patch::file::{PatchFileName, PatchFileWriter};
    use crate::patch::finder::PatchFileFinder;
    use crate::segment::info::SegmentInfo;
    use crate::storage::{MemoryStorage, Storage};

    #[test]
    fn test_patches_overlay_column() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let options = PartitionOptions::default();

        let mut column = AttributeColumnWriter::new(FieldType::Int32);
        for v in [10, 11, 12] {
            column.add(Some(&AttributeValue::Int32(v))).unwrap();
        }
        column.write(&*storage, "segment_0/attribute/n/data").unwrap();
        SegmentInfo::new(3, 0).store(&*storage, 0).unwrap();

        let name = PatchFileName::new(1, 0, 0);
        let mut patch = PatchFileWriter::new(FieldType::Int32, name);
        patch.add(1, None).unwrap();
        patch.add(2, Some(&AttributeValue::Int32(99))).unwrap();
        patch.write(&*storage, &name.path("n")).unwrap();
        // segment 1 only carries patches and has no column for the field
        SegmentInfo::new(2, 0).store(&*storage, 1).unwrap();

        let mut directory = SegmentDirectory::load(Arc::clone(&storage), &options).unwrap();
        directory.commit(&[0, 1], &[], &options).unwrap();
        let catalog = PatchFileFinder::find(&directory).unwrap();

        let field = FieldConfig::new(0, "n", FieldType::Int64);
        let reader = AttributeReader::open(&directory, &field, &catalog).unwrap();
        assert_eq!(reader.get(0), Some(&AttributeValue::Int64(10)));
        assert_eq!(reader.get(1), None);
        assert_eq!(reader.get(2), Some(&AttributeValue::Int64(99)));
        assert_eq!(reader.get(3), None);
        assert_eq!(reader.get(5), None);
        assert_eq!(reader.segment(0).unwrap().patched_docs(), 2);
    }
}
