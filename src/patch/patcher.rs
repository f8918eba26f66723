//! Rewrites field values as patch files, used when a field is altered.
//!
//! A [`SingleAttributePatcher`] reads the current values of one field of one
//! segment (column data with every patch applied) under the old schema, and
//! writes new values under the new schema into a single patch file held by
//! the destination segment.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::attribute::reader::SegmentAttributeReader;
use crate::error::{Result, TesseraError};
use crate::patch::file::{PatchFileName, PatchFileWriter};
use crate::patch::finder::{PatchCatalog, PatchFileInfo};
use crate::schema::{AttributeValue, FieldConfig, Schema};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{DocId, OperationId, SegmentId};
use crate::storage::Storage;

#[derive(Debug, Clone)]
pub struct PartitionPatcher {
    old_schema: Arc<Schema>,
    new_schema: Arc<Schema>,
    directory: SegmentDirectory,
    catalog: PatchCatalog,
    operation_id: OperationId,
    dest_segment_id: SegmentId,
}

impl PartitionPatcher {
    pub fn new(
        old_schema: Arc<Schema>,
        new_schema: Arc<Schema>,
        directory: SegmentDirectory,
        catalog: PatchCatalog,
        operation_id: OperationId,
        dest_segment_id: SegmentId,
    ) -> Self {
        PartitionPatcher {
            old_schema,
            new_schema,
            directory,
            catalog,
            operation_id,
            dest_segment_id,
        }
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn dest_segment_id(&self) -> SegmentId {
        self.dest_segment_id
    }

    pub fn create_single_attribute_patcher(
        &self,
        field_name: &str,
        segment_id: SegmentId,
    ) -> Result<SingleAttributePatcher> {
        let old_field = self.old_schema.field_by_name(field_name);
        let new_field = self.new_schema.field_by_name(field_name);
        let new_field = match (old_field, new_field) {
            (None, None) => {
                return Err(TesseraError::unknown_field(format!(
                    "{field_name} is in neither schema {} nor {}",
                    self.old_schema.schema_id(),
                    self.new_schema.schema_id()
                )));
            }
            (Some(_), None) => {
                return Err(TesseraError::schema_mismatch(format!(
                    "{field_name} was removed by schema {}",
                    self.new_schema.schema_id()
                )));
            }
            (_, Some(field)) => field.clone(),
        };

        let segment = self.directory.get_segment_data(segment_id).ok_or_else(|| {
            TesseraError::not_found(format!(
                "segment {segment_id} is not in version {}",
                self.directory.version().version_id()
            ))
        })?;
        if self.dest_segment_id <= segment_id {
            return Err(TesseraError::invalid_operation(format!(
                "patches of segment {segment_id} cannot be held by older segment {}",
                self.dest_segment_id
            )));
        }

        let old_values = match old_field {
            Some(field) => {
                let patches = self
                    .catalog
                    .attribute_patches(field_name)
                    .and_then(|p| p.get(&segment_id))
                    .map(Vec::as_slice)
                    .unwrap_or(&[]);
                Some(SegmentAttributeReader::open(
                    &self.directory,
                    segment,
                    field,
                    patches,
                )?)
            }
            None => None,
        };

        Ok(SingleAttributePatcher {
            field: new_field,
            segment_id,
            doc_count: segment.doc_count(),
            old_values,
            updates: BTreeMap::new(),
            name: PatchFileName::new(self.dest_segment_id, segment_id, self.operation_id),
        })
    }
}

#[derive(Debug)]
pub struct SingleAttributePatcher {
    field: FieldConfig,
    segment_id: SegmentId,
    doc_count: u32,
    old_values: Option<SegmentAttributeReader>,
    updates: BTreeMap<DocId, Option<AttributeValue>>,
    name: PatchFileName,
}

impl SingleAttributePatcher {
    pub fn field(&self) -> &FieldConfig {
        &self.field
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    /// Current value under the old schema, `None` if null or the field is
    /// new.
    pub fn read_old(&self, doc_id: DocId) -> Option<&AttributeValue> {
        self.old_values.as_ref()?.get(doc_id)
    }

    /// Set the new value of `doc_id`, converting it to the new field type.
    pub fn set(&mut self, doc_id: DocId, value: Option<AttributeValue>) -> Result<()> {
        if doc_id >= self.doc_count {
            return Err(TesseraError::invalid_argument(format!(
                "doc {doc_id} out of range for segment {} with {} docs",
                self.segment_id, self.doc_count
            )));
        }
        let value = value
            .map(|v| v.convert_to(self.field.field_type))
            .transpose()?;
        self.updates.insert(doc_id, value);
        Ok(())
    }

    /// Rewrite every document from its old value. Returns the number of
    /// documents written.
    pub fn rederive(&mut self) -> Result<usize> {
        for doc_id in 0..self.doc_count {
            let value = self.read_old(doc_id).cloned();
            self.set(doc_id, value)?;
        }
        Ok(self.doc_count as usize)
    }

    /// Write the patch file. Nothing is written when no document was set.
    pub fn close(self, storage: &dyn Storage) -> Result<Option<PatchFileInfo>> {
        if self.updates.is_empty() {
            return Ok(None);
        }
        let mut writer = PatchFileWriter::new(self.field.field_type, self.name);
        for (doc_id, value) in &self.updates {
            writer.add(*doc_id, value.as_ref())?;
        }
        let path = self.name.path(&self.field.name);
        writer.write(storage, &path)?;
        log::debug!(
            "wrote {} values of {} for segment {} to {path}",
            self.updates.len(),
            self.field.name,
            self.segment_id
        );
        Ok(Some(PatchFileInfo {
            name: self.name,
            path,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attribute::column::AttributeColumnWriter;
    use crate::attribute::reader::column_path;
    use crate::patch::finder::PatchFileFinder;
    use crate::patch::reader::AttributePatchReader;
    use crate::schema::FieldType;
    use crate::segment::id::segment_dir_name;
    use crate::segment::info::SegmentInfo;
    use crate::segment::version::Version;
    use crate::storage::MemoryStorage;

    fn setup() -> (Arc<dyn Storage>, PartitionPatcher) {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let old = Schema::builder()
            .add_field("count", FieldType::Int32)
            .unwrap()
            .build();
        let new = old.alter_field("count", FieldType::String).unwrap();

        let mut column = AttributeColumnWriter::new(FieldType::Int32);
        for v in [1, 2, 3] {
            column.add(Some(&AttributeValue::Int32(v))).unwrap();
        }
        column
            .write(
                storage.as_ref(),
                &format!("{}/{}", segment_dir_name(0), column_path("count")),
            )
            .unwrap();
        SegmentInfo::new(3, 0).store(storage.as_ref(), 0).unwrap();
        let mut version = Version::new(0);
        version.add_segment(0);
        let directory =
            SegmentDirectory::from_version(Arc::clone(&storage), version, Default::default())
                .unwrap();
        let catalog = PatchFileFinder::find(&directory).unwrap();
        let patcher = PartitionPatcher::new(
            Arc::new(old),
            Arc::new(new),
            directory,
            catalog,
            1,
            1,
        );
        (storage, patcher)
    }

    #[test]
    fn test_rederive_writes_converted_values() {
        let (storage, patcher) = setup();
        let mut single = patcher.create_single_attribute_patcher("count", 0).unwrap();
        assert_eq!(single.read_old(1), Some(&AttributeValue::Int32(2)));
        assert_eq!(single.rederive().unwrap(), 3);

        let info = single.close(storage.as_ref()).unwrap().unwrap();
        assert_eq!(info.path, "segment_1/attribute/count/1_0_1.patch");

        let mut reader =
            AttributePatchReader::open(storage.as_ref(), 0, FieldType::String, &[info]).unwrap();
        let (doc, value) = reader.next_value().unwrap().unwrap();
        assert_eq!(doc, 0);
        assert_eq!(value, Some(AttributeValue::String("1".into())));
    }

    #[test]
    fn test_errors() {
        let (_, patcher) = setup();
        assert!(matches!(
            patcher.create_single_attribute_patcher("missing", 0),
            Err(TesseraError::UnknownField(_))
        ));
        assert!(patcher.create_single_attribute_patcher("count", 7).is_err());

        let (_, patcher) = setup();
        let reverse = PartitionPatcher::new(
            Arc::clone(&patcher.new_schema),
            Arc::clone(&patcher.old_schema),
            patcher.directory.clone(),
            patcher.catalog.clone(),
            2,
            1,
        );
        let mut single = reverse.create_single_attribute_patcher("count", 0).unwrap();
        assert!(matches!(
            single.set(0, Some(AttributeValue::String("many".into()))),
            Err(TesseraError::SchemaMismatch(_))
        ));
        assert!(single.set(5, None).is_err());
        assert!(single.set(0, Some(AttributeValue::String("12".into()))).is_ok());
    }
}
