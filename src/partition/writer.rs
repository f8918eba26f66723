//! The single writer of a partition.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::attribute::column::AttributeColumnWriter;
use crate::attribute::reader::column_path;
use crate::config::PartitionOptions;
use crate::deletion::DeletionMapWriter;
use crate::error::{Result, TesseraError};
use crate::patch::file::{PatchFileName, PatchFileWriter};
use crate::schema::{AttributeValue, Document, Schema};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{BUILDING_SEGMENT_ID, DocId, OperationId, SegmentId, segment_dir_name};
use crate::segment::info::SegmentInfo;
use crate::segment::version::Version;
use crate::storage::{Storage, StorageLock};

/// Name of the storage lock held by the writer.
pub const WRITE_LOCK: &str = "write";

type PendingPatches = BTreeMap<DocId, Option<AttributeValue>>;

/// Adds documents into a building segment and records deletes and field
/// updates against the sealed segments of its base version.
///
/// Global doc ids past the sealed documents of the base version address the
/// building segment. Nothing is visible to readers before [`Self::commit`].
#[derive(Debug)]
pub struct PartitionWriter {
    storage: Arc<dyn Storage>,
    options: PartitionOptions,
    commit_lock: Arc<Mutex<()>>,
    schema: Arc<Schema>,
    directory: SegmentDirectory,
    deletions: DeletionMapWriter,
    building: Vec<Document>,
    /// `(target segment, field)` to pending values.
    patches: BTreeMap<(SegmentId, String), PendingPatches>,
    operation_id: OperationId,
    _lock: Box<dyn StorageLock>,
}

impl PartitionWriter {
    pub(crate) fn open(
        storage: Arc<dyn Storage>,
        options: PartitionOptions,
        commit_lock: Arc<Mutex<()>>,
    ) -> Result<Self> {
        let lock = storage
            .lock_manager()
            .try_acquire_lock(WRITE_LOCK)?
            .ok_or_else(|| {
                TesseraError::invalid_operation("another writer holds the partition write lock")
            })?;
        let directory = SegmentDirectory::load(Arc::clone(&storage), &options)?;
        let schema = Arc::new(Schema::load_by_id(&*storage, directory.version().schema_id())?);
        let deletions = DeletionMapWriter::open(&directory)?;
        let operation_id = options
            .build
            .schema_operation_id
            .max(directory.version().schema_id());

        log::debug!(
            "opened writer on version {} with operation id {operation_id}",
            directory.version().version_id()
        );
        Ok(PartitionWriter {
            storage,
            options,
            commit_lock,
            schema,
            directory,
            deletions,
            building: Vec::new(),
            patches: BTreeMap::new(),
            operation_id,
            _lock: lock,
        })
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Version the writer is based on.
    pub fn version(&self) -> &Version {
        self.directory.version()
    }

    pub fn operation_id(&self) -> OperationId {
        self.operation_id
    }

    pub fn building_doc_count(&self) -> u32 {
        self.building.len() as u32
    }

    /// Global doc count including the building segment.
    pub fn doc_count(&self) -> u32 {
        self.directory.total_doc_count() + self.building_doc_count()
    }

    pub fn has_pending_changes(&self) -> bool {
        !self.building.is_empty() || self.deletions.is_dirty() || !self.patches.is_empty()
    }

    /// Append a document to the building segment. Returns its global doc id.
    pub fn add_document(&mut self, document: Document) -> Result<DocId> {
        document.validate_against_schema(&self.schema)?;
        let doc_id = self.doc_count();
        if doc_id == DocId::MAX {
            return Err(TesseraError::invalid_operation("global doc id space exhausted"));
        }
        self.building.push(document);
        self.deletions.set_building_doc_count(self.building_doc_count());
        Ok(doc_id)
    }

    /// Delete a document. `false` if it is out of range or already deleted.
    pub fn delete_document(&mut self, doc_id: DocId) -> bool {
        self.deletions.delete(doc_id)
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.deletions.is_deleted(doc_id)
    }

    /// Set field `field_name` of document `doc_id`; `None` sets null.
    pub fn update_field(
        &mut self,
        doc_id: DocId,
        field_name: &str,
        value: Option<AttributeValue>,
    ) -> Result<()> {
        let field = self.schema.require_field(field_name)?;
        if !field.updatable {
            return Err(TesseraError::invalid_operation(format!(
                "field {field_name} does not accept updates"
            )));
        }
        let value = value.map(|v| v.convert_to(field.field_type)).transpose()?;

        let sealed = self.directory.total_doc_count();
        if doc_id >= sealed {
            let total = self.doc_count();
            let document = self
                .building
                .get_mut((doc_id - sealed) as usize)
                .ok_or_else(|| {
                    TesseraError::invalid_argument(format!(
                        "doc {doc_id} out of range, partition has {total} docs"
                    ))
                })?;
            document.set(field_name, value);
            return Ok(());
        }

        let (segment_id, local) = self.directory.locate(doc_id).ok_or_else(|| {
            TesseraError::invalid_argument(format!("doc {doc_id} is in no segment"))
        })?;
        self.patches
            .entry((segment_id, field_name.to_string()))
            .or_default()
            .insert(local, value);
        Ok(())
    }

    /// Seal the building segment with every pending delete and update and
    /// publish a new version. Returns the base version unchanged when there
    /// is nothing to commit.
    ///
    /// Fails with `InvalidOperation`, keeping the pending changes, when a
    /// merge retired a segment that has pending deletes or updates.
    pub fn commit(&mut self) -> Result<Version> {
        if !self.has_pending_changes() {
            return Ok(self.directory.version().clone());
        }
        let _guard = self.commit_lock.lock();
        let mut latest = SegmentDirectory::load(Arc::clone(&self.storage), &self.options)?;

        let targets = self
            .deletions
            .dirty_segments()
            .into_iter()
            .filter(|&id| id != BUILDING_SEGMENT_ID)
            .chain(self.patches.keys().map(|(target, _)| *target));
        for target in targets {
            if !latest.version().contains(target) {
                return Err(TesseraError::invalid_operation(format!(
                    "segment {target} has pending changes but was retired by version {}",
                    latest.version().version_id()
                )));
            }
        }

        let dest = latest.next_segment_id()?;
        let mut deletions = self.deletions.clone();
        let published = self
            .dump(&mut deletions, dest)
            .and_then(|()| latest.commit(&[dest], &[], &self.options));
        let version = match published {
            Ok(version) => version,
            Err(e) => {
                if let Err(cleanup) = self.storage.delete_dir(&segment_dir_name(dest)) {
                    log::warn!("failed to remove partial segment {dest}: {cleanup}");
                }
                return Err(e);
            }
        };
        log::info!(
            "sealed segment {dest} with {} docs into version {}",
            self.building.len(),
            version.version_id()
        );

        self.deletions = DeletionMapWriter::open(&latest)?;
        self.directory = latest;
        self.building.clear();
        self.patches.clear();
        Ok(version)
    }

    fn dump(&self, deletions: &mut DeletionMapWriter, dest: SegmentId) -> Result<()> {
        let storage = &*self.storage;
        let segment_dir = segment_dir_name(dest);

        if !self.building.is_empty() {
            for field in self.schema.fields() {
                let mut column = AttributeColumnWriter::new(field.field_type);
                for document in &self.building {
                    column.add(document.get(&field.name))?;
                }
                column.write(storage, &format!("{segment_dir}/{}", column_path(&field.name)))?;
            }
        }

        deletions.dump(storage, dest)?;

        for ((target, field_name), values) in &self.patches {
            let field = self.schema.require_field(field_name)?;
            let name = PatchFileName::new(dest, *target, self.operation_id);
            let mut writer = PatchFileWriter::new(field.field_type, name);
            for (doc_id, value) in values {
                writer.add(*doc_id, value.as_ref())?;
            }
            writer.write(storage, &name.path(field_name))?;
        }

        SegmentInfo::new(self.building_doc_count(), self.schema.schema_id()).store(storage, dest)
    }
}
