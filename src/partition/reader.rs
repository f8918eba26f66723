//! Snapshot readers over committed versions.

use std::sync::Arc;

use ahash::AHashMap;

use crate::attribute::reader::AttributeReader;
use crate::config::PartitionOptions;
use crate::deletion::DeletionMapReader;
use crate::error::{Result, TesseraError};
use crate::patch::filter::PatchFileFilter;
use crate::patch::finder::{PatchCatalog, PatchFileFinder};
use crate::patch::iterator::MultiFieldPatchIterator;
use crate::schema::{AttributeValue, Document, Schema};
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::DocId;
use crate::segment::tracker::{VersionPin, VersionTracker};
use crate::segment::version::Version;

/// A read-only view of one committed version.
///
/// The version stays pinned while the reader (or a clone of it) is alive,
/// so cleanup never removes the files it reads. Patches and deletes pass
/// through the partition's [`PatchFileFilter`].
#[derive(Debug, Clone)]
pub struct PartitionReader {
    directory: SegmentDirectory,
    schema: Arc<Schema>,
    catalog: PatchCatalog,
    deletions: DeletionMapReader,
    attributes: AHashMap<String, AttributeReader>,
    _pin: VersionPin,
}

impl PartitionReader {
    pub(crate) fn open(
        directory: SegmentDirectory,
        options: &PartitionOptions,
        tracker: &VersionTracker,
    ) -> Result<Self> {
        let pin = tracker.pin(directory.version().version_id());
        let storage = Arc::clone(directory.storage());
        let schema = Arc::new(Schema::load_by_id(&*storage, directory.version().schema_id())?);

        let catalog = PatchFileFilter::from_config(&options.online)
            .filter_catalog(&PatchFileFinder::find(&directory)?);
        let deletions = DeletionMapReader::open_with_catalog(&directory, &catalog)?;

        let mut attributes = AHashMap::with_capacity(schema.len());
        for field in schema.fields() {
            attributes.insert(
                field.name.clone(),
                AttributeReader::open(&directory, field, &catalog)?,
            );
        }

        log::debug!(
            "opened reader on version {} ({} docs, {} deleted)",
            directory.version().version_id(),
            directory.total_doc_count(),
            deletions.total_deleted_count()
        );
        Ok(PartitionReader {
            directory,
            schema,
            catalog,
            deletions,
            attributes,
            _pin: pin,
        })
    }

    pub fn version(&self) -> &Version {
        self.directory.version()
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn directory(&self) -> &SegmentDirectory {
        &self.directory
    }

    pub fn deletions(&self) -> &DeletionMapReader {
        &self.deletions
    }

    /// Documents in the version, deleted ones included.
    pub fn doc_count(&self) -> u32 {
        self.directory.total_doc_count()
    }

    pub fn live_doc_count(&self) -> u64 {
        self.doc_count() as u64 - self.deletions.total_deleted_count()
    }

    pub fn is_deleted(&self, doc_id: DocId) -> bool {
        self.deletions.is_deleted(doc_id)
    }

    /// Current value of one field of a document, `None` for null.
    ///
    /// Deleted documents still report their last value.
    pub fn get_value(&self, doc_id: DocId, field_name: &str) -> Result<Option<&AttributeValue>> {
        let reader = self
            .attributes
            .get(field_name)
            .ok_or_else(|| TesseraError::unknown_field(field_name.to_string()))?;
        if doc_id >= self.doc_count() {
            return Err(TesseraError::invalid_argument(format!(
                "doc {doc_id} out of range, version {} has {} docs",
                self.version().version_id(),
                self.doc_count()
            )));
        }
        Ok(reader.get(doc_id))
    }

    /// Every non-null field of a live document. `None` if deleted.
    pub fn get_document(&self, doc_id: DocId) -> Result<Option<Document>> {
        if self.is_deleted(doc_id) {
            return Ok(None);
        }
        let mut document = Document::new();
        for field in self.schema.fields() {
            if let Some(value) = self.get_value(doc_id, &field.name)? {
                document.set(&field.name, Some(value.clone()));
            }
        }
        Ok(Some(document))
    }

    /// Document ordered stream of every applied patch of updatable fields.
    pub fn patch_iterator(&self) -> Result<MultiFieldPatchIterator> {
        MultiFieldPatchIterator::new(&self.directory, &self.schema, &self.catalog)
    }
}
