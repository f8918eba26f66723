//! Index partitions: the entry point tying segments, deletes, patches and
//! merges together.
//!
//! A partition lives in one [`Storage`]. It has a single writer at a time
//! (held through the storage lock `write`), any number of snapshot readers,
//! and merges that may run next to the writer. Writer commits, merge commits
//! and schema alters of one handle serialize on its commit lock. Handles
//! opened separately publish versions under the storage lock `commit`, and a
//! handle whose view went stale gets `InvalidOperation` instead of
//! overwriting a newer version.

pub mod reader;
pub mod writer;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::PartitionOptions;
use crate::error::{Result, TesseraError};
use crate::format::{INDEX_FORMAT_VERSION_FILE, IndexFormatVersion};
use crate::merge::merger::{MergeResult, PartitionMerger};
use crate::merge::policy::MergePolicyRegistry;
use crate::patch::finder::PatchFileFinder;
use crate::patch::patcher::PartitionPatcher;
use crate::schema::{FieldType, Schema};
use crate::segment::directory::{CleanupReport, SegmentDirectory};
use crate::segment::id::{VersionId, segment_dir_name};
use crate::segment::info::SegmentInfo;
use crate::segment::tracker::VersionTracker;
use crate::segment::version::Version;
use crate::storage::{Storage, StorageLock};

pub use reader::PartitionReader;
pub use writer::{PartitionWriter, WRITE_LOCK};

/// Handle on one partition. Cloning shares the commit lock and the reader
/// pins.
#[derive(Clone)]
pub struct IndexPartition {
    storage: Arc<dyn Storage>,
    options: PartitionOptions,
    commit_lock: Arc<Mutex<()>>,
    tracker: VersionTracker,
}

impl std::fmt::Debug for IndexPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexPartition")
            .field("storage", &self.storage)
            .field("pinned_versions", &self.tracker.pinned_versions())
            .finish()
    }
}

impl IndexPartition {
    /// Create a new partition with `schema` and an empty version 0.
    pub fn create(
        storage: Arc<dyn Storage>,
        schema: &Schema,
        options: PartitionOptions,
    ) -> Result<Self> {
        options.validate()?;
        if !Version::list_version_ids(&*storage)?.is_empty() {
            return Err(TesseraError::invalid_operation(
                "storage already holds a partition",
            ));
        }
        schema.store(&*storage)?;
        IndexFormatVersion::binary().store(&*storage, INDEX_FORMAT_VERSION_FILE)?;

        let mut directory = SegmentDirectory::from_version(
            Arc::clone(&storage),
            Version::default(),
            IndexFormatVersion::binary(),
        )?;
        let mut initial = Version::new(0);
        initial.set_schema_id(schema.schema_id());
        directory.commit_version(initial, &options)?;

        log::info!("created partition with schema {}", schema.schema_id());
        Ok(Self::with_storage(storage, options))
    }

    /// Open an existing partition. `NotFound` if no version was ever
    /// committed.
    pub fn open(storage: Arc<dyn Storage>, options: PartitionOptions) -> Result<Self> {
        options.validate()?;
        let directory = SegmentDirectory::load(Arc::clone(&storage), &options)?;
        if !directory.version().is_valid() {
            return Err(TesseraError::not_found("no committed version"));
        }
        Ok(Self::with_storage(storage, options))
    }

    fn with_storage(storage: Arc<dyn Storage>, options: PartitionOptions) -> Self {
        IndexPartition {
            storage,
            options,
            commit_lock: Arc::new(Mutex::new(())),
            tracker: VersionTracker::new(),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn options(&self) -> &PartitionOptions {
        &self.options
    }

    pub fn tracker(&self) -> &VersionTracker {
        &self.tracker
    }

    /// Directory view of the latest version.
    pub fn directory(&self) -> Result<SegmentDirectory> {
        SegmentDirectory::load(Arc::clone(&self.storage), &self.options)
    }

    pub fn latest_version(&self) -> Result<Version> {
        Ok(self.directory()?.version().clone())
    }

    /// Ids of every committed version on disk, ascending.
    pub fn versions(&self) -> Result<Vec<VersionId>> {
        Version::list_version_ids(&*self.storage)
    }

    /// The schema of the latest version.
    pub fn schema(&self) -> Result<Schema> {
        Schema::load_by_id(&*self.storage, self.latest_version()?.schema_id())
    }

    /// Open the writer. `InvalidOperation` while another writer is open.
    pub fn writer(&self) -> Result<PartitionWriter> {
        PartitionWriter::open(
            Arc::clone(&self.storage),
            self.options.clone(),
            Arc::clone(&self.commit_lock),
        )
    }

    /// Reader pinned to the latest version.
    pub fn reader(&self) -> Result<PartitionReader> {
        PartitionReader::open(self.directory()?, &self.options, &self.tracker)
    }

    /// Reader pinned to `version_id`.
    pub fn reader_at(&self, version_id: VersionId) -> Result<PartitionReader> {
        let directory = SegmentDirectory::load_version(Arc::clone(&self.storage), version_id)?;
        PartitionReader::open(directory, &self.options, &self.tracker)
    }

    pub fn merger(&self) -> PartitionMerger {
        PartitionMerger::new(
            Arc::clone(&self.storage),
            self.options.clone(),
            Arc::clone(&self.commit_lock),
            self.tracker.clone(),
        )
    }

    /// Run the configured merge policy once.
    pub fn merge(&self, registry: &MergePolicyRegistry) -> Result<Option<MergeResult>> {
        self.merger().merge(registry)
    }

    /// Drop old versions and unreferenced segments, keeping
    /// `online.keep_version_count` versions and every pinned one.
    pub fn cleanup(&self) -> Result<CleanupReport> {
        let _guard = self.commit_lock.lock();
        let directory = self.directory()?;
        directory.cleanup(&self.tracker, self.options.online.keep_version_count)
    }

    /// Retype `field_name` to `new_type`.
    ///
    /// The alter runs under the write lock, so no writer is open. Every
    /// non-empty segment gets its values rewritten as patches, converted to
    /// the new type and held by a fresh segment, under the operation id of
    /// the new schema. Values that cannot be converted fail the alter with
    /// `SchemaMismatch` and nothing is published.
    pub fn alter_field(&self, field_name: &str, new_type: FieldType) -> Result<Version> {
        let _write = self.acquire_write_lock()?;
        let _guard = self.commit_lock.lock();

        let mut directory = self.directory()?;
        let old = Arc::new(Schema::load_by_id(
            &*self.storage,
            directory.version().schema_id(),
        )?);
        let new = Arc::new(old.alter_field(field_name, new_type)?);
        let dest = directory.next_segment_id()?;
        let patcher = PartitionPatcher::new(
            old,
            Arc::clone(&new),
            directory.clone(),
            PatchFileFinder::find(&directory)?,
            new.schema_id(),
            dest,
        );

        let published = (|| -> Result<Version> {
            let mut rewritten = 0;
            for segment in directory.iter_segments().filter(|s| s.doc_count() > 0) {
                let mut single =
                    patcher.create_single_attribute_patcher(field_name, segment.segment_id())?;
                rewritten += single.rederive()?;
                single.close(&*self.storage)?;
            }
            SegmentInfo::new(0, new.schema_id()).store(&*self.storage, dest)?;
            new.store(&*self.storage)?;

            let mut next = directory.next_version()?;
            next.add_segment(dest);
            next.set_schema_id(new.schema_id());
            let version = directory.commit_version(next, &self.options)?;
            log::info!(
                "altered {field_name} to {new_type} under schema {}, rewrote {rewritten} values into segment {dest}",
                new.schema_id()
            );
            Ok(version)
        })();

        if published.is_err() {
            if let Err(e) = self.storage.delete_dir(&segment_dir_name(dest)) {
                log::warn!("failed to remove segment {dest} of aborted alter: {e}");
            }
        }
        published
    }

    /// Add a nullable field. Existing documents read it as null.
    pub fn add_field(&self, field_name: &str, field_type: FieldType) -> Result<Version> {
        let _write = self.acquire_write_lock()?;
        let _guard = self.commit_lock.lock();

        let mut directory = self.directory()?;
        let old = Schema::load_by_id(&*self.storage, directory.version().schema_id())?;
        let new = old.with_added_field(field_name, field_type)?;
        new.store(&*self.storage)?;

        let mut next = directory.next_version()?;
        next.set_schema_id(new.schema_id());
        let version = directory.commit_version(next, &self.options)?;
        log::info!("added field {field_name} under schema {}", new.schema_id());
        Ok(version)
    }

    fn acquire_write_lock(&self) -> Result<Box<dyn StorageLock>> {
        self.storage
            .lock_manager()
            .try_acquire_lock(WRITE_LOCK)?
            .ok_or_else(|| {
                TesseraError::invalid_operation("a writer holds the partition write lock")
            })
    }
}
