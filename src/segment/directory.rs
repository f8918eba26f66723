//! The segment catalog of one committed version.
//!
//! A [`SegmentDirectory`] resolves every segment of a [`Version`] to its
//! descriptor and assigns base doc ids: segments are laid out back to back in
//! ascending id order, so the global doc id of `(segment, local)` is
//! `base_doc_id(segment) + local`.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use serde::Serialize;

use crate::config::PartitionOptions;
use crate::error::{Result, TesseraError};
use crate::format::{INDEX_FORMAT_VERSION_FILE, IndexFormatVersion};
use crate::segment::id::{
    DocId, MAX_SEGMENT_ID, SegmentId, VersionId, is_valid_sealed_segment_id,
    parse_segment_dir_name, segment_dir_name,
};
use crate::segment::info::SegmentInfo;
use crate::segment::tracker::VersionTracker;
use crate::segment::version::{Version, version_file_name};
use crate::storage::{PrefixedStorage, Storage, StorageLock, TEMP_SUFFIX};

/// Marker file reserving a segment id for an in-flight merge.
pub const MERGING_MARKER: &str = "_merging";

/// Storage lock held while a version file is published. Partition handles
/// opened separately on the same storage exclude each other through it.
pub const COMMIT_LOCK: &str = "commit";

const COMMIT_LOCK_ATTEMPTS: u32 = 200;
const COMMIT_LOCK_RETRY: Duration = Duration::from_millis(5);

fn acquire_commit_lock(storage: &dyn Storage) -> Result<Box<dyn StorageLock>> {
    let locks = storage.lock_manager();
    for _ in 0..COMMIT_LOCK_ATTEMPTS {
        if let Some(lock) = locks.try_acquire_lock(COMMIT_LOCK)? {
            return Ok(lock);
        }
        std::thread::sleep(COMMIT_LOCK_RETRY);
    }
    Err(TesseraError::invalid_operation(format!(
        "storage lock {COMMIT_LOCK} is held by another partition handle"
    )))
}

/// One segment as seen through a directory.
#[derive(Debug, Clone)]
pub struct SegmentData {
    segment_id: SegmentId,
    base_doc_id: DocId,
    info: SegmentInfo,
    storage: Arc<dyn Storage>,
}

impl SegmentData {
    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn doc_count(&self) -> u32 {
        self.info.doc_count
    }

    pub fn base_doc_id(&self) -> DocId {
        self.base_doc_id
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    /// Storage rooted at `segment_<id>`.
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn directory_name(&self) -> String {
        segment_dir_name(self.segment_id)
    }

    /// Whether `global_doc_id` falls into this segment.
    pub fn contains_global(&self, global_doc_id: DocId) -> bool {
        global_doc_id >= self.base_doc_id
            && (global_doc_id - self.base_doc_id) < self.info.doc_count
    }
}

/// Summary returned by [`SegmentDirectory::cleanup`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CleanupReport {
    pub removed_versions: Vec<VersionId>,
    pub removed_segments: Vec<SegmentId>,
    pub kept_versions: Vec<VersionId>,
}

/// Read-only catalog of the segments of one version.
///
/// Cloning is cheap; clones share the resolved segment table.
#[derive(Debug, Clone)]
pub struct SegmentDirectory {
    storage: Arc<dyn Storage>,
    version: Version,
    format_version: IndexFormatVersion,
    segments: Arc<Vec<SegmentData>>,
    index: Arc<AHashMap<SegmentId, usize>>,
    total_doc_count: u32,
}

impl SegmentDirectory {
    /// Open the newest readable version of the partition in `storage`.
    ///
    /// Unreadable version files are skipped in favor of older ones; a version
    /// whose segments cannot be resolved is `CorruptVersion`.
    pub fn load(storage: Arc<dyn Storage>, options: &PartitionOptions) -> Result<Self> {
        let format_version = Self::check_format(&*storage, options)?;
        let version = Version::load_latest(&*storage)?;
        if version.is_valid() {
            log::info!(
                "loading version {} with {} segments",
                version.version_id(),
                version.segment_count()
            );
        }
        Self::from_version(storage, version, format_version)
    }

    /// Open one specific version.
    pub fn load_version(storage: Arc<dyn Storage>, version_id: VersionId) -> Result<Self> {
        let format_version =
            IndexFormatVersion::load(&*storage, INDEX_FORMAT_VERSION_FILE, true)?;
        format_version.check_compatible(&IndexFormatVersion::binary())?;
        let version = Version::load(&*storage, version_id)?;
        Self::from_version(storage, version, format_version)
    }

    fn check_format(
        storage: &dyn Storage,
        options: &PartitionOptions,
    ) -> Result<IndexFormatVersion> {
        let format_version = IndexFormatVersion::load(
            storage,
            INDEX_FORMAT_VERSION_FILE,
            options.online.tolerate_missing_format_version,
        )?;
        format_version.check_compatible(&IndexFormatVersion::binary())?;
        Ok(format_version)
    }

    /// Resolve every segment of `version` against `storage`.
    pub fn from_version(
        storage: Arc<dyn Storage>,
        version: Version,
        format_version: IndexFormatVersion,
    ) -> Result<Self> {
        let mut segments = Vec::with_capacity(version.segment_count());
        let mut index = AHashMap::with_capacity(version.segment_count());
        let mut base: u64 = 0;

        for segment_id in version.iter_segment_ids() {
            let info = SegmentInfo::load(&*storage, segment_id).map_err(|e| {
                TesseraError::corrupt_version(format!(
                    "version {} references unreadable segment {segment_id}: {e}",
                    version.version_id()
                ))
            })?;
            info.format_version
                .check_compatible(&IndexFormatVersion::binary())?;

            if base + info.doc_count as u64 > DocId::MAX as u64 {
                return Err(TesseraError::corrupt_version(format!(
                    "version {} exceeds the global doc id space",
                    version.version_id()
                )));
            }

            index.insert(segment_id, segments.len());
            segments.push(SegmentData {
                segment_id,
                base_doc_id: base as DocId,
                storage: Arc::new(PrefixedStorage::new(
                    segment_dir_name(segment_id),
                    Arc::clone(&storage),
                )),
                info,
            });
            base += segments[segments.len() - 1].info.doc_count as u64;
        }

        Ok(SegmentDirectory {
            storage,
            version,
            format_version,
            segments: Arc::new(segments),
            index: Arc::new(index),
            total_doc_count: base as u32,
        })
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    pub fn format_version(&self) -> &IndexFormatVersion {
        &self.format_version
    }

    pub fn total_doc_count(&self) -> u32 {
        self.total_doc_count
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// Segments in version order (ascending id).
    pub fn iter_segments(&self) -> impl Iterator<Item = &SegmentData> {
        self.segments.iter()
    }

    pub fn get_segment_data(&self, segment_id: SegmentId) -> Option<&SegmentData> {
        self.index.get(&segment_id).map(|&i| &self.segments[i])
    }

    /// Map a global doc id to `(segment_id, local_doc_id)`.
    pub fn locate(&self, global_doc_id: DocId) -> Option<(SegmentId, DocId)> {
        if global_doc_id >= self.total_doc_count {
            return None;
        }
        // Empty segments share their base with the next segment, so take the
        // last segment whose base is <= the id and skip back over empties.
        let upper = self
            .segments
            .partition_point(|s| s.base_doc_id <= global_doc_id);
        self.segments[..upper]
            .iter()
            .rev()
            .find(|s| s.contains_global(global_doc_id))
            .map(|s| (s.segment_id, global_doc_id - s.base_doc_id))
    }

    /// Map `(segment_id, local_doc_id)` to a global doc id.
    pub fn global_doc_id(&self, segment_id: SegmentId, local_doc_id: DocId) -> Option<DocId> {
        let segment = self.get_segment_data(segment_id)?;
        (local_doc_id < segment.doc_count()).then(|| segment.base_doc_id + local_doc_id)
    }

    /// Segment ids present on disk as `segment_<id>` directories.
    pub fn on_disk_segment_ids(storage: &dyn Storage) -> Result<BTreeSet<SegmentId>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| name.split('/').next())
            .filter_map(parse_segment_dir_name)
            .collect())
    }

    /// Segment ids reserved by in-flight merges.
    pub fn reserved_segment_ids(storage: &dyn Storage) -> Result<BTreeSet<SegmentId>> {
        Ok(storage
            .list_files()?
            .iter()
            .filter_map(|name| {
                let (dir, file) = name.split_once('/')?;
                (file == MERGING_MARKER).then(|| parse_segment_dir_name(dir))?
            })
            .collect())
    }

    /// Next free sealed segment id: one past the largest id in the version
    /// or on disk.
    pub fn next_segment_id(&self) -> Result<SegmentId> {
        let on_disk = Self::on_disk_segment_ids(&*self.storage)?;
        let max = self
            .version
            .iter_segment_ids()
            .chain(on_disk)
            .filter(|&id| is_valid_sealed_segment_id(id))
            .max();
        match max {
            None => Ok(0),
            Some(MAX_SEGMENT_ID) => Err(TesseraError::invalid_operation(
                "segment id space exhausted",
            )),
            Some(id) => Ok(id + 1),
        }
    }

    /// Reserve a segment id for a merge by creating its marker file.
    pub fn reserve_segment_id(storage: &dyn Storage, segment_id: SegmentId) -> Result<()> {
        let marker = format!("{}/{MERGING_MARKER}", segment_dir_name(segment_id));
        let mut output = storage.create_output(&marker)?;
        output.close()
    }

    pub fn release_segment_id(storage: &dyn Storage, segment_id: SegmentId) -> Result<()> {
        storage.delete_file(&format!("{}/{MERGING_MARKER}", segment_dir_name(segment_id)))
    }

    fn next_version_id(&self) -> Result<VersionId> {
        let on_disk_max = Version::list_version_ids(&*self.storage)?
            .into_iter()
            .max()
            .unwrap_or(-1);
        Ok(self.version.version_id().max(on_disk_max) + 1)
    }

    /// The version that [`Self::commit`] would start from.
    pub fn next_version(&self) -> Result<Version> {
        let mut next = self.version.next();
        let id = self.next_version_id()?;
        while next.version_id() < id {
            next = next.next();
        }
        Ok(next)
    }

    /// Publish a new version with `new_segment_ids` added and
    /// `retired_segment_ids` dropped, then reload this directory onto it.
    pub fn commit(
        &mut self,
        new_segment_ids: &[SegmentId],
        retired_segment_ids: &[SegmentId],
        options: &PartitionOptions,
    ) -> Result<Version> {
        let mut next = self.next_version()?;
        for &segment_id in retired_segment_ids {
            next.remove_segment(segment_id);
        }
        for &segment_id in new_segment_ids {
            next.add_segment(segment_id);
        }
        self.commit_version(next, options)
    }

    /// Publish a fully prepared version, then reload onto it.
    ///
    /// Every segment must have a readable descriptor, otherwise nothing is
    /// published and the error is `CorruptVersion`. If another handle
    /// published `version`'s id or a later one since this directory was
    /// loaded, nothing is published and the error is `InvalidOperation`.
    pub fn commit_version(
        &mut self,
        version: Version,
        options: &PartitionOptions,
    ) -> Result<Version> {
        if version.version_id() <= self.version.version_id() {
            return Err(TesseraError::invalid_operation(format!(
                "version {} does not follow {}",
                version.version_id(),
                self.version.version_id()
            )));
        }
        let _commit = acquire_commit_lock(&*self.storage)?;
        let on_disk_max = Version::list_version_ids(&*self.storage)?.into_iter().max();
        if let Some(published) = on_disk_max.filter(|&id| id >= version.version_id()) {
            return Err(TesseraError::invalid_operation(format!(
                "version {published} was published after version {}; refusing to write version {}",
                self.version.version_id(),
                version.version_id()
            )));
        }
        let resolved = Self::from_version(
            Arc::clone(&self.storage),
            version.clone(),
            self.format_version.clone(),
        )?;

        if !self.storage.file_exists(INDEX_FORMAT_VERSION_FILE) {
            IndexFormatVersion::binary().store(&*self.storage, INDEX_FORMAT_VERSION_FILE)?;
            self.format_version = IndexFormatVersion::binary();
        }
        if options.build.sync_on_commit {
            self.storage.sync()?;
        }
        version.store(&*self.storage)?;
        if options.build.sync_on_commit {
            self.storage.sync()?;
        }

        log::info!(
            "committed version {} with segments {:?}",
            version.version_id(),
            version.segment_ids()
        );
        *self = SegmentDirectory {
            format_version: self.format_version.clone(),
            ..resolved
        };
        Ok(version)
    }

    /// Delete old versions and unreferenced segments.
    ///
    /// Keeps the newest `keep_version_count` versions, every pinned version
    /// and this directory's own version. A segment survives if any kept
    /// version references it or a merge has reserved it.
    pub fn cleanup(
        &self,
        tracker: &VersionTracker,
        keep_version_count: usize,
    ) -> Result<CleanupReport> {
        let storage = &*self.storage;
        let version_ids = Version::list_version_ids(storage)?;
        let pinned: BTreeSet<VersionId> = tracker.pinned_versions().into_iter().collect();
        let newest: BTreeSet<VersionId> = version_ids
            .iter()
            .rev()
            .take(keep_version_count.max(1))
            .copied()
            .collect();

        let mut report = CleanupReport::default();
        let mut kept: BTreeMap<VersionId, Option<Version>> = BTreeMap::new();
        for &version_id in &version_ids {
            let keep = newest.contains(&version_id)
                || pinned.contains(&version_id)
                || version_id == self.version.version_id();
            if keep {
                kept.insert(version_id, None);
            } else {
                storage.delete_file(&version_file_name(version_id))?;
                report.removed_versions.push(version_id);
            }
        }

        for name in storage.list_files()? {
            if name.starts_with("version.") && name.ends_with(TEMP_SUFFIX) {
                storage.delete_file(&name)?;
            }
        }

        let mut referenced: BTreeSet<SegmentId> = self.version.iter_segment_ids().collect();
        for (&version_id, slot) in kept.iter_mut() {
            match Version::load(storage, version_id) {
                Ok(version) => {
                    referenced.extend(version.iter_segment_ids());
                    *slot = Some(version);
                }
                Err(e) => {
                    log::warn!(
                        "cleanup cannot read kept version {version_id} ({e}), keeping all segments"
                    );
                    report.kept_versions = kept.keys().copied().collect();
                    return Ok(report);
                }
            }
        }

        let reserved = Self::reserved_segment_ids(storage)?;
        for segment_id in Self::on_disk_segment_ids(storage)? {
            if referenced.contains(&segment_id) || reserved.contains(&segment_id) {
                continue;
            }
            storage.delete_dir(&segment_dir_name(segment_id))?;
            report.removed_segments.push(segment_id);
        }

        report.kept_versions = kept.keys().copied().collect();
        if !report.removed_versions.is_empty() || !report.removed_segments.is_empty() {
            log::info!(
                "cleanup removed versions {:?} and segments {:?}",
                report.removed_versions,
                report.removed_segments
            );
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn storage_with_segments(doc_counts: &[(SegmentId, u32)]) -> Arc<dyn Storage> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        for &(segment_id, doc_count) in doc_counts {
            SegmentInfo::new(doc_count, 0)
                .store(&*storage, segment_id)
                .unwrap();
        }
        storage
    }

    fn open(storage: &Arc<dyn Storage>) -> SegmentDirectory {
        SegmentDirectory::load(Arc::clone(storage), &PartitionOptions::default()).unwrap()
    }

    #[test]
    fn test_empty_partition() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let directory = open(&storage);
        assert!(!directory.version().is_valid());
        assert_eq!(directory.total_doc_count(), 0);
        assert_eq!(directory.next_segment_id().unwrap(), 0);
        assert_eq!(directory.locate(0), None);
    }

    #[test]
    fn test_base_doc_ids_skip_empty_segments() {
        let storage = storage_with_segments(&[(0, 10), (1, 0), (2, 5)]);
        let mut directory = open(&storage);
        directory
            .commit(&[0, 1, 2], &[], &PartitionOptions::default())
            .unwrap();

        assert_eq!(directory.get_segment_data(1).unwrap().base_doc_id(), 10);
        assert_eq!(directory.get_segment_data(2).unwrap().base_doc_id(), 10);
        assert_eq!(directory.total_doc_count(), 15);

        assert_eq!(directory.locate(9), Some((0, 9)));
        assert_eq!(directory.locate(10), Some((2, 0)));
        assert_eq!(directory.locate(14), Some((2, 4)));
        assert_eq!(directory.locate(15), None);
        assert_eq!(directory.global_doc_id(2, 4), Some(14));
        assert_eq!(directory.global_doc_id(2, 5), None);
    }

    #[test]
    fn test_commit_publishes_and_reloads() {
        let storage = storage_with_segments(&[(0, 3), (1, 4)]);
        let options = PartitionOptions::default();
        let mut directory = open(&storage);

        let v0 = directory.commit(&[0], &[], &options).unwrap();
        assert_eq!(v0.version_id(), 0);
        let v1 = directory.commit(&[1], &[0], &options).unwrap();
        assert_eq!(v1.version_id(), 1);
        assert_eq!(v1.segment_ids(), vec![1]);
        assert!(storage.file_exists("index_format_version"));

        let reopened = open(&storage);
        assert_eq!(reopened.version().version_id(), 1);
        assert_eq!(reopened.total_doc_count(), 4);
        assert_eq!(
            SegmentDirectory::load_version(Arc::clone(&storage), 0)
                .unwrap()
                .total_doc_count(),
            3
        );
    }

    #[test]
    fn test_stale_handle_cannot_overwrite_published_version() {
        let storage = storage_with_segments(&[(0, 3), (1, 4)]);
        let options = PartitionOptions::default();
        let mut first = open(&storage);
        first.commit(&[0], &[], &options).unwrap();

        let mut a = open(&storage);
        let mut b = open(&storage);
        a.commit(&[1], &[], &options).unwrap();

        // `b` still sits on version 0 and would also pick id 1 from its view.
        let stale = b.version().next();
        let err = b.commit_version(stale, &options).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidOperation(_)));

        let latest = open(&storage);
        assert_eq!(latest.version().version_id(), 1);
        assert_eq!(latest.version().segment_ids(), vec![0, 1]);
        assert!(!storage.lock_manager().lock_exists(COMMIT_LOCK));
    }

    #[test]
    fn test_commit_fails_while_commit_lock_is_held() {
        let storage = storage_with_segments(&[(0, 3)]);
        let options = PartitionOptions::default();
        let mut directory = open(&storage);

        let held = storage.lock_manager().acquire_lock(COMMIT_LOCK).unwrap();
        let err = directory.commit(&[0], &[], &options).unwrap_err();
        assert!(matches!(err, TesseraError::InvalidOperation(_)));
        assert!(Version::list_version_ids(&*storage).unwrap().is_empty());

        drop(held);
        assert_eq!(directory.commit(&[0], &[], &options).unwrap().version_id(), 0);
    }

    #[test]
    fn test_commit_rejects_missing_segment() {
        let storage = storage_with_segments(&[(0, 3)]);
        let mut directory = open(&storage);

        let err = directory
            .commit(&[0, 7], &[], &PartitionOptions::default())
            .unwrap_err();
        assert!(matches!(err, TesseraError::CorruptVersion(_)));
        assert!(Version::list_version_ids(&*storage).unwrap().is_empty());
    }

    #[test]
    fn test_load_skips_temp_and_torn_versions() {
        let memory = Arc::new(MemoryStorage::new_default());
        let storage: Arc<dyn Storage> = memory.clone();
        SegmentInfo::new(3, 0).store(&*storage, 0).unwrap();
        let options = PartitionOptions::default();
        let mut directory = open(&storage);
        directory.commit(&[0], &[], &options).unwrap();

        let staged = directory.next_version().unwrap();
        staged.store(&*storage).unwrap();
        storage.rename_file("version.1", "version.1.tmp").unwrap();
        assert_eq!(open(&storage).version().version_id(), 0);

        let bytes = memory.get_bytes("version.1.tmp").unwrap();
        memory.put_bytes("version.1", &bytes[..bytes.len() - 1]);
        assert_eq!(open(&storage).version().version_id(), 0);
    }

    #[test]
    fn test_missing_segment_is_corrupt_version() {
        let storage = storage_with_segments(&[(0, 3)]);
        let mut directory = open(&storage);
        directory
            .commit(&[0], &[], &PartitionOptions::default())
            .unwrap();
        storage.delete_dir("segment_0").unwrap();

        let err = SegmentDirectory::load(storage, &PartitionOptions::default()).unwrap_err();
        assert!(matches!(err, TesseraError::CorruptVersion(_)));
    }

    #[test]
    fn test_newer_format_is_unsupported() {
        let storage = storage_with_segments(&[]);
        crate::storage::write_atomic(&*storage, INDEX_FORMAT_VERSION_FILE, b"9.0").unwrap();
        let err = SegmentDirectory::load(storage, &PartitionOptions::default()).unwrap_err();
        assert!(matches!(err, TesseraError::Unsupported(_)));
    }

    #[test]
    fn test_next_segment_id_sees_disk_and_reservations() {
        let storage = storage_with_segments(&[(0, 1), (4, 1)]);
        let mut directory = open(&storage);
        directory
            .commit(&[0], &[], &PartitionOptions::default())
            .unwrap();
        assert_eq!(directory.next_segment_id().unwrap(), 5);

        SegmentDirectory::reserve_segment_id(&*storage, 9).unwrap();
        assert_eq!(directory.next_segment_id().unwrap(), 10);
        assert_eq!(
            SegmentDirectory::reserved_segment_ids(&*storage).unwrap(),
            BTreeSet::from([9])
        );
    }

    #[test]
    fn test_cleanup_respects_pins_and_reservations() {
        let storage = storage_with_segments(&[(0, 1), (1, 1), (2, 1), (3, 1)]);
        let options = PartitionOptions::default();
        let tracker = VersionTracker::new();
        let mut directory = open(&storage);

        directory.commit(&[0], &[], &options).unwrap();
        let pin = tracker.pin(0);
        directory.commit(&[1], &[0], &options).unwrap();
        directory.commit(&[2], &[1], &options).unwrap();
        directory.commit(&[3], &[2], &options).unwrap();
        SegmentDirectory::reserve_segment_id(&*storage, 8).unwrap();

        let report = directory.cleanup(&tracker, 2).unwrap();
        assert_eq!(report.removed_versions, vec![1]);
        assert_eq!(report.removed_segments, vec![1]);
        assert_eq!(report.kept_versions, vec![0, 2, 3]);
        assert!(storage.file_exists("segment_0/segment_info"));
        assert!(storage.file_exists("segment_8/_merging"));

        drop(pin);
        let report = directory.cleanup(&tracker, 1).unwrap();
        assert_eq!(report.removed_versions, vec![0, 2]);
        assert_eq!(report.removed_segments, vec![0, 2]);
        assert_eq!(open(&storage).version().segment_ids(), vec![3]);
    }
}
