//! Reader pins on committed versions.
//!
//! Cleanup consults the tracker before deleting a version file or any
//! segment that a pinned version still references.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::segment::id::VersionId;

/// Shared count of open readers per version id.
#[derive(Debug, Clone, Default)]
pub struct VersionTracker {
    pins: Arc<Mutex<BTreeMap<VersionId, usize>>>,
}

impl VersionTracker {
    pub fn new() -> Self {
        VersionTracker::default()
    }

    /// Pin `version_id` until the returned guard is dropped.
    pub fn pin(&self, version_id: VersionId) -> VersionPin {
        *self.pins.lock().entry(version_id).or_insert(0) += 1;
        log::trace!("pinned version {version_id}");
        VersionPin {
            version_id,
            pins: Arc::clone(&self.pins),
        }
    }

    pub fn is_pinned(&self, version_id: VersionId) -> bool {
        self.pins.lock().contains_key(&version_id)
    }

    /// Currently pinned version ids, ascending.
    pub fn pinned_versions(&self) -> Vec<VersionId> {
        self.pins.lock().keys().copied().collect()
    }

    pub fn pin_count(&self, version_id: VersionId) -> usize {
        self.pins.lock().get(&version_id).copied().unwrap_or(0)
    }
}

/// RAII pin on one version.
#[derive(Debug)]
pub struct VersionPin {
    version_id: VersionId,
    pins: Arc<Mutex<BTreeMap<VersionId, usize>>>,
}

impl VersionPin {
    pub fn version_id(&self) -> VersionId {
        self.version_id
    }
}

impl Clone for VersionPin {
    fn clone(&self) -> Self {
        *self.pins.lock().entry(self.version_id).or_insert(0) += 1;
        VersionPin {
            version_id: self.version_id,
            pins: Arc::clone(&self.pins),
        }
    }
}

impl Drop for VersionPin {
    fn drop(&mut self) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(&self.version_id) {
            *count -= 1;
            if *count == 0 {
                pins.remove(&self.version_id);
            }
        }
    }
}
