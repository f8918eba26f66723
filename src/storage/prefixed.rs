use std::sync::Arc;

use crate::error::Result;
use crate::storage::{LockManager, Storage, StorageInput, StorageOutput};

/// Storage view rooted at a sub-directory of another storage.
///
/// Segment readers get a view rooted at `segment_<id>`, and multi-part
/// partitions open each part through a view rooted at the part directory.
#[derive(Debug, Clone)]
pub struct PrefixedStorage {
    prefix: String,
    inner: Arc<dyn Storage>,
}

impl PrefixedStorage {
    /// Create a new prefixed storage namespace.
    pub fn new(prefix: impl Into<String>, inner: Arc<dyn Storage>) -> Self {
        let prefix = prefix.into().trim_matches('/').to_string();
        Self { prefix, inner }
    }

    /// The directory this view is rooted at.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn map_name(&self, name: &str) -> String {
        match (self.prefix.is_empty(), name.is_empty()) {
            (true, _) => name.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, name),
        }
    }
}

impl Storage for PrefixedStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.inner.open_input(&self.map_name(name))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.inner.create_output(&self.map_name(name))
    }

    fn file_exists(&self, name: &str) -> bool {
        self.inner.file_exists(&self.map_name(name))
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.inner.delete_file(&self.map_name(name))
    }

    fn list_files(&self) -> Result<Vec<String>> {
        if self.prefix.is_empty() {
            return self.inner.list_files();
        }
        self.inner.list_dir(&self.prefix)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.inner.file_size(&self.map_name(name))
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.inner
            .rename_file(&self.map_name(old_name), &self.map_name(new_name))
    }

    fn sync(&self) -> Result<()> {
        self.inner.sync()
    }

    fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.inner.lock_manager()
    }

    fn close(&mut self) -> Result<()> {
        // Views do not own the underlying storage.
        Ok(())
    }

    fn delete_dir(&self, dir: &str) -> Result<usize> {
        self.inner.delete_dir(&self.map_name(dir))
    }
}
