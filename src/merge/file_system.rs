//! Staged output of a merge.
//!
//! Work items write their files under `_merge/<uuid>/` and register them
//! with the thread that wrote them. [`MergeFileSystem::commit`] moves the
//! calling thread's files to their final names, so output only becomes
//! visible when a worker thread finishes cleanly. Whatever is still staged
//! when the file system is dropped is deleted.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use ahash::AHashMap;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::Result;
use crate::storage::Storage;

/// Root directory of merge staging areas.
pub const MERGE_STAGING_DIR: &str = "_merge";

#[derive(Debug)]
pub struct MergeFileSystem {
    storage: Arc<dyn Storage>,
    staging_dir: String,
    pending: Mutex<AHashMap<ThreadId, Vec<String>>>,
    committed: Mutex<Vec<String>>,
}

impl MergeFileSystem {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        MergeFileSystem {
            storage,
            staging_dir: format!("{MERGE_STAGING_DIR}/{}", Uuid::new_v4().simple()),
            pending: Mutex::new(AHashMap::new()),
            committed: Mutex::new(Vec::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    pub fn staging_dir(&self) -> &str {
        &self.staging_dir
    }

    fn staged_path(&self, path: &str) -> String {
        format!("{}/{path}", self.staging_dir)
    }

    /// Produce `path` (relative to the partition root) through `write`,
    /// which receives the storage and the staged name to write to.
    pub fn stage<F>(&self, path: &str, write: F) -> Result<()>
    where
        F: FnOnce(&dyn Storage, &str) -> Result<()>,
    {
        let staged = self.staged_path(path);
        write(self.storage.as_ref(), &staged)?;
        self.pending
            .lock()
            .entry(thread::current().id())
            .or_default()
            .push(path.to_string());
        Ok(())
    }

    /// Publish the files staged by the calling thread. Returns how many
    /// files moved.
    pub fn commit(&self) -> Result<usize> {
        let files = self
            .pending
            .lock()
            .remove(&thread::current().id())
            .unwrap_or_default();
        self.publish(files)
    }

    /// Publish files staged by every thread.
    pub fn commit_all(&self) -> Result<usize> {
        let files: Vec<String> = self.pending.lock().drain().flat_map(|(_, f)| f).collect();
        self.publish(files)
    }

    fn publish(&self, files: Vec<String>) -> Result<usize> {
        let count = files.len();
        for path in files {
            self.storage.rename_file(&self.staged_path(&path), &path)?;
            self.committed.lock().push(path);
        }
        if count > 0 {
            log::debug!("merge file system published {count} files");
        }
        Ok(count)
    }

    pub fn staged_count(&self) -> usize {
        self.pending.lock().values().map(Vec::len).sum()
    }

    /// Final paths of every published file.
    pub fn committed_files(&self) -> Vec<String> {
        self.committed.lock().clone()
    }

    /// Drop everything still staged.
    pub fn abort(&self) -> Result<()> {
        self.pending.lock().clear();
        self.storage.delete_dir(&self.staging_dir)?;
        Ok(())
    }
}

impl Drop for MergeFileSystem {
    fn drop(&mut self) {
        if let Err(e) = self.storage.delete_dir(&self.staging_dir) {
            log::warn!("failed to remove merge staging {}: {e}", self.staging_dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStorage, write_atomic};

    #[test]
    fn test_files_visible_only_after_commit() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let fs = MergeFileSystem::new(Arc::clone(&storage));

        fs.stage("segment_3/attribute/f/data", |s, name| write_atomic(s, name, b"x"))
            .unwrap();
        assert!(!storage.file_exists("segment_3/attribute/f/data"));
        assert_eq!(fs.staged_count(), 1);

        assert_eq!(fs.commit().unwrap(), 1);
        assert!(storage.file_exists("segment_3/attribute/f/data"));
        assert_eq!(fs.committed_files(), vec!["segment_3/attribute/f/data"]);
    }

    #[test]
    fn test_commit_is_per_thread() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        let fs = Arc::new(MergeFileSystem::new(Arc::clone(&storage)));

        let worker = Arc::clone(&fs);
        std::thread::spawn(move || {
            worker
                .stage("segment_1/a", |s, name| write_atomic(s, name, b"a"))
                .unwrap();
        })
        .join()
        .unwrap();

        assert_eq!(fs.commit().unwrap(), 0);
        assert!(!storage.file_exists("segment_1/a"));
        assert_eq!(fs.commit_all().unwrap(), 1);
        assert!(storage.file_exists("segment_1/a"));
    }

    #[test]
    fn test_drop_removes_staging() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new_default());
        {
            let fs = MergeFileSystem::new(Arc::clone(&storage));
            fs.stage("segment_1/a", |s, name| write_atomic(s, name, b"a"))
                .unwrap();
        }
        assert!(storage.list_files().unwrap().is_empty());
    }
}
