//! File-based storage implementation.
//!
//! Relative names containing `/` map onto nested directories under the
//! storage root. Parent directories are created on demand and listings
//! recurse, so a partition laid out as `segment_<id>/attribute/<field>/data`
//! round-trips through [`Storage::list_files`].

use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ahash::AHashMap;
use parking_lot::Mutex;

use crate::error::{Result, TesseraError};
use crate::storage::traits::{
    LockManager, Storage, StorageConfig, StorageError, StorageInput, StorageLock, StorageOutput,
};

/// A file-based storage implementation.
#[derive(Debug)]
pub struct FileStorage {
    /// The root directory for storage.
    directory: PathBuf,
    /// Storage configuration.
    config: StorageConfig,
    /// Lock manager for coordinating access.
    lock_manager: Arc<FileLockManager>,
    /// Whether the storage is closed.
    closed: bool,
}

impl FileStorage {
    /// Create a new file storage in the given directory.
    pub fn new<P: AsRef<Path>>(directory: P, config: StorageConfig) -> Result<Self> {
        let directory = directory.as_ref().to_path_buf();

        if !directory.exists() {
            std::fs::create_dir_all(&directory)
                .map_err(|e| TesseraError::storage(format!("Failed to create directory: {e}")))?;
        }

        if !directory.is_dir() {
            return Err(TesseraError::storage(format!(
                "Path is not a directory: {}",
                directory.display()
            )));
        }

        let lock_manager = Arc::new(FileLockManager::new(directory.clone()));

        Ok(FileStorage {
            directory,
            config,
            lock_manager,
            closed: false,
        })
    }

    /// Root directory of this storage.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn file_path(&self, name: &str) -> PathBuf {
        self.directory.join(name)
    }

    fn check_closed(&self) -> Result<()> {
        if self.closed {
            Err(StorageError::StorageClosed.into())
        } else {
            Ok(())
        }
    }

    fn ensure_parent(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::IoError(format!("Failed to create directory: {e}")))?;
            }
        }
        Ok(())
    }

    fn collect_files(&self, dir: &Path, files: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir).map_err(|e| StorageError::IoError(e.to_string()))? {
            let entry = entry.map_err(|e| StorageError::IoError(e.to_string()))?;
            let path = entry.path();

            if path.is_dir() {
                self.collect_files(&path, files)?;
            } else if path.is_file() {
                if let Ok(relative) = path.strip_prefix(&self.directory) {
                    let name = relative
                        .components()
                        .filter_map(|c| c.as_os_str().to_str())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(name);
                }
            }
        }
        Ok(())
    }

    /// Remove directories left empty after file deletions, bottom-up.
    fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current != self.directory && current.starts_with(&self.directory) {
            if std::fs::remove_dir(&current).is_err() {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

fn map_not_found(name: &str, e: std::io::Error) -> StorageError {
    if e.kind() == std::io::ErrorKind::NotFound {
        StorageError::FileNotFound(name.to_string())
    } else {
        StorageError::IoError(e.to_string())
    }
}

impl Storage for FileStorage {
    fn open_input(&self, name: &str) -> Result<Box<dyn StorageInput>> {
        self.check_closed()?;

        let path = self.file_path(name);
        let file = File::open(&path).map_err(|e| map_not_found(name, e))?;

        Ok(Box::new(FileInput::new(file, self.config.buffer_size)?))
    }

    fn create_output(&self, name: &str) -> Result<Box<dyn StorageOutput>> {
        self.check_closed()?;

        let path = self.file_path(name);
        self.ensure_parent(&path)?;
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| StorageError::IoError(e.to_string()))?;

        Ok(Box::new(FileOutput::new(
            file,
            self.config.buffer_size,
            self.config.sync_writes,
        )))
    }

    fn file_exists(&self, name: &str) -> bool {
        if self.closed {
            return false;
        }

        self.file_path(name).is_file()
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        self.check_closed()?;

        let path = self.file_path(name);
        if path.exists() {
            std::fs::remove_file(&path)
                .map_err(|e| StorageError::IoError(format!("Failed to delete file: {e}")))?;
        }

        Ok(())
    }

    fn list_files(&self) -> Result<Vec<String>> {
        self.check_closed()?;

        let mut files = Vec::new();
        self.collect_files(&self.directory, &mut files)?;
        files.sort();
        Ok(files)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.check_closed()?;

        let metadata = self
            .file_path(name)
            .metadata()
            .map_err(|e| map_not_found(name, e))?;

        Ok(metadata.len())
    }

    fn rename_file(&self, old_name: &str, new_name: &str) -> Result<()> {
        self.check_closed()?;

        let old_path = self.file_path(old_name);
        let new_path = self.file_path(new_name);
        self.ensure_parent(&new_path)?;

        std::fs::rename(&old_path, &new_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => StorageError::FileNotFound(old_name.to_string()),
            _ => StorageError::IoError(format!("Failed to rename file: {e}")),
        })?;

        // Make the new directory entry durable.
        if let Some(parent) = new_path.parent() {
            if let Ok(dir) = File::open(parent) {
                let _ = dir.sync_all();
            }
        }

        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.check_closed()?;
        let dir = File::open(&self.directory).map_err(|e| StorageError::IoError(e.to_string()))?;
        dir.sync_all()
            .map_err(|e| TesseraError::storage(format!("Failed to sync directory: {e}")))?;
        Ok(())
    }

    fn lock_manager(&self) -> Arc<dyn LockManager> {
        self.lock_manager.clone()
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.lock_manager.release_all()?;
        Ok(())
    }

    fn delete_dir(&self, dir: &str) -> Result<usize> {
        self.check_closed()?;

        let path = self.file_path(dir.trim_end_matches('/'));
        if !path.is_dir() {
            return Ok(0);
        }

        let mut files = Vec::new();
        self.collect_files(&path, &mut files)?;
        std::fs::remove_dir_all(&path)
            .map_err(|e| StorageError::IoError(format!("Failed to delete directory: {e}")))?;
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent);
        }

        Ok(files.len())
    }
}

/// A file input implementation.
#[derive(Debug)]
pub struct FileInput {
    reader: BufReader<File>,
    size: u64,
}

impl FileInput {
    fn new(file: File, buffer_size: usize) -> Result<Self> {
        let metadata = file
            .metadata()
            .map_err(|e| TesseraError::storage(format!("Failed to get file metadata: {e}")))?;

        Ok(FileInput {
            reader: BufReader::with_capacity(buffer_size, file),
            size: metadata.len(),
        })
    }
}

impl Read for FileInput {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.reader.read(buf)
    }
}

impl Seek for FileInput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        self.reader.seek(pos)
    }
}

impl StorageInput for FileInput {
    fn size(&self) -> Result<u64> {
        Ok(self.size)
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// A file output implementation.
#[derive(Debug)]
pub struct FileOutput {
    writer: BufWriter<File>,
    sync_writes: bool,
    position: u64,
}

impl FileOutput {
    fn new(file: File, buffer_size: usize, sync_writes: bool) -> Self {
        FileOutput {
            writer: BufWriter::with_capacity(buffer_size, file),
            sync_writes,
            position: 0,
        }
    }
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let bytes_written = self.writer.write(buf)?;
        self.position += bytes_written as u64;

        if self.sync_writes {
            self.writer.flush()?;
        }

        Ok(bytes_written)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.writer.flush()
    }
}

impl Seek for FileOutput {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = self.writer.seek(pos)?;
        self.position = new_pos;
        Ok(new_pos)
    }
}

impl StorageOutput for FileOutput {
    fn flush_and_sync(&mut self) -> Result<()> {
        self.writer
            .flush()
            .map_err(|e| TesseraError::storage(format!("Failed to flush: {e}")))?;

        self.writer
            .get_ref()
            .sync_all()
            .map_err(|e| TesseraError::storage(format!("Failed to sync: {e}")))?;

        Ok(())
    }

    fn position(&self) -> Result<u64> {
        Ok(self.position)
    }

    fn close(&mut self) -> Result<()> {
        self.flush_and_sync()
    }
}

/// A file-based lock manager.
///
/// A lock is a `<name>.lock` file created with `create_new`, so two
/// processes opening the same directory exclude each other as well.
#[derive(Debug)]
pub struct FileLockManager {
    directory: PathBuf,
    locks: Arc<Mutex<AHashMap<String, PathBuf>>>,
}

impl FileLockManager {
    fn new(directory: PathBuf) -> Self {
        FileLockManager {
            directory,
            locks: Arc::new(Mutex::new(AHashMap::new())),
        }
    }

    fn lock_path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{name}.lock"))
    }
}

impl LockManager for FileLockManager {
    fn acquire_lock(&self, name: &str) -> Result<Box<dyn StorageLock>> {
        let lock_path = self.lock_path(name);

        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::AlreadyExists {
                    StorageError::LockFailed(name.to_string())
                } else {
                    StorageError::IoError(e.to_string())
                }
            })?;

        self.locks.lock().insert(name.to_string(), lock_path.clone());

        Ok(Box::new(FileLock {
            name: name.to_string(),
            path: lock_path,
            registry: self.locks.clone(),
            released: false,
        }))
    }

    fn lock_exists(&self, name: &str) -> bool {
        self.locks.lock().contains_key(name) || self.lock_path(name).exists()
    }

    fn release_all(&self) -> Result<()> {
        let mut locks = self.locks.lock();

        for (_, path) in locks.drain() {
            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| TesseraError::storage(format!("Failed to release lock: {e}")))?;
            }
        }

        Ok(())
    }
}

/// A file-based lock implementation.
#[derive(Debug)]
struct FileLock {
    name: String,
    path: PathBuf,
    registry: Arc<Mutex<AHashMap<String, PathBuf>>>,
    released: bool,
}

impl StorageLock for FileLock {
    fn name(&self) -> &str {
        &self.name
    }

    fn release(&mut self) -> Result<()> {
        if !self.released {
            self.registry.lock().remove(&self.name);
            if self.path.exists() {
                std::fs::remove_file(&self.path)
                    .map_err(|e| TesseraError::storage(format!("Failed to release lock: {e}")))?;
            }
            self.released = true;
        }
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.released && self.path.exists()
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            log::warn!("failed to release lock {}: {e}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn create_test_storage() -> (TempDir, FileStorage) {
        let temp_dir = TempDir::new().unwrap();
        let storage = FileStorage::new(temp_dir.path(), StorageConfig::default()).unwrap();
        (temp_dir, storage)
    }

    #[test]
    fn test_create_and_read_file() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("test.txt").unwrap();
        output.write_all(b"Hello, World!").unwrap();
        output.close().unwrap();

        let mut input = storage.open_input("test.txt").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();

        assert_eq!(buffer, b"Hello, World!");
        assert_eq!(input.size().unwrap(), 13);
    }

    #[test]
    fn test_nested_paths_and_recursive_listing() {
        let (_temp_dir, storage) = create_test_storage();

        for name in [
            "version.0",
            "segment_0/segment_info",
            "segment_0/attribute/price/data",
            "segment_1/deletionmap/data_0",
        ] {
            let mut output = storage.create_output(name).unwrap();
            output.write_all(b"x").unwrap();
            output.close().unwrap();
        }

        let files = storage.list_files().unwrap();
        assert_eq!(
            files,
            vec![
                "segment_0/attribute/price/data",
                "segment_0/segment_info",
                "segment_1/deletionmap/data_0",
                "version.0",
            ]
        );

        assert_eq!(
            storage.list_dir("segment_0").unwrap(),
            vec!["attribute/price/data", "segment_info"]
        );

        assert_eq!(storage.delete_dir("segment_0").unwrap(), 2);
        assert!(!storage.file_exists("segment_0/segment_info"));
        assert!(storage.file_exists("segment_1/deletionmap/data_0"));
    }

    #[test]
    fn test_rename_replaces_target() {
        let (_temp_dir, storage) = create_test_storage();

        let mut output = storage.create_output("version.1.tmp").unwrap();
        output.write_all(b"new").unwrap();
        output.close().unwrap();
        let mut output = storage.create_output("version.1").unwrap();
        output.write_all(b"old").unwrap();
        output.close().unwrap();

        storage.rename_file("version.1.tmp", "version.1").unwrap();
        assert!(!storage.file_exists("version.1.tmp"));

        let mut input = storage.open_input("version.1").unwrap();
        let mut buffer = Vec::new();
        input.read_to_end(&mut buffer).unwrap();
        assert_eq!(buffer, b"new");
    }

    #[test]
    fn test_file_not_found() {
        let (_temp_dir, storage) = create_test_storage();

        let err = storage.open_input("nonexistent.txt").unwrap_err();
        assert!(err.is_not_found());

        let err = storage.file_size("nonexistent.txt").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_lock_exclusion_and_release_on_drop() {
        let (_temp_dir, storage) = create_test_storage();
        let manager = storage.lock_manager();

        let lock = manager.acquire_lock("write").unwrap();
        assert_eq!(lock.name(), "write");
        assert!(lock.is_valid());
        assert!(manager.try_acquire_lock("write").unwrap().is_none());

        drop(lock);
        assert!(!manager.lock_exists("write"));
        assert!(manager.try_acquire_lock("write").unwrap().is_some());
    }

    #[test]
    fn test_storage_close() {
        let (_temp_dir, mut storage) = create_test_storage();

        storage.close().unwrap();
        assert!(storage.create_output("test.txt").is_err());
    }
}
