//! Storage abstraction layer for Tessera.
//!
//! The engine never touches the filesystem directly. Everything goes through
//! a [`Storage`] (file-backed or in-memory, optionally viewed through a
//! [`PrefixedStorage`]), and every durable metadata write goes through
//! [`write_atomic`] or [`write_struct_atomic`]: write a `.tmp` sibling, sync,
//! then rename over the final name.

pub mod file;
pub mod memory;
pub mod prefixed;
pub mod structured;
pub mod traits;

use std::io::{Read, Write};

pub use file::*;
pub use memory::*;
pub use prefixed::*;
pub use structured::*;
pub use traits::*;

use crate::error::Result;

/// Suffix for files that are not yet published.
pub const TEMP_SUFFIX: &str = ".tmp";

/// Atomically replace `name` with `data`.
pub fn write_atomic(storage: &dyn Storage, name: &str, data: &[u8]) -> Result<()> {
    let temp_name = format!("{name}{TEMP_SUFFIX}");
    {
        let mut output = storage.create_output(&temp_name)?;
        output.write_all(data)?;
        output.flush_and_sync()?;
        output.close()?;
    }
    storage.rename_file(&temp_name, name)
}

/// Atomically replace `name` with a checksummed structured record.
pub fn write_struct_atomic<F>(storage: &dyn Storage, name: &str, write: F) -> Result<()>
where
    F: FnOnce(&mut StructWriter<Box<dyn StorageOutput>>) -> Result<()>,
{
    let temp_name = format!("{name}{TEMP_SUFFIX}");
    let mut writer = StructWriter::new(storage.create_output(&temp_name)?);
    if let Err(e) = write(&mut writer) {
        drop(writer);
        let _ = storage.delete_file(&temp_name);
        return Err(e);
    }
    writer.close()?;
    storage.rename_file(&temp_name, name)
}

/// Read a whole file into memory.
pub fn read_all(storage: &dyn Storage, name: &str) -> Result<Vec<u8>> {
    let mut input = storage.open_input(name)?;
    let mut data = Vec::with_capacity(input.size()? as usize);
    input.read_to_end(&mut data)?;
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_atomic_leaves_no_temp() {
        let storage = MemoryStorage::new_default();
        write_atomic(&storage, "index_format_version", b"2.1.0").unwrap();

        assert_eq!(storage.list_files().unwrap(), vec!["index_format_version"]);
        assert_eq!(read_all(&storage, "index_format_version").unwrap(), b"2.1.0");
    }

    #[test]
    fn test_failed_struct_write_is_not_published() {
        let storage = MemoryStorage::new_default();
        let result = write_struct_atomic(&storage, "version.0", |w| {
            w.write_u32(1)?;
            Err(crate::error::TesseraError::internal("boom"))
        });

        assert!(result.is_err());
        assert!(!storage.file_exists("version.0"));
        assert!(!storage.file_exists("version.0.tmp"));
    }
}
