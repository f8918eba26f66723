//! On-disk format compatibility stamp.
//!
//! A partition records the format it was written with in the plain-text file
//! `index_format_version` (for example `2.1.0`). A binary refuses to open a
//! partition stamped with a newer format than it understands.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, TesseraError};
use crate::storage::{Storage, read_all, write_atomic};

/// Default file name of the format stamp.
pub const INDEX_FORMAT_VERSION_FILE: &str = "index_format_version";

/// Dot-separated format version with component-wise ordering.
///
/// Missing trailing components compare as zero, so `1.2 == 1.2.0` and
/// `1.10 > 1.9`.
#[derive(Debug, Clone)]
pub struct IndexFormatVersion {
    components: Vec<u32>,
}

impl IndexFormatVersion {
    /// Format assumed for partitions written before the stamp existed.
    pub const LEGACY: &'static str = "1.0.0";

    /// Format written by this binary.
    pub const BINARY: &'static str = "2.1.0";

    /// Build from explicit components.
    pub fn new(components: Vec<u32>) -> Self {
        IndexFormatVersion { components }
    }

    /// The legacy format `1.0.0`.
    pub fn legacy() -> Self {
        IndexFormatVersion::new(vec![1, 0, 0])
    }

    /// The format this binary writes.
    pub fn binary() -> Self {
        IndexFormatVersion::new(vec![2, 1, 0])
    }

    /// Numeric components as parsed.
    pub fn components(&self) -> &[u32] {
        &self.components
    }

    /// Load the stamp at `path`.
    ///
    /// A missing file yields [`Self::legacy`] when `may_not_exist` is set and
    /// `NotFound` otherwise.
    pub fn load(storage: &dyn Storage, path: &str, may_not_exist: bool) -> Result<Self> {
        if !storage.file_exists(path) {
            if may_not_exist {
                log::debug!("{path} absent, assuming legacy format {}", Self::LEGACY);
                return Ok(Self::legacy());
            }
            return Err(TesseraError::not_found(path));
        }

        let bytes = read_all(storage, path)?;
        let text = String::from_utf8(bytes)
            .map_err(|e| TesseraError::corrupt(format!("{path} is not UTF-8: {e}")))?;
        text.trim().parse()
    }

    /// Atomically write the stamp to `path`.
    pub fn store(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        write_atomic(storage, path, self.to_string().as_bytes())
    }

    /// Fail with `Unsupported` if this (on-disk) version is newer than `binary`.
    pub fn check_compatible(&self, binary: &IndexFormatVersion) -> Result<()> {
        if self > binary {
            return Err(TesseraError::unsupported(format!(
                "index format {self} is newer than supported format {binary}"
            )));
        }
        Ok(())
    }

    fn component(&self, i: usize) -> u32 {
        self.components.get(i).copied().unwrap_or(0)
    }
}

impl Default for IndexFormatVersion {
    fn default() -> Self {
        Self::binary()
    }
}

impl PartialEq for IndexFormatVersion {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for IndexFormatVersion {}

impl PartialOrd for IndexFormatVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexFormatVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        let len = self.components.len().max(other.components.len());
        (0..len)
            .map(|i| self.component(i).cmp(&other.component(i)))
            .find(|ord| *ord != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    }
}

impl FromStr for IndexFormatVersion {
    type Err = TesseraError;

    fn from_str(s: &str) -> Result<Self> {
        if s.is_empty() {
            return Err(TesseraError::corrupt("empty index format version"));
        }
        let components = s
            .split('.')
            .map(|part| {
                part.parse::<u32>().map_err(|_| {
                    TesseraError::corrupt(format!("invalid index format version: {s:?}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(IndexFormatVersion { components })
    }
}

impl fmt::Display for IndexFormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.components.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

impl Serialize for IndexFormatVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IndexFormatVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    fn v(s: &str) -> IndexFormatVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_ordering() {
        assert!(v("1.10") > v("1.9"));
        assert_eq!(v("1.2"), v("1.2.0"));
        assert!(v("2.1.0") > v("2.0.9"));
        assert!(v("1.0.0") < v("2"));
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("".parse::<IndexFormatVersion>().is_err());
        assert!("1..2".parse::<IndexFormatVersion>().is_err());
        assert!("1.x".parse::<IndexFormatVersion>().is_err());
    }

    #[test]
    fn test_load_missing() {
        let storage = MemoryStorage::new_default();

        let loaded = IndexFormatVersion::load(&storage, INDEX_FORMAT_VERSION_FILE, true).unwrap();
        assert_eq!(loaded, IndexFormatVersion::legacy());

        let err = IndexFormatVersion::load(&storage, INDEX_FORMAT_VERSION_FILE, false).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new_default();
        IndexFormatVersion::binary()
            .store(&storage, INDEX_FORMAT_VERSION_FILE)
            .unwrap();

        assert_eq!(storage.get_bytes(INDEX_FORMAT_VERSION_FILE).unwrap(), b"2.1.0");
        let loaded = IndexFormatVersion::load(&storage, INDEX_FORMAT_VERSION_FILE, false).unwrap();
        assert_eq!(loaded.to_string(), IndexFormatVersion::BINARY);
    }

    #[test]
    fn test_check_compatible() {
        let binary = IndexFormatVersion::binary();
        assert!(v("1.0.0").check_compatible(&binary).is_ok());
        assert!(v("2.1").check_compatible(&binary).is_ok());

        let err = v("9.0").check_compatible(&binary).unwrap_err();
        assert!(matches!(err, TesseraError::Unsupported(_)));
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&v("2.1.0")).unwrap();
        assert_eq!(json, "\"2.1.0\"");
        let back: IndexFormatVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v("2.1.0"));
    }
}
