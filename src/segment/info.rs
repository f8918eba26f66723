//! The `segment_info` descriptor stored in every segment directory.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::format::IndexFormatVersion;
use crate::schema::SchemaId;
use crate::segment::id::{SegmentId, segment_dir_name};
use crate::storage::{Storage, read_all, write_atomic};

/// File name of the descriptor inside a segment directory.
pub const SEGMENT_INFO_FILE: &str = "segment_info";

/// Path of `segment_<id>/segment_info`.
pub fn segment_info_path(segment_id: SegmentId) -> String {
    format!("{}/{SEGMENT_INFO_FILE}", segment_dir_name(segment_id))
}

/// Descriptor of a sealed segment, stored as JSON.
///
/// Its presence is what makes a segment directory complete: it is written
/// last, after every data file of the segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub doc_count: u32,
    /// Creation time, microseconds since the epoch.
    pub timestamp: i64,
    pub format_version: IndexFormatVersion,
    pub schema_id: SchemaId,
    /// Whether the segment was produced by a merge.
    #[serde(default)]
    pub merged: bool,
    /// Segments this one was merged from.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<SegmentId>,
}

impl SegmentInfo {
    pub fn new(doc_count: u32, schema_id: SchemaId) -> Self {
        SegmentInfo {
            doc_count,
            timestamp: Utc::now().timestamp_micros(),
            format_version: IndexFormatVersion::binary(),
            schema_id,
            merged: false,
            sources: Vec::new(),
        }
    }

    pub fn merged_from(doc_count: u32, schema_id: SchemaId, sources: Vec<SegmentId>) -> Self {
        SegmentInfo {
            merged: true,
            sources,
            ..SegmentInfo::new(doc_count, schema_id)
        }
    }

    /// Read `segment_<id>/segment_info`.
    pub fn load(storage: &dyn Storage, segment_id: SegmentId) -> Result<SegmentInfo> {
        let path = segment_info_path(segment_id);
        let bytes = read_all(storage, &path)?;
        serde_json::from_slice(&bytes)
            .map_err(|e| TesseraError::corrupt(format!("{path}: {e}")))
    }

    /// Atomically write `segment_<id>/segment_info`.
    pub fn store(&self, storage: &dyn Storage, segment_id: SegmentId) -> Result<()> {
        self.store_at(storage, &segment_info_path(segment_id))
    }

    /// Atomically write the descriptor to an arbitrary path.
    pub fn store_at(&self, storage: &dyn Storage, path: &str) -> Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(storage, path, &json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[test]
    fn test_store_and_load() {
        let storage = MemoryStorage::new_default();
        let info = SegmentInfo::merged_from(7, 2, vec![0, 1]);
        info.store(&storage, 3).unwrap();

        assert!(storage.file_exists("segment_3/segment_info"));
        assert_eq!(SegmentInfo::load(&storage, 3).unwrap(), info);
    }

    #[test]
    fn test_missing_and_garbage() {
        let storage = MemoryStorage::new_default();
        assert!(SegmentInfo::load(&storage, 0).unwrap_err().is_not_found());

        storage.put_bytes("segment_0/segment_info", b"{not json");
        assert!(matches!(
            SegmentInfo::load(&storage, 0),
            Err(TesseraError::Corrupt(_))
        ));
    }

    #[test]
    fn test_json_shape() {
        let info = SegmentInfo::new(4, 0);
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["doc_count"], 4);
        assert_eq!(json["format_version"], "2.1.0");
        assert!(json.get("sources").is_none());
    }
}
