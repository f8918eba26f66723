//! Committed versions: which segments make up a partition snapshot.
//!
//! A version file `version.<id>` is a checksummed structured record:
//!
//! ```text
//! "TSVF" | layout u16 | version_id i32 | timestamp_us i64 | format string
//!        | schema_id varint | ongoing ops (count, varints)
//!        | segment ids (count, zigzag varints) | crc32
//! ```
//!
//! It is written to `version.<id>.tmp` and renamed into place, so a reader
//! either sees the whole record or nothing.

use std::collections::BTreeSet;

use chrono::Utc;
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::error::{Result, TesseraError};
use crate::format::IndexFormatVersion;
use crate::schema::SchemaId;
use crate::segment::id::{INVALID_VERSION_ID, OperationId, SegmentId, VersionId};
use crate::storage::{Storage, StorageInput, StructReader, write_struct_atomic};

const VERSION_MAGIC: &[u8; 4] = b"TSVF";
const VERSION_LAYOUT: u16 = 1;

lazy_static! {
    static ref VERSION_FILE_RE: Regex = Regex::new(r"^version\.(0|[1-9][0-9]*)$").unwrap();
}

/// File name of the version with id `version_id`.
pub fn version_file_name(version_id: VersionId) -> String {
    format!("version.{version_id}")
}

/// Parse a committed version file name. Temp files and anything else
/// return `None`.
pub fn parse_version_file_name(name: &str) -> Option<VersionId> {
    VERSION_FILE_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// An immutable snapshot of the live segment set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Version {
    version_id: VersionId,
    timestamp: i64,
    format_version: IndexFormatVersion,
    schema_id: SchemaId,
    ongoing_operations: Vec<OperationId>,
    segment_ids: BTreeSet<SegmentId>,
}

impl Default for Version {
    fn default() -> Self {
        Version::new(INVALID_VERSION_ID)
    }
}

impl Version {
    pub fn new(version_id: VersionId) -> Self {
        Version {
            version_id,
            timestamp: Utc::now().timestamp_micros(),
            format_version: IndexFormatVersion::binary(),
            schema_id: 0,
            ongoing_operations: Vec::new(),
            segment_ids: BTreeSet::new(),
        }
    }

    pub fn version_id(&self) -> VersionId {
        self.version_id
    }

    /// Whether this version was ever committed.
    pub fn is_valid(&self) -> bool {
        self.version_id != INVALID_VERSION_ID
    }

    /// Commit time in microseconds since the epoch.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn format_version(&self) -> &IndexFormatVersion {
        &self.format_version
    }

    pub fn schema_id(&self) -> SchemaId {
        self.schema_id
    }

    pub fn set_schema_id(&mut self, schema_id: SchemaId) {
        self.schema_id = schema_id;
    }

    pub fn ongoing_operations(&self) -> &[OperationId] {
        &self.ongoing_operations
    }

    pub fn add_ongoing_operation(&mut self, op_id: OperationId) {
        if !self.ongoing_operations.contains(&op_id) {
            self.ongoing_operations.push(op_id);
            self.ongoing_operations.sort_unstable();
        }
    }

    pub fn remove_ongoing_operation(&mut self, op_id: OperationId) {
        self.ongoing_operations.retain(|&op| op != op_id);
    }

    /// Segment ids in ascending order.
    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segment_ids.iter().copied().collect()
    }

    pub fn iter_segment_ids(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.segment_ids.iter().copied()
    }

    pub fn segment_count(&self) -> usize {
        self.segment_ids.len()
    }

    pub fn contains(&self, segment_id: SegmentId) -> bool {
        self.segment_ids.contains(&segment_id)
    }

    pub fn last_segment_id(&self) -> Option<SegmentId> {
        self.segment_ids.iter().next_back().copied()
    }

    pub fn add_segment(&mut self, segment_id: SegmentId) {
        self.segment_ids.insert(segment_id);
    }

    pub fn remove_segment(&mut self, segment_id: SegmentId) -> bool {
        self.segment_ids.remove(&segment_id)
    }

    /// The successor of this version, before any segment changes.
    pub fn next(&self) -> Version {
        let mut next = self.clone();
        next.version_id = self.version_id + 1;
        next.timestamp = Utc::now().timestamp_micros();
        next.format_version = IndexFormatVersion::binary();
        next
    }

    /// Atomically write `version.<id>`.
    pub fn store(&self, storage: &dyn Storage) -> Result<()> {
        if !self.is_valid() {
            return Err(TesseraError::invalid_operation("cannot store an invalid version"));
        }
        write_struct_atomic(storage, &version_file_name(self.version_id), |w| {
            w.write_header(VERSION_MAGIC, VERSION_LAYOUT)?;
            w.write_i32(self.version_id)?;
            w.write_i64(self.timestamp)?;
            w.write_string(&self.format_version.to_string())?;
            w.write_varint(self.schema_id as u64)?;
            w.write_varint(self.ongoing_operations.len() as u64)?;
            for &op in &self.ongoing_operations {
                w.write_varint(op as u64)?;
            }
            w.write_varint(self.segment_ids.len() as u64)?;
            for &segment_id in &self.segment_ids {
                w.write_signed_varint(segment_id as i64)?;
            }
            Ok(())
        })
    }

    /// Read and validate `version.<id>`.
    ///
    /// A missing file is `NotFound`; anything unreadable (bad magic,
    /// truncation, checksum mismatch, id disagreeing with the file name) is
    /// `CorruptVersion`.
    pub fn load(storage: &dyn Storage, version_id: VersionId) -> Result<Version> {
        let name = version_file_name(version_id);
        let input = storage.open_input(&name)?;
        StructReader::new(input)
            .and_then(|reader| Self::decode(reader, version_id))
            .map_err(|e| match e {
                TesseraError::NotFound(_) | TesseraError::Unsupported(_) => e,
                other => TesseraError::corrupt_version(format!("{name}: {other}")),
            })
    }

    fn decode(
        mut reader: StructReader<Box<dyn StorageInput>>,
        expected_id: VersionId,
    ) -> Result<Version> {
        let layout = reader.read_header(VERSION_MAGIC)?;
        if layout != VERSION_LAYOUT {
            return Err(TesseraError::unsupported(format!(
                "version layout {layout} is not supported"
            )));
        }

        let version_id = reader.read_i32()?;
        if version_id != expected_id {
            return Err(TesseraError::corrupt(format!(
                "file holds version {version_id}"
            )));
        }
        let timestamp = reader.read_i64()?;
        let format_version: IndexFormatVersion = reader.read_string()?.parse()?;
        let schema_id = reader.read_varint()? as SchemaId;

        let op_count = reader.read_varint()? as usize;
        let mut ongoing_operations = Vec::with_capacity(op_count.min(1024));
        for _ in 0..op_count {
            ongoing_operations.push(reader.read_varint()? as OperationId);
        }

        let segment_count = reader.read_varint()? as usize;
        let mut segment_ids = BTreeSet::new();
        for _ in 0..segment_count {
            let segment_id = i32::try_from(reader.read_signed_varint()?)
                .map_err(|_| TesseraError::corrupt("segment id out of range"))?;
            segment_ids.insert(segment_id);
        }
        reader.finish()?;

        Ok(Version {
            version_id,
            timestamp,
            format_version,
            schema_id,
            ongoing_operations,
            segment_ids,
        })
    }

    /// Committed version ids present in `storage`, ascending.
    pub fn list_version_ids(storage: &dyn Storage) -> Result<Vec<VersionId>> {
        let mut ids: Vec<VersionId> = storage
            .list_files()?
            .iter()
            .filter_map(|name| parse_version_file_name(name))
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }

    /// Load the newest readable version, skipping unreadable ones.
    ///
    /// Returns an invalid (empty) version when none exists.
    pub fn load_latest(storage: &dyn Storage) -> Result<Version> {
        for version_id in Self::list_version_ids(storage)?.into_iter().rev() {
            match Self::load(storage, version_id) {
                Ok(version) => {
                    log::debug!("loaded version {version_id}");
                    return Ok(version);
                }
                Err(TesseraError::Unsupported(msg)) => {
                    return Err(TesseraError::Unsupported(msg));
                }
                Err(e) => log::warn!("skipping unreadable version {version_id}: {e}"),
            }
        }
        Ok(Version::default())
    }
}
