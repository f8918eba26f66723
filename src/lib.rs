//! # Tessera
//!
//! A segment-oriented storage engine for search index partitions.
//!
//! ## Features
//!
//! - Immutable segments published through atomically committed versions
//! - Out-of-place field updates through ranked patch files
//! - Per-segment deletion bitmaps
//! - Merges bounded by a memory ceiling, with pluggable policies
//! - Snapshot readers pinned against cleanup
//! - Pluggable storage backends

pub mod attribute;
pub mod cli;
pub mod config;
pub mod deletion;
pub mod error;
pub mod format;
pub mod merge;
pub mod partition;
pub mod patch;
pub mod schema;
pub mod segment;
pub mod storage;
pub mod util;

pub mod prelude {
    pub use crate::config::{MergeConfig, OnlineConfig, PartitionOptions, SchedulerKind};
    pub use crate::error::{Result, TesseraError};
    pub use crate::merge::{MergePolicyRegistry, MergeResult};
    pub use crate::partition::{IndexPartition, PartitionReader, PartitionWriter};
    pub use crate::schema::{AttributeValue, Document, FieldType, Schema};
    pub use crate::segment::{DocId, SegmentId, Version, VersionId};
    pub use crate::storage::{FileStorage, MemoryStorage, Storage, StorageConfig};
}

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
