//! Configuration for partitions: online loading, builds and merges.
//!
//! All structs deserialize from JSON with every field optional, so a config
//! file only needs to name what it overrides.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::segment::id::{OperationId, SegmentId};

/// Top-level options of an index partition.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PartitionOptions {
    pub online: OnlineConfig,
    pub build: BuildConfig,
    pub merge: MergeConfig,
}

impl PartitionOptions {
    /// Parse options from a JSON string.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let options: PartitionOptions = serde_json::from_str(text)?;
        options.validate()?;
        Ok(options)
    }

    /// Read options from a JSON file on the local filesystem.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            TesseraError::invalid_config(format!("{}: {e}", path.as_ref().display()))
        })?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.online.keep_version_count == 0 {
            return Err(TesseraError::invalid_config(
                "online.keep_version_count must be at least 1",
            ));
        }
        if self.merge.thread_count == 0 {
            return Err(TesseraError::invalid_config(
                "merge.thread_count must be at least 1",
            ));
        }
        if self.merge.truncate_queue_capacity == 0 {
            return Err(TesseraError::invalid_config(
                "merge.truncate_queue_capacity must be at least 1",
            ));
        }
        if self.merge.max_docs_per_output_segment == Some(0) {
            return Err(TesseraError::invalid_config(
                "merge.max_docs_per_output_segment must be positive",
            ));
        }
        Ok(())
    }

    /// Enable inc-consistent-with-realtime loading from `start_load_segment`.
    pub fn with_realtime_consistency(mut self, start_load_segment: SegmentId) -> Self {
        self.online.inc_consistent_with_realtime = true;
        self.online.start_load_segment = start_load_segment;
        self
    }

    pub fn with_keep_version_count(mut self, count: usize) -> Self {
        self.online.keep_version_count = count;
        self
    }

    pub fn with_merge_threads(mut self, threads: usize) -> Self {
        self.merge.thread_count = threads;
        self
    }

    pub fn with_scheduler(mut self, scheduler: SchedulerKind) -> Self {
        self.merge.scheduler = scheduler;
        self
    }
}

/// How an online (serving) partition loads data.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OnlineConfig {
    /// Keep patches consistent with the realtime index: patches written by
    /// segments older than `start_load_segment` are not applied.
    pub inc_consistent_with_realtime: bool,

    /// First segment id loaded by the realtime index.
    pub start_load_segment: SegmentId,

    /// Number of newest versions kept on disk by cleanup.
    pub keep_version_count: usize,

    /// Treat a missing `index_format_version` file as the legacy format.
    pub tolerate_missing_format_version: bool,
}

impl Default for OnlineConfig {
    fn default() -> Self {
        OnlineConfig {
            inc_consistent_with_realtime: false,
            start_load_segment: 0,
            keep_version_count: 2,
            tolerate_missing_format_version: true,
        }
    }
}

/// Options for the partition writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Operation id stamped on patch files written by this writer.
    pub schema_operation_id: OperationId,

    /// Sync the storage before publishing a version.
    pub sync_on_commit: bool,
}

impl Default for BuildConfig {
    fn default() -> Self {
        BuildConfig {
            schema_operation_id: 0,
            sync_on_commit: true,
        }
    }
}

/// Which scheduler executes merge work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerKind {
    /// Sequential on the calling thread.
    Simple,
    /// Thread pool bounded by `max_memory_mb`.
    ResourceControl,
}

/// Options for merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MergeConfig {
    /// Worker threads of the resource-controlled pool.
    pub thread_count: usize,

    /// Memory ceiling for concurrently running work items, in MB.
    pub max_memory_mb: u64,

    pub scheduler: SchedulerKind,

    /// Name of the merge policy, resolved through a `MergePolicyRegistry`.
    pub policy: String,

    /// Free-form parameters handed to the policy.
    pub policy_params: BTreeMap<String, serde_json::Value>,

    /// Split merge output into segments of at most this many documents.
    pub max_docs_per_output_segment: Option<u32>,

    /// Threads of the truncate writer scheduler.
    pub truncate_thread_count: usize,

    /// Bounded queue capacity of the truncate writer scheduler.
    pub truncate_queue_capacity: usize,
}

impl Default for MergeConfig {
    fn default() -> Self {
        MergeConfig {
            thread_count: num_cpus::get(),
            max_memory_mb: 1024,
            scheduler: SchedulerKind::ResourceControl,
            policy: "optimize".to_string(),
            policy_params: BTreeMap::new(),
            max_docs_per_output_segment: None,
            truncate_thread_count: 2,
            truncate_queue_capacity: 16,
        }
    }
}

impl MergeConfig {
    /// Memory ceiling in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb.saturating_mul(1024 * 1024)
    }
}
