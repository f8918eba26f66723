//! Segment merging.
//!
//! A [`MergePolicy`] picks source segments, a [`ReclaimMap`] assigns the
//! surviving documents to outputs, and [`MergeWorkItem`]s produce the output
//! files through a [`MergeFileSystem`] under one of the schedulers.
//! [`PartitionMerger`] drives the whole sequence and publishes the result
//! as a new version.

pub mod file_system;
pub mod merger;
pub mod plan;
pub mod policy;
pub mod reclaim;
pub mod resource;
pub mod thread_pool;
pub mod truncate;
pub mod work_item;

pub use file_system::MergeFileSystem;
pub use merger::{MergeResult, PartitionMerger};
pub use plan::{MergePlan, OutputSegmentMergeInfo, SegmentMergeInfo};
pub use policy::{
    DeletionRatioMergePolicy, MergePolicy, MergePolicyRegistry, OptimizeMergePolicy, PolicyParams,
};
pub use reclaim::ReclaimMap;
pub use resource::{MergeTaskResourceManager, ResourceId};
pub use thread_pool::{
    MergeScheduler, ResourceControlThreadPool, SchedulerStats, SimpleMergeScheduler,
    create_scheduler,
};
pub use truncate::MultiTruncateWriterScheduler;
pub use work_item::{FnWorkItem, MergeWorkItem};
