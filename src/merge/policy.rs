//! Merge policies and the registry that resolves them by name.

use std::collections::BTreeMap;
use std::fmt::Debug;

use serde_json::Value;

use crate::error::{Result, TesseraError};
use crate::merge::plan::{MergePlan, SegmentMergeInfo};

/// Chooses which segments to merge.
pub trait MergePolicy: Debug + Send + Sync {
    fn name(&self) -> &str;

    /// Build a plan from the live segments, or `None` if nothing should be
    /// merged. Segments arrive in ascending id order.
    fn create_plan(&self, segments: &[SegmentMergeInfo]) -> Option<MergePlan>;
}

pub type PolicyParams = BTreeMap<String, Value>;

type PolicyFactory = fn(&PolicyParams) -> Result<Box<dyn MergePolicy>>;

fn param_f64(params: &PolicyParams, key: &str, default: f64) -> Result<f64> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value.as_f64().ok_or_else(|| {
            TesseraError::invalid_config(format!("policy parameter {key} must be a number"))
        }),
    }
}

fn param_usize(params: &PolicyParams, key: &str, default: usize) -> Result<usize> {
    match params.get(key) {
        None => Ok(default),
        Some(value) => value.as_u64().map(|v| v as usize).ok_or_else(|| {
            TesseraError::invalid_config(format!(
                "policy parameter {key} must be a non-negative integer"
            ))
        }),
    }
}

/// Merges every segment into one, as long as there is more than one segment
/// or the only segment carries deletes.
#[derive(Debug, Clone)]
pub struct OptimizeMergePolicy {
    pub min_segments: usize,
}

impl Default for OptimizeMergePolicy {
    fn default() -> Self {
        OptimizeMergePolicy { min_segments: 2 }
    }
}

impl OptimizeMergePolicy {
    pub fn from_params(params: &PolicyParams) -> Result<Box<dyn MergePolicy>> {
        let min_segments = param_usize(params, "min_segments", 2)?.max(1);
        Ok(Box::new(OptimizeMergePolicy { min_segments }))
    }
}

impl MergePolicy for OptimizeMergePolicy {
    fn name(&self) -> &str {
        "optimize"
    }

    fn create_plan(&self, segments: &[SegmentMergeInfo]) -> Option<MergePlan> {
        let has_deletes = segments.iter().any(|s| s.deleted_count > 0);
        if segments.is_empty() || (segments.len() < self.min_segments && !has_deletes) {
            return None;
        }
        let mut plan = MergePlan::new();
        for segment in segments {
            plan.add_source(segment.clone());
        }
        Some(plan)
    }
}

/// Merges the segments whose share of deleted documents reached a
/// threshold.
#[derive(Debug, Clone)]
pub struct DeletionRatioMergePolicy {
    pub ratio: f64,
    pub max_segments: usize,
}

impl Default for DeletionRatioMergePolicy {
    fn default() -> Self {
        DeletionRatioMergePolicy {
            ratio: 0.3,
            max_segments: 10,
        }
    }
}

impl DeletionRatioMergePolicy {
    pub fn from_params(params: &PolicyParams) -> Result<Box<dyn MergePolicy>> {
        let ratio = param_f64(params, "ratio", 0.3)?;
        if !(0.0..=1.0).contains(&ratio) {
            return Err(TesseraError::invalid_config(format!(
                "deletion ratio must be within [0, 1], got {ratio}"
            )));
        }
        let max_segments = param_usize(params, "max_segments", 10)?.max(1);
        Ok(Box::new(DeletionRatioMergePolicy {
            ratio,
            max_segments,
        }))
    }
}

impl MergePolicy for DeletionRatioMergePolicy {
    fn name(&self) -> &str {
        "deletion_ratio"
    }

    fn create_plan(&self, segments: &[SegmentMergeInfo]) -> Option<MergePlan> {
        let mut candidates: Vec<&SegmentMergeInfo> = segments
            .iter()
            .filter(|s| s.doc_count > 0 && s.deleted_count > 0)
            .filter(|s| s.deleted_count as f64 / s.doc_count as f64 >= self.ratio)
            .collect();
        if candidates.is_empty() {
            return None;
        }
        // Worst first.
        candidates.sort_by(|a, b| {
            let ra = a.deleted_count as f64 / a.doc_count as f64;
            let rb = b.deleted_count as f64 / b.doc_count as f64;
            rb.total_cmp(&ra).then(a.segment_id.cmp(&b.segment_id))
        });
        let mut plan = MergePlan::new();
        for segment in candidates.into_iter().take(self.max_segments) {
            plan.add_source(segment.clone());
        }
        Some(plan)
    }
}

/// Name to policy factory map. Built by the caller and passed where merges
/// are started.
#[derive(Debug, Clone, Default)]
pub struct MergePolicyRegistry {
    factories: BTreeMap<String, PolicyFactory>,
}

impl MergePolicyRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        MergePolicyRegistry::default()
    }

    /// A registry with `optimize` and `deletion_ratio`.
    pub fn with_defaults() -> Self {
        let mut registry = MergePolicyRegistry::new();
        registry.register("optimize", OptimizeMergePolicy::from_params);
        registry.register("deletion_ratio", DeletionRatioMergePolicy::from_params);
        registry
    }

    /// Register `factory` under `name`, replacing any previous entry.
    pub fn register(&mut self, name: &str, factory: PolicyFactory) {
        self.factories.insert(name.to_string(), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    pub fn create(&self, name: &str, params: &PolicyParams) -> Result<Box<dyn MergePolicy>> {
        let factory = self.factories.get(name).ok_or_else(|| {
            TesseraError::invalid_config(format!(
                "unknown merge policy '{name}', registered: {}",
                self.names().join(", ")
            ))
        })?;
        factory(params)
    }
}
