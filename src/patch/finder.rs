//! Discovers patch and deletion files of a version from file names alone.

use std::collections::BTreeMap;

use serde::Serialize;

use crate::error::Result;
use crate::patch::file::PatchFileName;
use crate::segment::directory::SegmentDirectory;
use crate::segment::id::{
    DEFAULT_OPERATION_ID, SegmentId, is_valid_sealed_segment_id, parse_segment_dir_name,
};

/// Directory of deletion files inside a segment.
pub const DELETION_MAP_DIR: &str = "deletionmap";

/// `deletionmap/data_<target>` relative to the writing segment.
pub fn deletion_file_name(target_segment_id: SegmentId) -> String {
    format!("{DELETION_MAP_DIR}/data_{target_segment_id}")
}

/// One patch or deletion file with its provenance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchFileInfo {
    pub name: PatchFileName,
    /// Path relative to the partition root.
    pub path: String,
}

impl PatchFileInfo {
    pub fn src_segment_id(&self) -> SegmentId {
        self.name.src_segment_id
    }

    pub fn target_segment_id(&self) -> SegmentId {
        self.name.target_segment_id
    }

    /// Generation rank: the highest rank wins a conflict.
    pub fn rank(&self) -> (u32, SegmentId) {
        (self.name.operation_id, self.name.src_segment_id)
    }
}

/// Files grouped by target segment, each group sorted by ascending rank.
pub type PatchInfos = BTreeMap<SegmentId, Vec<PatchFileInfo>>;

/// Every patch and deletion file that applies to a version.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchCatalog {
    /// Field name to attribute patches.
    pub attribute: BTreeMap<String, PatchInfos>,
    pub deletion: PatchInfos,
}

impl PatchCatalog {
    pub fn attribute_patches(&self, field: &str) -> Option<&PatchInfos> {
        self.attribute.get(field)
    }

    /// Patch files written by `src_segment_id`, for any field.
    pub fn written_by(&self, src_segment_id: SegmentId) -> impl Iterator<Item = &PatchFileInfo> {
        self.attribute
            .values()
            .flat_map(|infos| infos.values().flatten())
            .chain(self.deletion.values().flatten())
            .filter(move |info| info.src_segment_id() == src_segment_id)
    }

    pub fn is_empty(&self) -> bool {
        self.attribute.values().all(|infos| infos.is_empty()) && self.deletion.is_empty()
    }

    fn sort(&mut self) {
        for infos in self.attribute.values_mut() {
            for group in infos.values_mut() {
                group.sort_by_key(PatchFileInfo::rank);
            }
        }
        for group in self.deletion.values_mut() {
            group.sort_by_key(PatchFileInfo::rank);
        }
    }
}

pub struct PatchFileFinder;

impl PatchFileFinder {
    /// Scan the live segments of `directory`.
    ///
    /// A file is skipped with a warning when its name disagrees with the
    /// segment holding it, when its target is not part of the version, or
    /// when it patches a segment that is not older than its source.
    /// Deletion files may target their own segment.
    pub fn find(directory: &SegmentDirectory) -> Result<PatchCatalog> {
        let version = directory.version();
        let mut catalog = PatchCatalog::default();

        for path in directory.storage().list_files()? {
            let parts: Vec<&str> = path.split('/').collect();
            let Some(holder) = parts.first().and_then(|dir| parse_segment_dir_name(dir)) else {
                continue;
            };
            if !version.contains(holder) {
                continue;
            }

            match parts.as_slice() {
                [_, "attribute", field, file] => {
                    let Some(name) = PatchFileName::parse(file) else {
                        continue;
                    };
                    if name.src_segment_id != holder {
                        log::warn!("ignoring {path}: source does not match its segment");
                        continue;
                    }
                    if !version.contains(name.target_segment_id) {
                        log::debug!("ignoring {path}: target segment is not live");
                        continue;
                    }
                    if name.src_segment_id <= name.target_segment_id {
                        log::warn!("ignoring {path}: patch to a segment that is not older");
                        continue;
                    }
                    catalog
                        .attribute
                        .entry(field.to_string())
                        .or_default()
                        .entry(name.target_segment_id)
                        .or_default()
                        .push(PatchFileInfo { name, path });
                }
                [_, DELETION_MAP_DIR, file] => {
                    let Some(target) = file
                        .strip_prefix("data_")
                        .and_then(|id| id.parse::<SegmentId>().ok())
                        .filter(|&id| is_valid_sealed_segment_id(id))
                    else {
                        continue;
                    };
                    if !version.contains(target) {
                        log::debug!("ignoring {path}: target segment is not live");
                        continue;
                    }
                    if holder < target {
                        log::warn!("ignoring {path}: deletes in a newer segment");
                        continue;
                    }
                    catalog.deletion.entry(target).or_default().push(PatchFileInfo {
                        name: PatchFileName::new(holder, target, DEFAULT_OPERATION_ID),
                        path,
                    });
                }
                _ => {}
            }
        }

        catalog.sort();
        Ok(catalog)
    }
}
