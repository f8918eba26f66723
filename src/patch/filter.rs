//! Selection of the patch and deletion files an online reader applies.

use crate::config::OnlineConfig;
use crate::patch::finder::{PatchCatalog, PatchFileInfo, PatchInfos};
use crate::segment::id::SegmentId;

/// Decides which patch files an online partition applies.
///
/// With realtime consistency on, updates written by segments older than
/// `start_load_segment` already reached readers through the realtime index
/// and are dropped here. Otherwise every file passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatchFileFilter {
    inc_consistent_with_realtime: bool,
    start_load_segment: SegmentId,
}

impl PatchFileFilter {
    pub fn new(inc_consistent_with_realtime: bool, start_load_segment: SegmentId) -> Self {
        PatchFileFilter {
            inc_consistent_with_realtime,
            start_load_segment,
        }
    }

    /// A filter that keeps everything.
    pub fn pass_through() -> Self {
        PatchFileFilter::new(false, 0)
    }

    pub fn from_config(config: &OnlineConfig) -> Self {
        PatchFileFilter::new(config.inc_consistent_with_realtime, config.start_load_segment)
    }

    pub fn accepts(&self, info: &PatchFileInfo) -> bool {
        !self.inc_consistent_with_realtime || info.src_segment_id() >= self.start_load_segment
    }

    pub fn filter(&self, infos: &PatchInfos) -> PatchInfos {
        infos
            .iter()
            .filter_map(|(&target, group)| {
                let kept: Vec<PatchFileInfo> =
                    group.iter().filter(|info| self.accepts(info)).cloned().collect();
                (!kept.is_empty()).then_some((target, kept))
            })
            .collect()
    }

    /// Filter every group of a catalog.
    pub fn filter_catalog(&self, catalog: &PatchCatalog) -> PatchCatalog {
        if !self.inc_consistent_with_realtime {
            return catalog.clone();
        }
        let filtered = PatchCatalog {
            attribute: catalog
                .attribute
                .iter()
                .map(|(field, infos)| (field.clone(), self.filter(infos)))
                .collect(),
            deletion: self.filter(&catalog.deletion),
        };
        log::debug!(
            "realtime consistency dropped patches from segments before {}",
            self.start_load_segment
        );
        filtered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::patch::file::PatchFileName;

    fn infos() -> PatchInfos {
        let info = |src, target| PatchFileInfo {
            name: PatchFileName::new(src, target, 0),
            path: PatchFileName::new(src, target, 0).path("f"),
        };
        PatchInfos::from([(0, vec![info(1, 0), info(3, 0), info(5, 0)]), (2, vec![info(3, 2)])])
    }

    #[test]
    fn test_pass_through_when_not_realtime_consistent() {
        let filter = PatchFileFilter::new(false, 4);
        assert_eq!(filter.filter(&infos()), infos());
        assert_eq!(PatchFileFilter::pass_through().filter(&infos()), infos());
    }

    #[test]
    fn test_drops_sources_before_start_load_segment() {
        let filter = PatchFileFilter::from_config(&OnlineConfig {
            inc_consistent_with_realtime: true,
            start_load_segment: 3,
            ..OnlineConfig::default()
        });
        let filtered = filter.filter(&infos());

        let sources: Vec<SegmentId> = filtered[&0].iter().map(|i| i.src_segment_id()).collect();
        assert_eq!(sources, vec![3, 5]);
        assert_eq!(filtered[&2].len(), 1);

        let strict = PatchFileFilter::new(true, 6).filter(&infos());
        assert!(strict.is_empty());
    }
}
