//! Segment, version and document id conventions.

/// Identifier of a segment.
pub type SegmentId = i32;

/// Identifier of a committed version; [`INVALID_VERSION_ID`] for none.
pub type VersionId = i32;

/// Document id, local to a segment or global to a directory depending on
/// context.
pub type DocId = u32;

/// Identifier of a schema operation (an alter). Builds outside any alter
/// use [`DEFAULT_OPERATION_ID`].
pub type OperationId = u32;

pub const DEFAULT_OPERATION_ID: OperationId = 0;

/// The in-memory segment currently being built.
pub const BUILDING_SEGMENT_ID: SegmentId = -1;

/// Largest id a sealed segment may take.
pub const MAX_SEGMENT_ID: SegmentId = 0x7FFF_FFFE;

/// Version id of an empty partition.
pub const INVALID_VERSION_ID: VersionId = -1;

/// Marker bit for realtime segments.
pub const REALTIME_SEGMENT_MASK: SegmentId = i32::MIN;

/// Tag a sealed segment id as realtime.
pub fn to_realtime_segment_id(segment_id: SegmentId) -> SegmentId {
    segment_id | REALTIME_SEGMENT_MASK
}

/// Whether `segment_id` carries the realtime tag.
pub fn is_realtime_segment_id(segment_id: SegmentId) -> bool {
    segment_id != BUILDING_SEGMENT_ID && segment_id & REALTIME_SEGMENT_MASK != 0
}

/// Strip the realtime tag.
pub fn to_sealed_segment_id(segment_id: SegmentId) -> SegmentId {
    segment_id & !REALTIME_SEGMENT_MASK
}

/// Whether `segment_id` is usable for a sealed on-disk segment.
pub fn is_valid_sealed_segment_id(segment_id: SegmentId) -> bool {
    (0..=MAX_SEGMENT_ID).contains(&segment_id)
}

/// Directory holding a segment's files.
pub fn segment_dir_name(segment_id: SegmentId) -> String {
    format!("segment_{segment_id}")
}

/// Parse `segment_<id>` back to its id.
pub fn parse_segment_dir_name(name: &str) -> Option<SegmentId> {
    let id = name.strip_prefix("segment_")?;
    if id.is_empty() || id.starts_with('+') {
        return None;
    }
    id.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_tag() {
        let rt = to_realtime_segment_id(5);
        assert!(rt < 0);
        assert!(is_realtime_segment_id(rt));
        assert!(!is_realtime_segment_id(5));
        assert!(!is_realtime_segment_id(BUILDING_SEGMENT_ID));
        assert_eq!(to_sealed_segment_id(rt), 5);
    }

    #[test]
    fn test_sealed_range() {
        assert!(is_valid_sealed_segment_id(0));
        assert!(is_valid_sealed_segment_id(MAX_SEGMENT_ID));
        assert!(!is_valid_sealed_segment_id(MAX_SEGMENT_ID + 1));
        assert!(!is_valid_sealed_segment_id(BUILDING_SEGMENT_ID));
    }

    #[test]
    fn test_dir_names() {
        assert_eq!(segment_dir_name(12), "segment_12");
        assert_eq!(parse_segment_dir_name("segment_12"), Some(12));
        assert_eq!(parse_segment_dir_name("segment_"), None);
        assert_eq!(parse_segment_dir_name("segment_x"), None);
        assert_eq!(parse_segment_dir_name("version.1"), None);
    }
}
