//! Segments, versions and the directory that resolves one against the
//! other.

pub mod directory;
pub mod id;
pub mod info;
pub mod multi_part;
pub mod tracker;
pub mod version;

pub use directory::{CleanupReport, SegmentData, SegmentDirectory};
pub use id::*;
pub use info::SegmentInfo;
pub use multi_part::{MultiPartSegmentDirectory, VirtualSegment};
pub use tracker::{VersionPin, VersionTracker};
pub use version::Version;
