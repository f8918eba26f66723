//! Attribute columns: per-segment field values and patched readers.

pub mod column;
pub mod merger;
pub mod reader;

pub use column::{AttributeColumn, AttributeColumnWriter, ValueBuffer};
pub use merger::AttributeMergeWorkItem;
pub use reader::{AttributeReader, SegmentAttributeReader, column_path};
