//! Logical deletes: per-segment bitmaps, their writer, reader and merger.

pub mod bitmap;
pub mod merger;
pub mod reader;
pub mod writer;

pub use bitmap::DeletionBitmap;
pub use merger::DeletionMapMerger;
pub use reader::DeletionMapReader;
pub use writer::DeletionMapWriter;
