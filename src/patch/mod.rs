//! Out-of-place attribute updates.
//!
//! A segment that updates documents of older segments writes patch files
//! into its own directory. Readers discover them by name
//! ([`PatchFileFinder`]), optionally drop some ([`PatchFileFilter`]) and
//! replay them in rank order ([`AttributePatchReader`]).

pub mod file;
pub mod filter;
pub mod finder;
pub mod iterator;
pub mod patcher;
pub mod reader;

pub use file::{PatchFileData, PatchFileName, PatchFileWriter};
pub use filter::PatchFileFilter;
pub use finder::{PatchCatalog, PatchFileFinder, PatchFileInfo, PatchInfos};
pub use iterator::{AttributePatch, MultiFieldPatchIterator, SubDocPatch, SubDocPatchIterator};
pub use patcher::{PartitionPatcher, SingleAttributePatcher};
pub use reader::{AttributePatchReader, PatchRecord, ReaderState};
