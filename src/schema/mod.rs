//! Schema module for Tessera.
//!
//! The schema is the collaborator that maps field names to ids and types.
//! Values are a closed enum with fixed byte encodings so column and patch
//! files can be decoded without consulting the schema they were written
//! under.

pub mod field;
#[allow(clippy::module_inception)]
pub mod schema;
pub mod value;

pub use field::*;
pub use schema::*;
pub use value::*;
