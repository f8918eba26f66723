//! Shared utilities.

pub mod varint;
