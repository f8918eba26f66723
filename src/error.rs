//! Error types for the Tessera storage engine.
//!
//! All fallible operations return [`Result`], whose error side is the
//! [`TesseraError`] enum. The variants mirror the failure classes of the
//! engine: a version that points at missing data, a file that is required but
//! absent, a field unknown to the schema, an on-disk format newer than this
//! binary, and internal scheduler failures.
//!
//! # Examples
//!
//! ```
//! use tessera::error::{Result, TesseraError};
//!
//! fn open_segment(id: i32) -> Result<()> {
//!     Err(TesseraError::corrupt_version(format!("segment {id} is missing")))
//! }
//!
//! match open_segment(3) {
//!     Ok(_) => println!("Success"),
//!     Err(e) => eprintln!("Error: {}", e),
//! }
//! ```

use std::io;

use anyhow;
use thiserror::Error;

/// The main error type for Tessera operations.
#[derive(Error, Debug)]
pub enum TesseraError {
    /// I/O errors (file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A version references a segment that is missing or unreadable.
    /// Fatal for the open that hit it.
    #[error("Corrupt version: {0}")]
    CorruptVersion(String),

    /// A required file or object does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A field name is unknown to every relevant schema snapshot.
    #[error("Unknown field: {0}")]
    UnknownField(String),

    /// A value or field does not fit the schema it is applied against.
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The on-disk format is newer than this binary understands.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Scheduler and thread-pool failures, including dropped work items.
    #[error("Internal error: {0}")]
    Internal(String),

    /// Storage backend errors.
    #[error("Storage error: {0}")]
    Storage(String),

    /// A data file (patch, deletion map, column) failed validation.
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Invalid argument passed by the caller.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not allowed in the current state.
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// JSON serialization/deserialization errors.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error for other cases.
    #[error("Error: {0}")]
    Other(String),

    /// Generic anyhow error.
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

/// Result type alias for operations that may fail with TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

impl TesseraError {
    /// Create a new corrupt version error.
    pub fn corrupt_version<S: Into<String>>(msg: S) -> Self {
        TesseraError::CorruptVersion(msg.into())
    }

    /// Create a new not found error.
    pub fn not_found<S: Into<String>>(msg: S) -> Self {
        TesseraError::NotFound(msg.into())
    }

    /// Create a new unknown field error.
    pub fn unknown_field<S: Into<String>>(msg: S) -> Self {
        TesseraError::UnknownField(msg.into())
    }

    /// Create a new schema mismatch error.
    pub fn schema_mismatch<S: Into<String>>(msg: S) -> Self {
        TesseraError::SchemaMismatch(msg.into())
    }

    /// Create a new unsupported format error.
    pub fn unsupported<S: Into<String>>(msg: S) -> Self {
        TesseraError::Unsupported(msg.into())
    }

    /// Create a new internal error.
    pub fn internal<S: Into<String>>(msg: S) -> Self {
        TesseraError::Internal(msg.into())
    }

    /// Create a new storage error.
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        TesseraError::Storage(msg.into())
    }

    /// Create a new corrupt data error.
    pub fn corrupt<S: Into<String>>(msg: S) -> Self {
        TesseraError::Corrupt(msg.into())
    }

    /// Create a new invalid argument error.
    pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(msg.into())
    }

    /// Create a new invalid operation error.
    pub fn invalid_operation<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidOperation(msg.into())
    }

    /// Create a new invalid config error.
    pub fn invalid_config<S: Into<String>>(msg: S) -> Self {
        TesseraError::InvalidArgument(format!("Invalid configuration: {}", msg.into()))
    }

    /// Create a new generic error.
    pub fn other<S: Into<String>>(msg: S) -> Self {
        TesseraError::Other(msg.into())
    }

    /// Whether this error reports a missing file or object.
    pub fn is_not_found(&self) -> bool {
        match self {
            TesseraError::NotFound(_) => true,
            TesseraError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
