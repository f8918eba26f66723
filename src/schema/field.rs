//! Attribute field types.

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};

/// Identifier of a field inside a schema.
pub type FieldId = u32;

/// Storage type of an attribute field.
///
/// The set is closed: every type has a fixed tag used in column and patch
/// file headers, and either a fixed width or a length-prefixed layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Int8,
    Int16,
    Int32,
    Int64,
    #[serde(rename = "uint8")]
    UInt8,
    #[serde(rename = "uint16")]
    UInt16,
    #[serde(rename = "uint32")]
    UInt32,
    #[serde(rename = "uint64")]
    UInt64,
    Float,
    Double,
    String,
}

impl FieldType {
    /// Tag written into file headers.
    pub fn tag(self) -> u8 {
        match self {
            FieldType::Int8 => 1,
            FieldType::Int16 => 2,
            FieldType::Int32 => 3,
            FieldType::Int64 => 4,
            FieldType::UInt8 => 5,
            FieldType::UInt16 => 6,
            FieldType::UInt32 => 7,
            FieldType::UInt64 => 8,
            FieldType::Float => 9,
            FieldType::Double => 10,
            FieldType::String => 11,
        }
    }

    /// Inverse of [`FieldType::tag`].
    pub fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => FieldType::Int8,
            2 => FieldType::Int16,
            3 => FieldType::Int32,
            4 => FieldType::Int64,
            5 => FieldType::UInt8,
            6 => FieldType::UInt16,
            7 => FieldType::UInt32,
            8 => FieldType::UInt64,
            9 => FieldType::Float,
            10 => FieldType::Double,
            11 => FieldType::String,
            other => return Err(TesseraError::corrupt(format!("unknown field type tag {other}"))),
        })
    }

    /// Encoded width for fixed-size types, `None` for strings.
    pub fn fixed_size(self) -> Option<usize> {
        match self {
            FieldType::Int8 | FieldType::UInt8 => Some(1),
            FieldType::Int16 | FieldType::UInt16 => Some(2),
            FieldType::Int32 | FieldType::UInt32 | FieldType::Float => Some(4),
            FieldType::Int64 | FieldType::UInt64 | FieldType::Double => Some(8),
            FieldType::String => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            FieldType::Int8 => "int8",
            FieldType::Int16 => "int16",
            FieldType::Int32 => "int32",
            FieldType::Int64 => "int64",
            FieldType::UInt8 => "uint8",
            FieldType::UInt16 => "uint16",
            FieldType::UInt32 => "uint32",
            FieldType::UInt64 => "uint64",
            FieldType::Float => "float",
            FieldType::Double => "double",
            FieldType::String => "string",
        }
    }
}

impl std::fmt::Display for FieldType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

fn default_updatable() -> bool {
    true
}

/// One attribute field of a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldConfig {
    pub id: FieldId,
    pub name: String,
    pub field_type: FieldType,
    /// Whether the field accepts in-place updates (patches).
    #[serde(default = "default_updatable")]
    pub updatable: bool,
}

impl FieldConfig {
    pub fn new(id: FieldId, name: impl Into<String>, field_type: FieldType) -> Self {
        FieldConfig {
            id,
            name: name.into(),
            field_type,
            updatable: true,
        }
    }
}
