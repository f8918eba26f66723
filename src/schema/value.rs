//! Typed attribute values and their byte encodings.

use std::fmt;

use serde::Serialize;

use crate::error::{Result, TesseraError};
use crate::schema::field::FieldType;

/// A single attribute value.
///
/// Fixed-width types encode as little-endian bytes; strings encode as their
/// UTF-8 bytes (the length lives in the surrounding record).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
}

impl AttributeValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            AttributeValue::Int8(_) => FieldType::Int8,
            AttributeValue::Int16(_) => FieldType::Int16,
            AttributeValue::Int32(_) => FieldType::Int32,
            AttributeValue::Int64(_) => FieldType::Int64,
            AttributeValue::UInt8(_) => FieldType::UInt8,
            AttributeValue::UInt16(_) => FieldType::UInt16,
            AttributeValue::UInt32(_) => FieldType::UInt32,
            AttributeValue::UInt64(_) => FieldType::UInt64,
            AttributeValue::Float(_) => FieldType::Float,
            AttributeValue::Double(_) => FieldType::Double,
            AttributeValue::String(_) => FieldType::String,
        }
    }

    /// Append the encoding to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            AttributeValue::Int8(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::Int16(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::Int32(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::Int64(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::UInt8(v) => out.push(*v),
            AttributeValue::UInt16(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::UInt32(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::UInt64(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::Float(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::Double(v) => out.extend_from_slice(&v.to_le_bytes()),
            AttributeValue::String(v) => out.extend_from_slice(v.as_bytes()),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.encode(&mut out);
        out
    }

    /// Decode a value of type `field_type` from exactly `bytes`.
    pub fn decode(field_type: FieldType, bytes: &[u8]) -> Result<Self> {
        if let Some(size) = field_type.fixed_size() {
            if bytes.len() != size {
                return Err(TesseraError::corrupt(format!(
                    "{field_type} value needs {size} bytes, got {}",
                    bytes.len()
                )));
            }
        }

        macro_rules! fixed {
            ($variant:ident, $ty:ty) => {{
                let mut raw = [0u8; std::mem::size_of::<$ty>()];
                raw.copy_from_slice(bytes);
                AttributeValue::$variant(<$ty>::from_le_bytes(raw))
            }};
        }

        Ok(match field_type {
            FieldType::Int8 => fixed!(Int8, i8),
            FieldType::Int16 => fixed!(Int16, i16),
            FieldType::Int32 => fixed!(Int32, i32),
            FieldType::Int64 => fixed!(Int64, i64),
            FieldType::UInt8 => fixed!(UInt8, u8),
            FieldType::UInt16 => fixed!(UInt16, u16),
            FieldType::UInt32 => fixed!(UInt32, u32),
            FieldType::UInt64 => fixed!(UInt64, u64),
            FieldType::Float => fixed!(Float, f32),
            FieldType::Double => fixed!(Double, f64),
            FieldType::String => AttributeValue::String(
                String::from_utf8(bytes.to_vec())
                    .map_err(|e| TesseraError::corrupt(format!("string value is not UTF-8: {e}")))?,
            ),
        })
    }

    /// Parse a textual value as `field_type`.
    pub fn parse(field_type: FieldType, text: &str) -> Result<Self> {
        let mismatch = || {
            TesseraError::schema_mismatch(format!("cannot parse {text:?} as {field_type}"))
        };
        Ok(match field_type {
            FieldType::Int8 => AttributeValue::Int8(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::Int16 => AttributeValue::Int16(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::Int32 => AttributeValue::Int32(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::Int64 => AttributeValue::Int64(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::UInt8 => AttributeValue::UInt8(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::UInt16 => {
                AttributeValue::UInt16(text.trim().parse().map_err(|_| mismatch())?)
            }
            FieldType::UInt32 => {
                AttributeValue::UInt32(text.trim().parse().map_err(|_| mismatch())?)
            }
            FieldType::UInt64 => {
                AttributeValue::UInt64(text.trim().parse().map_err(|_| mismatch())?)
            }
            FieldType::Float => AttributeValue::Float(text.trim().parse().map_err(|_| mismatch())?),
            FieldType::Double => {
                AttributeValue::Double(text.trim().parse().map_err(|_| mismatch())?)
            }
            FieldType::String => AttributeValue::String(text.to_string()),
        })
    }

    fn as_i128(&self) -> Option<i128> {
        match *self {
            AttributeValue::Int8(v) => Some(v as i128),
            AttributeValue::Int16(v) => Some(v as i128),
            AttributeValue::Int32(v) => Some(v as i128),
            AttributeValue::Int64(v) => Some(v as i128),
            AttributeValue::UInt8(v) => Some(v as i128),
            AttributeValue::UInt16(v) => Some(v as i128),
            AttributeValue::UInt32(v) => Some(v as i128),
            AttributeValue::UInt64(v) => Some(v as i128),
            _ => None,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match *self {
            AttributeValue::Float(v) => Some(v as f64),
            AttributeValue::Double(v) => Some(v),
            _ => self.as_i128().map(|v| v as f64),
        }
    }

    /// Convert to `target`, failing with `SchemaMismatch` when the value
    /// does not fit (overflow, fractional to integer, unparsable string).
    pub fn convert_to(&self, target: FieldType) -> Result<Self> {
        if self.field_type() == target {
            return Ok(self.clone());
        }
        let mismatch = || {
            TesseraError::schema_mismatch(format!(
                "value {self} of type {} does not fit {target}",
                self.field_type()
            ))
        };

        if let AttributeValue::String(text) = self {
            return AttributeValue::parse(target, text).map_err(|_| mismatch());
        }
        if target == FieldType::String {
            return Ok(AttributeValue::String(self.to_string()));
        }

        let integral = match self.as_i128() {
            Some(v) => v,
            None => {
                let f = self.as_f64().ok_or_else(mismatch)?;
                match target {
                    FieldType::Float => return Ok(AttributeValue::Float(f as f32)),
                    FieldType::Double => return Ok(AttributeValue::Double(f)),
                    _ if f.fract() == 0.0 && f.is_finite() => f as i128,
                    _ => return Err(mismatch()),
                }
            }
        };

        macro_rules! narrow {
            ($variant:ident, $ty:ty) => {
                <$ty>::try_from(integral)
                    .map(AttributeValue::$variant)
                    .map_err(|_| mismatch())
            };
        }

        match target {
            FieldType::Int8 => narrow!(Int8, i8),
            FieldType::Int16 => narrow!(Int16, i16),
            FieldType::Int32 => narrow!(Int32, i32),
            FieldType::Int64 => narrow!(Int64, i64),
            FieldType::UInt8 => narrow!(UInt8, u8),
            FieldType::UInt16 => narrow!(UInt16, u16),
            FieldType::UInt32 => narrow!(UInt32, u32),
            FieldType::UInt64 => narrow!(UInt64, u64),
            FieldType::Float => Ok(AttributeValue::Float(integral as f32)),
            FieldType::Double => Ok(AttributeValue::Double(integral as f64)),
            FieldType::String => Err(mismatch()),
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Int8(v) => write!(f, "{v}"),
            AttributeValue::Int16(v) => write!(f, "{v}"),
            AttributeValue::Int32(v) => write!(f, "{v}"),
            AttributeValue::Int64(v) => write!(f, "{v}"),
            AttributeValue::UInt8(v) => write!(f, "{v}"),
            AttributeValue::UInt16(v) => write!(f, "{v}"),
            AttributeValue::UInt32(v) => write!(f, "{v}"),
            AttributeValue::UInt64(v) => write!(f, "{v}"),
            AttributeValue::Float(v) => write!(f, "{v}"),
            AttributeValue::Double(v) => write!(f, "{v}"),
            AttributeValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::String(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::String(value)
    }
}

impl From<i32> for AttributeValue {
    fn from(value: i32) -> Self {
        AttributeValue::Int32(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Int64(value)
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::UInt32(value)
    }
}

impl From<u64> for AttributeValue {
    fn from(value: u64) -> Self {
        AttributeValue::UInt64(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Double(value)
    }
}
