//! Output formatting for CLI commands.

use serde::Serialize;

use crate::cli::args::{OutputFormat, TesseraArgs};
use crate::error::Result;
use crate::segment::id::{SegmentId, VersionId};

/// One segment of a version, as reported by `info`.
#[derive(Debug, Serialize)]
pub struct SegmentReport {
    pub segment_id: SegmentId,
    pub doc_count: u32,
    pub deleted_count: u32,
    pub base_doc_id: u32,
    pub schema_id: u32,
    pub merged: bool,
    pub created: String,
}

/// Result structure for the `info` command.
#[derive(Debug, Serialize)]
pub struct PartitionInfo {
    pub path: String,
    pub version_id: VersionId,
    pub created: String,
    pub format_version: String,
    pub schema_id: u32,
    pub total_docs: u32,
    pub live_docs: u64,
    pub size: String,
    pub segments: Vec<SegmentReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

/// One line of the `versions` listing.
#[derive(Debug, Serialize)]
pub struct VersionEntry {
    pub version_id: VersionId,
    pub readable: bool,
    pub created: Option<String>,
    pub schema_id: Option<u32>,
    pub segments: Vec<SegmentId>,
}

/// Result structure for the `versions` command.
#[derive(Debug, Serialize)]
pub struct VersionsList {
    pub path: String,
    pub versions: Vec<VersionEntry>,
}

/// Result structure for the `check` command.
#[derive(Debug, Serialize)]
pub struct CheckReport {
    pub path: String,
    pub versions_checked: usize,
    pub issues: Vec<String>,
}

/// Render a microsecond timestamp.
pub fn format_timestamp(micros: i64) -> String {
    chrono::DateTime::from_timestamp_micros(micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S%.3f UTC").to_string())
        .unwrap_or_else(|| micros.to_string())
}

/// Output a result in the specified format.
pub fn output_result<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    match args.output_format {
        OutputFormat::Human => output_human(message, result, args),
        OutputFormat::Json => output_json(result, args),
    }
}

fn output_human<T: Serialize>(message: &str, result: &T, args: &TesseraArgs) -> Result<()> {
    if args.verbosity() > 0 {
        println!("{message}");
        println!("{}", "─".repeat(message.chars().count()));
    }
    let value = serde_json::to_value(result)?;
    print_human_value(&value, 0);
    Ok(())
}

/// Print nested objects and arrays with indentation.
fn print_human_value(value: &serde_json::Value, indent: usize) {
    let spaces = "  ".repeat(indent);

    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                if is_nested(val) {
                    println!("{spaces}{key}:");
                    print_human_value(val, indent + 1);
                } else {
                    println!("{spaces}{key}: {}", format_value(val));
                }
            }
        }
        serde_json::Value::Array(arr) if arr.is_empty() => println!("{spaces}(none)"),
        serde_json::Value::Array(arr) => {
            for item in arr {
                if is_nested(item) {
                    println!("{spaces}-");
                    print_human_value(item, indent + 1);
                } else {
                    println!("{spaces}- {}", format_value(item));
                }
            }
        }
        _ => println!("{spaces}{}", format_value(value)),
    }
}

/// Objects, and arrays holding objects, get their own block.
fn is_nested(value: &serde_json::Value) -> bool {
    match value {
        serde_json::Value::Object(_) => true,
        serde_json::Value::Array(arr) => arr.iter().any(|v| v.is_object() || v.is_array()),
        _ => false,
    }
}

fn output_json<T: Serialize>(result: &T, args: &TesseraArgs) -> Result<()> {
    let json = if args.pretty {
        serde_json::to_string_pretty(result)?
    } else {
        serde_json::to_string(result)?
    };

    println!("{json}");
    Ok(())
}

/// Format a JSON value for display.
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Array(arr) => {
            let formatted_values = arr.iter().map(format_value).collect::<Vec<_>>().join(", ");
            format!("[{formatted_values}]")
        }
        serde_json::Value::Object(_) => "[object]".to_string(),
        serde_json::Value::Null => "-".to_string(),
    }
}

/// Format bytes into human-readable format.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    let unit = UNITS[unit_index];
    if unit_index == 0 {
        format!("{bytes} {unit}")
    } else {
        format!("{size:.1} {unit}")
    }
}
