//! Command line argument parsing for the Tessera CLI using clap.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};

use crate::config::SchedulerKind;

/// Tessera - inspect and maintain segment index partitions
#[derive(Parser, Debug, Clone)]
#[command(name = "tessera")]
#[command(about = "Inspect and maintain Tessera index partitions")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(long_about = None)]
pub struct TesseraArgs {
    /// Verbosity level (0=quiet, 1=normal, 2=verbose, 3=debug)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (overrides verbose)
    #[arg(short, long)]
    pub quiet: bool,

    /// Output format
    #[arg(short = 'f', long = "format", default_value = "human")]
    pub output_format: OutputFormat,

    /// Pretty-print JSON output
    #[arg(long)]
    pub pretty: bool,

    /// Partition options file (JSON)
    #[arg(short, long, value_name = "CONFIG_FILE", env = "TESSERA_CONFIG")]
    pub config: Option<PathBuf>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

impl TesseraArgs {
    /// Get the effective verbosity level
    pub fn verbosity(&self) -> u8 {
        if self.quiet {
            0
        } else {
            match self.verbose {
                0 => 1,
                n => n,
            }
        }
    }
}

/// Available CLI commands
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Show the latest version and its segments
    Info(InfoArgs),

    /// List every version on disk
    Versions(PartitionArgs),

    /// Verify that versions, segments, deletion maps and patches load
    Check(CheckArgs),

    /// Run a merge policy once
    Merge(MergeArgs),

    /// Remove old versions and unreferenced segments
    Cleanup(CleanupArgs),
}

/// A partition path.
#[derive(Parser, Debug, Clone)]
pub struct PartitionArgs {
    /// Path to the partition directory
    #[arg(value_name = "PARTITION_PATH")]
    pub partition_path: PathBuf,
}

#[derive(Parser, Debug, Clone)]
pub struct InfoArgs {
    #[arg(value_name = "PARTITION_PATH")]
    pub partition_path: PathBuf,

    /// Show a specific version instead of the latest
    #[arg(long)]
    pub version: Option<i32>,

    /// Include the schema fields
    #[arg(short, long)]
    pub schema: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct CheckArgs {
    #[arg(value_name = "PARTITION_PATH")]
    pub partition_path: PathBuf,

    /// Check every version on disk, not only the latest
    #[arg(short, long)]
    pub all: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct MergeArgs {
    #[arg(value_name = "PARTITION_PATH")]
    pub partition_path: PathBuf,

    /// Merge policy name
    #[arg(short, long)]
    pub policy: Option<String>,

    /// Policy parameter as KEY=VALUE, VALUE parsed as JSON when possible
    #[arg(long = "param", value_name = "KEY=VALUE")]
    pub params: Vec<String>,

    /// Merge worker threads
    #[arg(short, long)]
    pub threads: Option<usize>,

    /// Memory ceiling of concurrent work items, in MB
    #[arg(long)]
    pub max_memory_mb: Option<u64>,

    /// Scheduler executing the work items
    #[arg(long)]
    pub scheduler: Option<SchedulerChoice>,

    /// Split output into segments of at most this many documents
    #[arg(long)]
    pub max_docs: Option<u32>,
}

#[derive(Parser, Debug, Clone)]
pub struct CleanupArgs {
    #[arg(value_name = "PARTITION_PATH")]
    pub partition_path: PathBuf,

    /// Number of newest versions to keep
    #[arg(short, long)]
    pub keep: Option<usize>,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerChoice {
    Simple,
    ResourceControl,
}

impl From<SchedulerChoice> for SchedulerKind {
    fn from(choice: SchedulerChoice) -> Self {
        match choice {
            SchedulerChoice::Simple => SchedulerKind::Simple,
            SchedulerChoice::ResourceControl => SchedulerKind::ResourceControl,
        }
    }
}

/// Output formats available in CLI
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Human,
    Json,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_merge_command() {
        let args = TesseraArgs::try_parse_from([
            "tessera",
            "-f",
            "json",
            "merge",
            "/data/p0",
            "--policy",
            "deletion_ratio",
            "--param",
            "ratio=0.5",
            "--scheduler",
            "simple",
            "--max-docs",
            "1000",
        ])
        .unwrap();

        assert_eq!(args.output_format, OutputFormat::Json);
        if let Command::Merge(merge) = args.command {
            assert_eq!(merge.partition_path, PathBuf::from("/data/p0"));
            assert_eq!(merge.policy.as_deref(), Some("deletion_ratio"));
            assert_eq!(merge.params, vec!["ratio=0.5"]);
            assert_eq!(merge.scheduler, Some(SchedulerChoice::Simple));
            assert_eq!(merge.max_docs, Some(1000));
        } else {
            panic!("Expected Merge command");
        }
    }

    #[test]
    fn test_verbosity() {
        let args = TesseraArgs::try_parse_from(["tessera", "versions", "p"]).unwrap();
        assert_eq!(args.verbosity(), 1);

        let args = TesseraArgs::try_parse_from(["tessera", "-vvv", "versions", "p"]).unwrap();
        assert_eq!(args.verbosity(), 3);

        let args = TesseraArgs::try_parse_from(["tessera", "-q", "-vv", "cleanup", "p"]).unwrap();
        assert_eq!(args.verbosity(), 0);
    }

    #[test]
    fn test_info_command() {
        let args =
            TesseraArgs::try_parse_from(["tessera", "info", "p", "--version", "3", "-s"]).unwrap();
        if let Command::Info(info) = args.command {
            assert_eq!(info.version, Some(3));
            assert!(info.schema);
        } else {
            panic!("Expected Info command");
        }
    }
}
