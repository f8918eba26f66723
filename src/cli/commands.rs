//! Command implementations for the Tessera CLI.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::cli::args::*;
use crate::cli::output::*;
use crate::config::PartitionOptions;
use crate::error::{Result, TesseraError};
use crate::merge::policy::{MergePolicyRegistry, PolicyParams};
use crate::partition::IndexPartition;
use crate::segment::directory::SegmentDirectory;
use crate::segment::version::Version;
use crate::storage::{FileStorage, Storage, StorageConfig, TEMP_SUFFIX};

/// Execute a CLI command.
pub fn execute_command(args: TesseraArgs) -> Result<()> {
    let options = load_options(&args)?;
    match &args.command {
        Command::Info(info_args) => show_info(info_args, options, &args),
        Command::Versions(versions_args) => list_versions(versions_args, &args),
        Command::Check(check_args) => check_partition(check_args, options, &args),
        Command::Merge(merge_args) => run_merge(merge_args, options, &args),
        Command::Cleanup(cleanup_args) => run_cleanup(cleanup_args, options, &args),
    }
}

fn load_options(args: &TesseraArgs) -> Result<PartitionOptions> {
    match &args.config {
        Some(path) => {
            if args.verbosity() > 1 {
                println!("Loading options from: {}", path.display());
            }
            PartitionOptions::from_json_file(path)
        }
        None => Ok(PartitionOptions::default()),
    }
}

/// Open an existing partition directory without creating it.
fn open_storage(path: &Path) -> Result<Arc<dyn Storage>> {
    if !path.is_dir() {
        return Err(TesseraError::invalid_argument(format!(
            "partition directory {} does not exist",
            path.display()
        )));
    }
    Ok(Arc::new(FileStorage::new(path, StorageConfig::default())?))
}

fn show_info(args: &InfoArgs, options: PartitionOptions, cli_args: &TesseraArgs) -> Result<()> {
    let storage = open_storage(&args.partition_path)?;
    let partition = IndexPartition::open(Arc::clone(&storage), options)?;
    let reader = match args.version {
        Some(version_id) => partition.reader_at(version_id)?,
        None => partition.reader()?,
    };

    let segments = reader
        .directory()
        .iter_segments()
        .map(|segment| SegmentReport {
            segment_id: segment.segment_id(),
            doc_count: segment.doc_count(),
            deleted_count: reader.deletions().deleted_count(segment.segment_id()),
            base_doc_id: segment.base_doc_id(),
            schema_id: segment.info().schema_id,
            merged: segment.info().merged,
            created: format_timestamp(segment.info().timestamp),
        })
        .collect();

    let mut size = 0;
    for name in storage.list_files()? {
        size += storage.file_size(&name)?;
    }

    let version = reader.version();
    output_result(
        &format!("Partition {}", args.partition_path.display()),
        &PartitionInfo {
            path: args.partition_path.to_string_lossy().to_string(),
            version_id: version.version_id(),
            created: format_timestamp(version.timestamp()),
            format_version: reader.directory().format_version().to_string(),
            schema_id: version.schema_id(),
            total_docs: reader.doc_count(),
            live_docs: reader.live_doc_count(),
            size: format_bytes(size),
            segments,
            fields: args.schema.then(|| {
                reader
                    .schema()
                    .fields()
                    .iter()
                    .map(|f| format!("{} ({}, id {})", f.name, f.field_type, f.id))
                    .collect()
            }),
        },
        cli_args,
    )
}

fn list_versions(args: &PartitionArgs, cli_args: &TesseraArgs) -> Result<()> {
    let storage = open_storage(&args.partition_path)?;
    let mut versions = Vec::new();
    for version_id in Version::list_version_ids(&*storage)? {
        let entry = match Version::load(&*storage, version_id) {
            Ok(version) => VersionEntry {
                version_id,
                readable: true,
                created: Some(format_timestamp(version.timestamp())),
                schema_id: Some(version.schema_id()),
                segments: version.segment_ids(),
            },
            Err(e) => {
                log::warn!("version {version_id} is unreadable: {e}");
                VersionEntry {
                    version_id,
                    readable: false,
                    created: None,
                    schema_id: None,
                    segments: Vec::new(),
                }
            }
        };
        versions.push(entry);
    }

    output_result(
        "Versions",
        &VersionsList {
            path: args.partition_path.to_string_lossy().to_string(),
            versions,
        },
        cli_args,
    )
}

fn check_partition(
    args: &CheckArgs,
    options: PartitionOptions,
    cli_args: &TesseraArgs,
) -> Result<()> {
    let storage = open_storage(&args.partition_path)?;
    let partition = IndexPartition::open(Arc::clone(&storage), options)?;
    let mut issues = Vec::new();

    let version_ids = Version::list_version_ids(&*storage)?;
    let to_check: Vec<_> = if args.all {
        version_ids.clone()
    } else {
        vec![partition.latest_version()?.version_id()]
    };

    let mut referenced = BTreeSet::new();
    for &version_id in &version_ids {
        match Version::load(&*storage, version_id) {
            Ok(version) => referenced.extend(version.iter_segment_ids()),
            Err(e) => issues.push(format!("version {version_id}: {e}")),
        }
    }

    for &version_id in &to_check {
        if cli_args.verbosity() > 1 {
            println!("Checking version {version_id}...");
        }
        if let Err(e) = partition.reader_at(version_id) {
            issues.push(format!("version {version_id}: {e}"));
        }
    }

    let reserved = SegmentDirectory::reserved_segment_ids(&*storage)?;
    for segment_id in SegmentDirectory::on_disk_segment_ids(&*storage)? {
        if !referenced.contains(&segment_id) && !reserved.contains(&segment_id) {
            issues.push(format!("segment {segment_id} is referenced by no version"));
        }
    }
    for name in storage.list_files()? {
        if name.starts_with("version.") && name.ends_with(TEMP_SUFFIX) {
            issues.push(format!("unpublished version file {name}"));
        }
    }

    let issue_count = issues.len();
    output_result(
        "Partition check",
        &CheckReport {
            path: args.partition_path.to_string_lossy().to_string(),
            versions_checked: to_check.len(),
            issues,
        },
        cli_args,
    )?;

    if issue_count > 0 {
        return Err(TesseraError::corrupt(format!(
            "partition check found {issue_count} issues"
        )));
    }
    Ok(())
}

/// Parse `KEY=VALUE` pairs; values that are not JSON stay strings.
fn parse_policy_params(params: &[String]) -> Result<PolicyParams> {
    params
        .iter()
        .map(|param| {
            let (key, value) = param.split_once('=').ok_or_else(|| {
                TesseraError::invalid_argument(format!("policy parameter {param} is not KEY=VALUE"))
            })?;
            let value = serde_json::from_str(value)
                .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
            Ok((key.to_string(), value))
        })
        .collect()
}

fn run_merge(args: &MergeArgs, mut options: PartitionOptions, cli_args: &TesseraArgs) -> Result<()> {
    if let Some(policy) = &args.policy {
        options.merge.policy = policy.clone();
    }
    options.merge.policy_params.extend(parse_policy_params(&args.params)?);
    if let Some(threads) = args.threads {
        options.merge.thread_count = threads;
    }
    if let Some(max_memory_mb) = args.max_memory_mb {
        options.merge.max_memory_mb = max_memory_mb;
    }
    if let Some(scheduler) = args.scheduler {
        options.merge.scheduler = scheduler.into();
    }
    if args.max_docs.is_some() {
        options.merge.max_docs_per_output_segment = args.max_docs;
    }
    options.validate()?;

    let storage = open_storage(&args.partition_path)?;
    let partition = IndexPartition::open(storage, options)?;
    let registry = MergePolicyRegistry::with_defaults();

    match partition.merge(&registry)? {
        Some(result) => output_result("Merge completed", &result, cli_args),
        None => {
            if cli_args.verbosity() > 0 {
                println!("Nothing to merge");
            }
            Ok(())
        }
    }
}

fn run_cleanup(
    args: &CleanupArgs,
    mut options: PartitionOptions,
    cli_args: &TesseraArgs,
) -> Result<()> {
    if let Some(keep) = args.keep {
        options.online.keep_version_count = keep;
    }
    options.validate()?;

    let storage = open_storage(&args.partition_path)?;
    let partition = IndexPartition::open(storage, options)?;
    let report = partition.cleanup()?;
    output_result("Cleanup completed", &report, cli_args)
}
