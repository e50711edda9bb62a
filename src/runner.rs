//! High-level runner API for the importer.
//!
//! This module provides a simplified public interface that encapsulates all the
//! internal setup of connections, readers, workers and the failure writer.
//!
//! This is the primary API for external users and for the CLI.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, info_span, warn};

use crate::config::{
    BYTES_PER_KB, DEFAULT_CHUNK_SIZE_KB, DEFAULT_WORKER_COUNT, MAX_CHUNK_SIZE_KB,
    MAX_WORKER_COUNT, MIN_CHUNK_SIZE_KB, MIN_WORKER_COUNT, TABLE_NAME_PREFIX_LEN,
};
use crate::coordination::{FailureSink, Pipeline, PipelineConfigBuilder};
use crate::db::schema::load_model_file;
use crate::db::{self, Schema, StorageBackend};
use crate::error::ImportError;
use crate::formats::{DecodePolicy, InputFileConfig};
use crate::io::LocalFileByteReader;

/// Arguments for running an import
#[derive(Debug, Clone)]
pub struct ImportArgs {
    /// JSON model file describing the file dialect, columns and primary key
    pub model_path: PathBuf,
    pub input_path: PathBuf,
    /// `postgres://...`, `postgresql://...` or `sqlite:...`
    pub db_url: String,
    /// Failed rows are appended here in the input file's dialect
    pub fail_output_path: PathBuf,

    /// Target table; generated from the input file name when absent
    pub table_name: Option<String>,
    /// Clamped to 1..=128, default 2
    pub worker_count: Option<usize>,
    /// Clamped to 1..=64000, default 16
    pub chunk_size_kb: Option<usize>,
    pub decode_policy: DecodePolicy,
    pub quiet: bool,
}

/// Result of a completed import
#[derive(Debug, Clone)]
pub struct ImportSummary {
    pub table_name: String,
    pub rows_read: u64,
    pub rows_committed: u64,
    pub rows_failed: u64,
    /// Rows in the target table after the run, including earlier runs
    pub table_row_count: u64,
    /// Set when at least one row was written to the failure file
    pub failure_file: Option<PathBuf>,
    pub duration: Duration,
}

/// Everything validated before the first connection is opened
struct ImportPlan {
    schema: Arc<Schema>,
    file_config: InputFileConfig,
    table_name: String,
    worker_count: usize,
    chunk_size_bytes: usize,
}

/// Run an import with the specified arguments
///
/// Model, input and URL problems are reported as
/// [`ImportError::InvalidInput`] before any storage is touched; everything
/// that fails afterwards is an [`ImportError::Execution`]. Rows that fail
/// conversion or insertion never fail the run.
///
/// # Example
///
/// ```no_run
/// use todb::formats::DecodePolicy;
/// use todb::runner::{ImportArgs, run_import};
///
/// # async fn example() -> Result<(), todb::error::ImportError> {
/// let args = ImportArgs {
///     model_path: "model.json".into(),
///     input_path: "data.csv".into(),
///     db_url: "sqlite:///tmp/data.db".to_string(),
///     fail_output_path: "failed.csv".into(),
///     table_name: Some("data".to_string()),
///     worker_count: Some(4),
///     chunk_size_kb: None,
///     decode_policy: DecodePolicy::Skip,
///     quiet: true,
/// };
///
/// let summary = run_import(args).await?;
/// println!("Imported {} of {} rows", summary.rows_committed, summary.rows_read);
/// # Ok(())
/// # }
/// ```
pub async fn run_import(args: ImportArgs) -> Result<ImportSummary, ImportError> {
    let plan = prepare(&args).await.map_err(ImportError::InvalidInput)?;
    execute(&args, plan).await.map_err(ImportError::Execution)
}

async fn prepare(args: &ImportArgs) -> Result<ImportPlan> {
    let input_metadata = tokio::fs::metadata(&args.input_path)
        .await
        .with_context(|| format!("Input file {} not found", args.input_path.display()))?;
    if !input_metadata.is_file() {
        anyhow::bail!("Input path {} is not a file", args.input_path.display());
    }

    let (schema, file_config) = load_model_file(&args.model_path).await?;
    StorageBackend::from_url(&args.db_url)?;

    let table_name = match &args.table_name {
        Some(name) if name.trim().is_empty() => anyhow::bail!("Table name must not be empty"),
        Some(name) => name.clone(),
        None => generate_table_name(&args.input_path, Utc::now()),
    };

    let worker_count = limit_or_default(
        args.worker_count,
        DEFAULT_WORKER_COUNT,
        MIN_WORKER_COUNT,
        MAX_WORKER_COUNT,
    );
    let chunk_size_kb = limit_or_default(
        args.chunk_size_kb,
        DEFAULT_CHUNK_SIZE_KB,
        MIN_CHUNK_SIZE_KB,
        MAX_CHUNK_SIZE_KB,
    );

    Ok(ImportPlan {
        schema: Arc::new(schema),
        file_config,
        table_name,
        worker_count,
        chunk_size_bytes: chunk_size_kb * BYTES_PER_KB,
    })
}

async fn execute(args: &ImportArgs, plan: ImportPlan) -> Result<ImportSummary> {
    info!(
        "Importing {} into table '{}' with {} workers",
        args.input_path.display(),
        plan.table_name,
        plan.worker_count
    );

    let mut admin = db::connect(&args.db_url, info_span!("storage", role = "admin")).await?;
    admin
        .init_table(
            &plan.table_name,
            &plan.schema.columns,
            &plan.schema.primary_key,
        )
        .await?;

    let mut storages = Vec::with_capacity(plan.worker_count);
    for worker_id in 0..plan.worker_count {
        let storage = db::connect(&args.db_url, info_span!("storage", worker_id))
            .await
            .with_context(|| format!("Failed to open connection for worker {}", worker_id))?;
        storages.push(storage);
    }

    let reader = LocalFileByteReader::open(&args.input_path).await?;
    let failure_sink = FailureSink::new(
        &args.fail_output_path,
        plan.file_config.clone(),
        info_span!("failure_writer", path = %args.fail_output_path.display()),
    );
    let config = PipelineConfigBuilder::default()
        .table_name(plan.table_name.clone())
        .chunk_size_bytes(plan.chunk_size_bytes)
        .decode_policy(args.decode_policy)
        .quiet(args.quiet)
        .build()?;

    let result = Pipeline::new(plan.schema, plan.file_config)
        .run(&config, reader, storages, failure_sink)
        .await?;

    let table_row_count = admin.count(&plan.table_name).await?;
    if let Err(e) = admin.close().await {
        warn!("Failed to close admin connection: {:#}", e);
    }

    Ok(ImportSummary {
        table_name: plan.table_name,
        rows_read: result.rows_read,
        rows_committed: result.rows_committed,
        rows_failed: result.rows_failed,
        table_row_count,
        failure_file: (result.failure_report.rows_written > 0)
            .then(|| args.fail_output_path.clone()),
        duration: result.duration,
    })
}

/// Table name derived from the input file name and the time of day
///
/// `<basename, at most 48 chars>_<HH_MM_SS>`, with `:` and `.` replaced by `_`.
pub fn generate_table_name(input_path: &Path, now: DateTime<Utc>) -> String {
    let basename = input_path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    let prefix: String = basename.chars().take(TABLE_NAME_PREFIX_LEN).collect();

    format!("{}_{}", prefix, now.format("%H:%M:%S")).replace([':', '.'], "_")
}

/// Clamp a user-supplied bound, falling back to `default` when absent
pub fn limit_or_default(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.map_or(default, |v| v.clamp(min, max))
}
