//! ctgov-etl - task entry points for the clinical trials pipeline

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use ctgov_common::logging::{init_logging, LogConfig, LogLevel};
use ctgov_etl::config::Config;
use ctgov_etl::notify::WebhookNotifier;
use ctgov_etl::quality::QualityChecker;
use ctgov_etl::source::ClinicalTrialsClient;
use ctgov_etl::storage::S3Storage;
use ctgov_etl::transform::DbtRunner;
use ctgov_etl::warehouse::{PgWarehouse, Warehouse};
use ctgov_etl::{BatchId, IngestPipeline, PipelineSettings};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "ctgov-etl")]
#[command(author, version, about = "Clinical trials micro-batch ETL")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML configuration file
    #[arg(short, long, global = true, env = "CTGOV_CONFIG")]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Extract, stage, load and transform one batch
    Run {
        /// Batch id, defaults to the current UTC time (YYYYMMDD_HHMMSS)
        #[arg(short, long)]
        batch_id: Option<String>,
    },

    /// Extract from the registry and stage batches plus manifest
    Stage {
        #[arg(short, long)]
        batch_id: Option<String>,
    },

    /// Load a staged batch into the warehouse staging table
    Load {
        #[arg(short, long)]
        batch_id: String,

        /// Seconds to wait for the manifest before giving up
        #[arg(long)]
        wait_secs: Option<u64>,
    },

    /// Run dbt models and tests for a loaded batch
    Transform {
        #[arg(short, long)]
        batch_id: String,
    },

    /// Run data-quality checks (exit 0 pass, 2 failed check, 1 error)
    QualityCheck,

    /// Create the staging table if missing
    InitWarehouse,
}

fn batch_id_or_now(value: Option<String>) -> Result<BatchId> {
    match value {
        Some(id) => Ok(BatchId::parse(id)?),
        None => Ok(BatchId::now()),
    }
}

/// Staging never touches the warehouse, so its pool connects lazily.
async fn build_pipeline(config: &Config, connect_warehouse: bool) -> Result<IngestPipeline> {
    let source = Arc::new(ClinicalTrialsClient::new(&config.source)?);
    let store = Arc::new(S3Storage::new(config.storage.clone()).await?);
    let warehouse = if connect_warehouse {
        Arc::new(PgWarehouse::connect(&config.warehouse).await?)
    } else {
        Arc::new(PgWarehouse::connect_lazy(&config.warehouse)?)
    };
    let settings = PipelineSettings::from_config(config, Utc::now().date_naive())?;

    let mut pipeline = IngestPipeline::new(source, store, warehouse, settings);
    if config.transform.enabled {
        pipeline = pipeline.with_transform(Arc::new(DbtRunner::new(&config.transform)));
    }
    if let Some(notifier) = WebhookNotifier::from_config(&config.notify)? {
        pipeline = pipeline.with_notifier(Arc::new(notifier));
    }
    Ok(pipeline)
}

async fn execute(command: Command, mut config: Config) -> Result<ExitCode> {
    match command {
        Command::Run { batch_id } => {
            let batch_id = batch_id_or_now(batch_id)?;
            let pipeline = build_pipeline(&config, true).await?;
            let report = pipeline.run(&batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        },
        Command::Stage { batch_id } => {
            let batch_id = batch_id_or_now(batch_id)?;
            let pipeline = build_pipeline(&config, false).await?;
            let report = pipeline.stage(&batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&report.manifest)?);
        },
        Command::Load {
            batch_id,
            wait_secs,
        } => {
            let batch_id = BatchId::parse(batch_id)?;
            if let Some(wait) = wait_secs {
                config.warehouse.manifest_wait_secs = wait;
            }
            let pipeline = build_pipeline(&config, true).await?;
            let result = pipeline.load(&batch_id).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        },
        Command::Transform { batch_id } => {
            let batch_id = BatchId::parse(batch_id)?;
            let pipeline = build_pipeline(&config, false).await?;
            if let Some(outcome) = pipeline.transform(&batch_id).await? {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            }
        },
        Command::QualityCheck => {
            let warehouse = Arc::new(PgWarehouse::connect(&config.warehouse).await?);
            let checker = QualityChecker::new(
                warehouse,
                config.quality.clone(),
                config.warehouse.staging_table.clone(),
            );
            let report = checker.run().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            return Ok(exit_code(report.exit_code()));
        },
        Command::InitWarehouse => {
            let warehouse = PgWarehouse::connect(&config.warehouse).await?;
            warehouse
                .ensure_staging_table(&config.warehouse.staging_table)
                .await?;
        },
    }
    Ok(ExitCode::SUCCESS)
}

fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("ctgov-etl")
        .build();

    // Environment variables take precedence
    let log_config = match log_config.merge_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Invalid logging configuration: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            return ExitCode::FAILURE;
        },
    };

    let config = match Config::load(cli.config.as_deref()).context("Failed to load configuration") {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::FAILURE;
        },
    };

    info!(command = ?cli.command, "Starting");
    match execute(cli.command, config).await {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        },
    }
}
