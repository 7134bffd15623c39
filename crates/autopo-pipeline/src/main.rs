//! AutoPO pipeline - command line entry point

use anyhow::{bail, Context, Result};
use autopo_common::logging::{init_logging, LogConfig};
use autopo_pipeline::loader::SnapshotLoader;
use autopo_pipeline::source::{fetch_folder, FetchOptions, LocalFileSource};
use autopo_pipeline::{
    CsvSnapshotPipeline, DatabaseConfig, FlushCallback, InMemoryRunRepository, NoopFlush,
    Orchestrator, PgRunRepository, Pipeline, PipelineConfig, RunRepository, Worker,
};
use chrono::{Duration, NaiveDate, Utc};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "autopo-pipeline", version, about = "Batch ingestion for inventory and PO snapshots")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Process every file in a drop, one batch per snapshot date
    Run(RunArgs),
    /// Reprocess failed file jobs below the retry ceiling
    Retry(PipelineArgs),
    /// Show recent run statistics
    Status {
        #[command(flatten)]
        pipeline: PipelineArgs,
        /// Look back this many days
        #[arg(long, default_value_t = 7)]
        since_days: i64,
    },
    /// Apply database migrations
    Migrate,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Pipeline name, also the default output table
    #[arg(long, env = "PIPELINE_NAME")]
    pipeline: String,
    /// Output table for loaded rows
    #[arg(long)]
    output_table: Option<String>,
    /// chrono layout of the date prefix in file and folder names
    #[arg(long, default_value = "%Y%m%d")]
    date_format: String,
    /// Column every input file must carry (repeatable)
    #[arg(long = "required-column")]
    required_columns: Vec<String>,
    /// Column kept as verbatim text, never inferred (repeatable)
    #[arg(long = "text-column")]
    text_columns: Vec<String>,
    #[command(flatten)]
    tuning: TuningArgs,
}

/// Overrides for [`PipelineConfig`], applied on top of the env defaults
#[derive(Args, Debug, Default)]
struct TuningArgs {
    /// Files buffered before a flush
    #[arg(long, env = "PIPELINE_BATCH_SIZE")]
    batch_size: Option<usize>,
    /// Estimated bytes buffered before a flush
    #[arg(long, env = "PIPELINE_BATCH_SIZE_BYTES")]
    batch_size_bytes: Option<u64>,
    /// Maximum seconds between flushes
    #[arg(long, env = "PIPELINE_FLUSH_INTERVAL_SECS")]
    flush_interval_secs: Option<u64>,
    /// Files processed concurrently within a batch
    #[arg(long, env = "PIPELINE_WORKERS")]
    workers: Option<usize>,
    /// Directory for flushed artifacts
    #[arg(long, env = "PIPELINE_OUTPUT_DIR")]
    output_dir: Option<PathBuf>,
    /// Directory for staged downloads and conversions
    #[arg(long, env = "PIPELINE_INTERMEDIATE_DIR")]
    intermediate_dir: Option<PathBuf>,
    /// Retry ceiling for a failed file job
    #[arg(long, env = "PIPELINE_RETRY_ATTEMPTS")]
    retry_attempts: Option<u32>,
    /// Seconds to wait before a retry pass
    #[arg(long, env = "PIPELINE_RETRY_BACKOFF_SECS")]
    retry_backoff_secs: Option<u64>,
}

impl TuningArgs {
    fn apply(&self, mut config: PipelineConfig) -> PipelineConfig {
        if let Some(files) = self.batch_size {
            config = config.with_batch_size(files);
        }
        if let Some(bytes) = self.batch_size_bytes {
            config = config.with_batch_size_bytes(bytes);
        }
        if let Some(secs) = self.flush_interval_secs {
            config = config.with_flush_interval(StdDuration::from_secs(secs));
        }
        if let Some(workers) = self.workers {
            config = config.with_worker_count(workers);
        }
        if let Some(dir) = &self.output_dir {
            config = config.with_output_dir(dir);
        }
        if let Some(dir) = &self.intermediate_dir {
            config = config.with_intermediate_dir(dir);
        }
        if let Some(attempts) = self.retry_attempts {
            config = config.with_retry_attempts(attempts);
        }
        if let Some(secs) = self.retry_backoff_secs {
            config = config.with_retry_backoff(StdDuration::from_secs(secs));
        }
        config
    }
}

#[derive(Args, Debug)]
struct RunArgs {
    #[command(flatten)]
    pipeline: PipelineArgs,
    /// Root of the drop: date folders each holding an input folder
    #[arg(long)]
    input_dir: PathBuf,
    /// Only process this snapshot date (YYYYMMDD)
    #[arg(long, value_parser = parse_snapshot_date)]
    snapshot_date: Option<NaiveDate>,
    /// Where fetched files are staged; defaults to the intermediate dir
    #[arg(long)]
    download_dir: Option<PathBuf>,
    /// Use an in-memory run store and skip the database load
    #[arg(long)]
    dry_run: bool,
}

fn parse_snapshot_date(raw: &str) -> std::result::Result<NaiveDate, String> {
    NaiveDate::parse_from_str(raw, "%Y%m%d").map_err(|e| format!("expected YYYYMMDD: {}", e))
}

impl PipelineArgs {
    fn build(&self) -> CsvSnapshotPipeline {
        CsvSnapshotPipeline::new(&self.pipeline)
            .with_output_table(self.output_table.as_deref().unwrap_or(&self.pipeline))
            .with_date_layout(&self.date_format)
            .with_required_columns(self.required_columns.iter().cloned())
            .with_text_columns(self.text_columns.iter().cloned())
    }

    fn config(&self) -> Result<PipelineConfig> {
        let config = self.tuning.apply(PipelineConfig::from_env(&self.pipeline)?);
        config.validate()?;
        Ok(config)
    }

    fn loader(
        &self,
        repository: &PgRunRepository,
        pipeline: &CsvSnapshotPipeline,
    ) -> SnapshotLoader {
        SnapshotLoader::new(repository.pool().clone(), pipeline.output_table())
            .with_text_columns(self.text_columns.iter().cloned())
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_config = LogConfig::builder()
        .log_file_prefix("autopo-pipeline")
        .filter_directives("autopo_pipeline=info,sqlx=warn")
        .build();
    let log_config = log_config.clone().merge_env().unwrap_or(log_config);
    let _guard = match init_logging(&log_config) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Failed to initialize logging: {:#}", e);
            None
        },
    };

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling");
            signal_token.cancel();
        }
    });

    if let Err(e) = execute(cli, &cancel).await {
        error!(error = %format!("{:#}", e), "Command failed");
        eprintln!("Error: {:#}", e);
        process::exit(1);
    }
}

async fn execute(cli: Cli, cancel: &CancellationToken) -> Result<()> {
    match cli.command {
        Commands::Run(args) => run(args, cancel).await,
        Commands::Retry(args) => retry(args, cancel).await,
        Commands::Status {
            pipeline,
            since_days,
        } => status(pipeline, since_days).await,
        Commands::Migrate => {
            let repository = connect().await?;
            repository.migrate().await?;
            info!("Database migrations completed");
            Ok(())
        },
    }
}

async fn connect() -> Result<PgRunRepository> {
    let config = DatabaseConfig::from_env()?;
    let repository = PgRunRepository::connect(&config)
        .await
        .context("Failed to connect to database")?;
    info!("Database connection pool established");
    Ok(repository)
}

async fn run(args: RunArgs, cancel: &CancellationToken) -> Result<()> {
    let pipeline = Arc::new(args.pipeline.build());
    let config = args.pipeline.config()?;

    let (repository, callback): (Arc<dyn RunRepository>, Arc<dyn FlushCallback>) = if args.dry_run
    {
        info!("Dry run: runs kept in memory, artifacts not loaded");
        (Arc::new(InMemoryRunRepository::new()), Arc::new(NoopFlush))
    } else {
        let repository = connect().await?;
        let loader = args.pipeline.loader(&repository, &pipeline);
        (Arc::new(repository), Arc::new(loader))
    };

    let download_dir = args
        .download_dir
        .unwrap_or_else(|| config.intermediate_dir.join("downloads"));
    let options = FetchOptions {
        date_layout: args.pipeline.date_format.clone(),
        snapshot_date: args.snapshot_date,
        ..FetchOptions::default()
    };
    let source = LocalFileSource::new(&args.input_dir);
    let files = fetch_folder(&source, cancel, "", &download_dir, &options).await?;
    if files.is_empty() {
        warn!(input_dir = %args.input_dir.display(), "No input files found");
        return Ok(());
    }

    let worker = Worker::new(pipeline, repository, callback, config)?;
    let orchestrator = Orchestrator::new(Arc::new(worker));
    let report = orchestrator.run(cancel, &files).await?;

    for run in &report.runs {
        info!(
            pipeline = %run.pipeline_name,
            date = %run.snapshot_date,
            status = %run.status,
            processed = run.processed_files,
            total = run.total_files,
            rows = run.total_rows,
            "Run finished"
        );
    }
    info!(
        dates = report.dates.len(),
        rows = report.total_rows(),
        "Processed drop"
    );
    Ok(())
}

async fn retry(args: PipelineArgs, cancel: &CancellationToken) -> Result<()> {
    let pipeline = Arc::new(args.build());
    let config = args.config()?;
    let repository = connect().await?;
    let loader = args.loader(&repository, &pipeline);

    let worker = Worker::new(pipeline, Arc::new(repository), Arc::new(loader), config)?;
    let summary = worker.retry_failed(cancel).await?;
    info!(
        jobs = summary.jobs_retried,
        runs = summary.runs_retried,
        completed = summary.runs_completed,
        failed = summary.runs_failed,
        "Retry pass finished"
    );
    if summary.runs_failed > 0 {
        bail!("{} runs still failing", summary.runs_failed);
    }
    Ok(())
}

async fn status(args: PipelineArgs, since_days: i64) -> Result<()> {
    let repository = connect().await?;
    let since = Utc::now() - Duration::days(since_days.max(0));

    let metrics = repository.pipeline_stats(&args.pipeline, since).await?;
    info!(
        pipeline = %metrics.pipeline_name,
        since = %since.date_naive(),
        runs = metrics.total_runs,
        completed = metrics.completed_runs,
        failed = metrics.failed_runs,
        rows = metrics.total_rows,
        last_completed = %metrics
            .last_completed_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string()),
        "Pipeline stats"
    );

    for run in repository.runs_for_date(Utc::now().date_naive()).await? {
        info!(
            pipeline = %run.pipeline_name,
            date = %run.snapshot_date,
            status = %run.status,
            processed = run.processed_files,
            total = run.total_files,
            error = run.error_message.as_deref().unwrap_or(""),
            "Run today"
        );
    }
    Ok(())
}
