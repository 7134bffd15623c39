//! Shared fixtures for pipeline integration tests

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use autopo_pipeline::{
    CsvSnapshotPipeline, FlushCallback, InMemoryRunRepository, PipelineConfig, Worker,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use testcontainers::{core::IntoContainerPort, runners::AsyncRunner, ContainerAsync, ImageExt};
use testcontainers_modules::postgres::Postgres;
use tokio_util::sync::CancellationToken;

pub const PIPELINE: &str = "stock_health";

pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,autopo_pipeline=debug,sqlx=warn,testcontainers=info")),
        )
        .with_test_writer()
        .try_init();
}

/// Artifact contents captured on every flush
#[derive(Default)]
pub struct RecordingFlush {
    pub artifacts: Mutex<Vec<(PathBuf, String)>>,
    pub fail: AtomicBool,
}

impl RecordingFlush {
    pub fn calls(&self) -> usize {
        self.artifacts.lock().unwrap().len()
    }

    /// Data rows per flush, header excluded
    pub fn rows_per_flush(&self) -> Vec<usize> {
        self.artifacts
            .lock()
            .unwrap()
            .iter()
            .map(|(_, contents)| contents.lines().count().saturating_sub(1))
            .collect()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl FlushCallback for RecordingFlush {
    async fn on_flush(&self, _cancel: &CancellationToken, artifact_path: &Path) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("downstream load unavailable");
        }
        let contents = tokio::fs::read_to_string(artifact_path).await?;
        self.artifacts
            .lock()
            .unwrap()
            .push((artifact_path.to_path_buf(), contents));
        Ok(())
    }
}

/// Temporary drop directory plus output directory
pub struct Fixture {
    pub input: TempDir,
    pub output: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            input: TempDir::new().unwrap(),
            output: TempDir::new().unwrap(),
        }
    }

    /// Write a `{sku, qty}` file with `rows` records
    pub fn stock_file(&self, name: &str, rows: usize) -> PathBuf {
        let mut contents = String::from("sku,qty\n");
        for i in 0..rows {
            contents.push_str(&format!("SKU-{},{}\n", i, i + 1));
        }
        self.write(name, &contents)
    }

    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.input.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    pub fn config(&self) -> PipelineConfig {
        PipelineConfig::defaults(PIPELINE)
            .with_output_dir(self.output.path())
            .with_intermediate_dir(self.output.path().join("intermediate"))
            .with_batch_size(2)
            .with_batch_size_bytes(10_000_000)
            .with_flush_interval(Duration::from_secs(300))
            .with_worker_count(2)
            .with_retry_backoff(Duration::ZERO)
    }
}

pub fn pipeline() -> Arc<CsvSnapshotPipeline> {
    Arc::new(CsvSnapshotPipeline::new(PIPELINE).with_required_columns(["sku", "qty"]))
}

pub fn worker(
    config: PipelineConfig,
    repository: Arc<InMemoryRunRepository>,
    callback: Arc<RecordingFlush>,
) -> Worker {
    Worker::new(pipeline(), repository, callback, config).unwrap()
}

/// PostgreSQL container with migrations applied
pub struct TestPostgres {
    _container: ContainerAsync<Postgres>,
    pool: PgPool,
}

impl TestPostgres {
    pub async fn start() -> Result<Self> {
        let container = Postgres::default()
            .with_tag("16-alpine")
            .start()
            .await
            .context("Failed to start PostgreSQL container")?;

        let host = container
            .get_host()
            .await
            .context("Failed to get container host")?;
        let port = container
            .get_host_port_ipv4(5432.tcp())
            .await
            .context("Failed to get container port")?;
        let url = format!("postgresql://postgres:postgres@{}:{}/postgres", host, port);

        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(&url)
            .await
            .context("Failed to connect to PostgreSQL")?;

        sqlx::migrate!("../../migrations")
            .run(&pool)
            .await
            .context("Failed to run migrations")?;

        Ok(Self {
            _container: container,
            pool,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}
