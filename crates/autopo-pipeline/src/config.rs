//! Pipeline and database configuration
//!
//! Every pipeline type is constructed with one immutable [`PipelineConfig`].
//! Values come from code defaults, optionally overlaid with `PIPELINE_*`
//! environment variables and finally with command-line flags.

use autopo_common::env::{env_or, env_parse, env_required};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{PipelineError, Result};

/// Default number of files buffered before a flush.
pub const DEFAULT_BATCH_SIZE: usize = 5;

/// Default byte estimate that triggers a flush (10 MiB).
pub const DEFAULT_BATCH_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default maximum time between flushes.
pub const DEFAULT_FLUSH_INTERVAL_SECS: u64 = 5 * 60;

/// Default size of the per-batch file processing pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default retry ceiling for a failed file job.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Default wait before a retry pass starts.
pub const DEFAULT_RETRY_BACKOFF_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/autopo";

/// Per pipeline type configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PipelineConfig {
    pub name: String,
    /// Number of buffered files that triggers a flush
    pub batch_size: usize,
    /// Buffered byte estimate that triggers a flush
    pub batch_size_bytes: u64,
    /// Maximum time since the last flush before the next add flushes
    pub flush_interval: Duration,
    /// Concurrent file processors per batch, clamped to at least 1
    pub worker_count: usize,
    /// Directory for the per-date aggregated artifacts
    pub output_dir: PathBuf,
    /// Directory for per-file intermediate outputs of pipeline variants
    pub intermediate_dir: PathBuf,
    /// A failed file job is retried while its retry count is below this
    pub retry_attempts: u32,
    /// Wait applied before a retry pass reprocesses failed jobs
    pub retry_backoff: Duration,
}

impl PipelineConfig {
    pub fn defaults(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            batch_size_bytes: DEFAULT_BATCH_SIZE_BYTES,
            flush_interval: Duration::from_secs(DEFAULT_FLUSH_INTERVAL_SECS),
            worker_count: DEFAULT_WORKER_COUNT,
            output_dir: PathBuf::from("data/seeds").join(&name),
            intermediate_dir: PathBuf::from("data/intermediate").join(&name),
            retry_attempts: DEFAULT_RETRY_ATTEMPTS,
            retry_backoff: Duration::from_secs(DEFAULT_RETRY_BACKOFF_SECS),
            name,
        }
    }

    /// Defaults for `name` overlaid with `PIPELINE_*` environment variables
    ///
    /// Unparsable values keep the default.
    pub fn from_env(name: impl Into<String>) -> Result<Self> {
        let defaults = Self::defaults(name);

        let config = Self {
            batch_size: env_or("PIPELINE_BATCH_SIZE", defaults.batch_size),
            batch_size_bytes: env_or("PIPELINE_BATCH_SIZE_BYTES", defaults.batch_size_bytes),
            flush_interval: Duration::from_secs(env_or(
                "PIPELINE_FLUSH_INTERVAL_SECS",
                defaults.flush_interval.as_secs(),
            )),
            worker_count: env_or("PIPELINE_WORKERS", defaults.worker_count),
            output_dir: std::env::var("PIPELINE_OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.output_dir.clone()),
            intermediate_dir: std::env::var("PIPELINE_INTERMEDIATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| defaults.intermediate_dir.clone()),
            retry_attempts: env_or("PIPELINE_RETRY_ATTEMPTS", defaults.retry_attempts),
            retry_backoff: Duration::from_secs(env_or(
                "PIPELINE_RETRY_BACKOFF_SECS",
                defaults.retry_backoff.as_secs(),
            )),
            name: defaults.name,
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(PipelineError::Config("pipeline name must not be empty".into()));
        }
        if self.batch_size == 0 {
            return Err(PipelineError::Config("batch size must be greater than 0".into()));
        }
        if self.batch_size_bytes == 0 {
            return Err(PipelineError::Config(
                "batch size in bytes must be greater than 0".into(),
            ));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(PipelineError::Config("output directory must be set".into()));
        }
        Ok(())
    }

    pub fn effective_worker_count(&self) -> usize {
        self.worker_count.max(1)
    }

    pub fn with_batch_size(mut self, files: usize) -> Self {
        self.batch_size = files;
        self
    }

    pub fn with_batch_size_bytes(mut self, bytes: u64) -> Self {
        self.batch_size_bytes = bytes;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_worker_count(mut self, workers: usize) -> Self {
        self.worker_count = workers;
        self
    }

    pub fn with_output_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.output_dir = dir.into();
        self
    }

    pub fn with_intermediate_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.intermediate_dir = dir.into();
        self
    }

    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }
}

/// Database connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 10,
            idle_timeout_secs: 600,
        }
    }
}

impl DatabaseConfig {
    /// Load from `DATABASE_*` variables, honouring a `.env` file when present
    ///
    /// `DATABASE_URL` is required; malformed pool settings are rejected.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        Ok(Self {
            url: env_required("DATABASE_URL")?,
            max_connections: env_parse("DATABASE_MAX_CONNECTIONS")?
                .unwrap_or(defaults.max_connections),
            min_connections: env_parse("DATABASE_MIN_CONNECTIONS")?
                .unwrap_or(defaults.min_connections),
            connect_timeout_secs: env_parse("DATABASE_CONNECT_TIMEOUT")?
                .unwrap_or(defaults.connect_timeout_secs),
            idle_timeout_secs: env_parse("DATABASE_IDLE_TIMEOUT")?
                .unwrap_or(defaults.idle_timeout_secs),
        })
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::defaults("stock_health");
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.batch_size_bytes, 10 * 1024 * 1024);
        assert_eq!(config.flush_interval, Duration::from_secs(300));
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.output_dir, PathBuf::from("data/seeds/stock_health"));
        assert_eq!(
            config.intermediate_dir,
            PathBuf::from("data/intermediate/stock_health")
        );
        assert_eq!(config.retry_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_zero_thresholds() {
        assert!(PipelineConfig::defaults("po_snapshot")
            .with_batch_size(0)
            .validate()
            .is_err());
        assert!(PipelineConfig::defaults("po_snapshot")
            .with_batch_size_bytes(0)
            .validate()
            .is_err());
        assert!(PipelineConfig::defaults("  ").validate().is_err());
    }

    #[test]
    fn test_worker_count_is_clamped() {
        let config = PipelineConfig::defaults("stock_health").with_worker_count(0);
        assert_eq!(config.effective_worker_count(), 1);
    }
}
