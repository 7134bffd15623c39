//! AutoPO batch ingestion pipeline
//!
//! Periodic inventory and purchase-order drops are validated, transformed
//! and buffered per business date, flushed as dated CSV snapshots and loaded
//! downstream, with run and file job state tracked for retries.
//!
//! Data flows [`orchestrator::Orchestrator`] → [`worker::Worker`] (one batch
//! per date) → [`pipeline::Pipeline`] per file → [`aggregator::StreamingAggregator`]
//! → [`aggregator::FlushCallback`].

#![deny(clippy::unwrap_used, clippy::expect_used)]

pub mod aggregator;
pub mod config;
pub mod error;
pub mod loader;
pub mod orchestrator;
pub mod pipeline;
pub mod repository;
pub mod source;
pub mod worker;

pub use aggregator::{BufferStats, FlushCallback, NoopFlush, StreamingAggregator};
pub use config::{DatabaseConfig, PipelineConfig};
pub use error::{AggregationError, PipelineError, Result};
pub use orchestrator::{Orchestrator, OrchestratorReport};
pub use pipeline::{CsvSnapshotPipeline, FieldValue, Pipeline, TransformedRow};
pub use repository::{
    FileJob, InMemoryRunRepository, JobStatus, PgRunRepository, PipelineMetrics, PipelineRun,
    RunRepository, RunStatus,
};
pub use worker::{RetrySummary, Worker};
