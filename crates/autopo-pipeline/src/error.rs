//! Pipeline error taxonomy
//!
//! File-level failures (`Validation`, `Transform`) are recorded on the owning
//! file job and only reach the batch as [`PipelineError::FilesFailed`].
//! Aggregation and persistence failures terminate the batch immediately.

use chrono::NaiveDate;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("validation failed for {path}: {source:#}")]
    Validation {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("transformation failed for {path}: {source:#}")]
    Transform {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to get snapshot date for {file}: {source:#}")]
    SnapshotDate {
        file: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("aggregation failed: {0}")]
    Aggregation(#[from] AggregationError),

    #[error("database error: {0}")]
    Persistence(#[from] sqlx::Error),

    #[error("repository error: {0}")]
    Repository(String),

    #[error("{failed} of {total} files failed: {first_error}")]
    FilesFailed {
        failed: usize,
        total: usize,
        first_error: String,
    },

    #[error("failed to process batch for {date}: {source}")]
    Batch {
        date: NaiveDate,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Common(#[from] autopo_common::AutopoError),
}

impl PipelineError {
    /// True when the error, or the batch error it wraps, is a cancellation
    pub fn is_cancelled(&self) -> bool {
        match self {
            PipelineError::Cancelled => true,
            PipelineError::Batch { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }

    /// True for errors that abort a whole batch rather than one file
    pub fn is_batch_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::Aggregation(_)
                | PipelineError::Persistence(_)
                | PipelineError::Repository(_)
                | PipelineError::Cancelled
        )
    }
}

/// Failures while flushing the aggregation buffer
#[derive(Error, Debug)]
pub enum AggregationError {
    #[error("failed to create output directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize batch: {0}")]
    Serialize(#[from] csv::Error),

    #[error("failed to write artifact {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("flush callback failed for {path}: {source:#}")]
    Callback {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },
}
