//! Run and file job records

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::PipelineError;

/// Pipeline run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Processing => "processing",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }
}

impl FromStr for RunStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "processing" => Ok(RunStatus::Processing),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            other => Err(PipelineError::Repository(format!(
                "unknown run status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(PipelineError::Repository(format!(
                "unknown file job status: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One execution of a named pipeline for one business date
/// (maps to the pipeline_runs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: Uuid,
    pub pipeline_name: String,
    pub snapshot_date: NaiveDate,
    pub status: RunStatus,
    pub total_files: i32,
    pub processed_files: i32,
    pub total_rows: i64,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl PipelineRun {
    pub fn mark_processing(&mut self) {
        self.status = RunStatus::Processing;
        self.completed_at = None;
        self.error_message = None;
    }

    pub fn mark_completed(&mut self) {
        self.status = RunStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.error_message = None;
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = RunStatus::Failed;
        self.completed_at = Some(Utc::now());
        self.error_message = Some(message.into());
    }

    pub fn is_complete(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

/// Fields needed to open a run
#[derive(Debug, Clone)]
pub struct NewPipelineRun {
    pub pipeline_name: String,
    pub snapshot_date: NaiveDate,
    pub total_files: i32,
}

/// One file's processing record within a run
/// (maps to the pipeline_file_jobs table)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileJob {
    pub id: Uuid,
    pub run_id: Uuid,
    pub file_path: String,
    pub store_id: Option<String>,
    pub status: JobStatus,
    pub error_message: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub retry_count: i32,
}

impl FileJob {
    pub fn mark_queued(&mut self) {
        self.status = JobStatus::Queued;
    }

    pub fn mark_processing(&mut self) {
        self.status = JobStatus::Processing;
    }

    pub fn mark_completed(&mut self) {
        self.status = JobStatus::Completed;
        self.error_message = None;
        self.processed_at = Some(Utc::now());
    }

    /// Record a failure; the retry count only ever grows here
    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(message.into());
        self.processed_at = Some(Utc::now());
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// Whether a retry pass capped at `retry_attempts` may pick this job up
    pub fn is_retryable(&self, retry_attempts: u32) -> bool {
        self.status == JobStatus::Failed && i64::from(self.retry_count) < i64::from(retry_attempts)
    }
}

/// Aggregate run statistics for one pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineMetrics {
    pub pipeline_name: String,
    pub total_runs: i64,
    pub completed_runs: i64,
    pub failed_runs: i64,
    pub total_rows: i64,
    pub last_completed_at: Option<DateTime<Utc>>,
}
