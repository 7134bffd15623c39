//! Date-grouping orchestrator
//!
//! Turns a flat file list into one worker batch per business date. Dates run
//! sequentially in ascending order; concurrency stays inside a batch. A
//! failing date stops the run, and dates processed before it stay committed.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::error::{PipelineError, Result};
use crate::repository::PipelineRun;
use crate::worker::Worker;

/// Runs produced by one orchestrator invocation
#[derive(Debug, Clone, Default)]
pub struct OrchestratorReport {
    pub dates: Vec<NaiveDate>,
    pub runs: Vec<PipelineRun>,
}

impl OrchestratorReport {
    pub fn total_rows(&self) -> i64 {
        self.runs.iter().map(|run| run.total_rows).sum()
    }
}

pub struct Orchestrator {
    worker: Arc<Worker>,
}

impl Orchestrator {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self { worker }
    }

    pub fn worker(&self) -> &Worker {
        &self.worker
    }

    /// Group files by the business date their names encode
    ///
    /// Fails on the first file whose name carries no recognizable date.
    pub fn group_by_date(&self, files: &[PathBuf]) -> Result<BTreeMap<NaiveDate, Vec<PathBuf>>> {
        let pipeline = self.worker.pipeline();
        let mut by_date: BTreeMap<NaiveDate, Vec<PathBuf>> = BTreeMap::new();

        for file in files {
            let name = file_name(file);
            let date = pipeline
                .snapshot_date(&name)
                .map_err(|source| PipelineError::SnapshotDate {
                    file: file.display().to_string(),
                    source,
                })?;
            by_date.entry(date).or_default().push(file.clone());
        }

        Ok(by_date)
    }

    pub async fn run(
        &self,
        cancel: &CancellationToken,
        files: &[PathBuf],
    ) -> Result<OrchestratorReport> {
        let mut report = OrchestratorReport::default();
        if files.is_empty() {
            info!(pipeline = %self.worker.pipeline().name(), "No files to process");
            return Ok(report);
        }

        let by_date = self.group_by_date(files)?;
        report.dates = by_date.keys().copied().collect();
        info!(
            pipeline = %self.worker.pipeline().name(),
            files = files.len(),
            dates = by_date.len(),
            "Processing files by snapshot date"
        );

        for (date, batch) in by_date {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }

            match self.worker.process_batch(cancel, date, &batch).await {
                Ok(run) => report.runs.push(run),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    error!(date = %date, error = %e, "Batch failed, stopping");
                    return Err(PipelineError::Batch {
                        date,
                        source: Box::new(e),
                    });
                },
            }
        }

        Ok(report)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
