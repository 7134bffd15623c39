//! Streaming aggregator
//!
//! Buffers transformed rows from many files of one (pipeline, date) run and
//! flushes them as a single delimited artifact once a file count, byte
//! estimate or elapsed time threshold is crossed. All state lives behind one
//! async mutex; an add and the flush it triggers happen under the same lock
//! acquisition.
//!
//! A failed flush keeps the buffer intact. The next flush rewrites the
//! artifact with everything still buffered, so a transient downstream
//! failure never silently drops rows.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::error::{AggregationError, PipelineError, Result};
use crate::pipeline::TransformedRow;

/// Rough serialized size attributed to every buffered field.
pub const ESTIMATED_BYTES_PER_FIELD: u64 = 100;

/// Invoked with the artifact path after every successful artifact write
#[async_trait]
pub trait FlushCallback: Send + Sync {
    async fn on_flush(&self, cancel: &CancellationToken, artifact_path: &Path)
        -> anyhow::Result<()>;
}

/// Callback that accepts every artifact without loading it anywhere
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopFlush;

#[async_trait]
impl FlushCallback for NoopFlush {
    async fn on_flush(
        &self,
        _cancel: &CancellationToken,
        artifact_path: &Path,
    ) -> anyhow::Result<()> {
        debug!(artifact = %artifact_path.display(), "Skipping load");
        Ok(())
    }
}

/// Snapshot of the aggregator buffer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub files: usize,
    pub rows: usize,
    pub estimated_bytes: u64,
}

struct AggregatorState {
    buffer: Vec<Vec<TransformedRow>>,
    estimated_bytes: u64,
    last_flush: Instant,
}

pub struct StreamingAggregator {
    pipeline_name: String,
    snapshot_date: NaiveDate,
    batch_size: usize,
    batch_size_bytes: u64,
    flush_interval: Duration,
    artifact_path: PathBuf,
    callback: Arc<dyn FlushCallback>,
    state: Mutex<AggregatorState>,
    flushes: AtomicUsize,
    rows_flushed: AtomicU64,
}

impl StreamingAggregator {
    pub fn new(
        config: &PipelineConfig,
        snapshot_date: NaiveDate,
        callback: Arc<dyn FlushCallback>,
    ) -> Self {
        let artifact_path = artifact_path(&config.output_dir, snapshot_date);
        Self {
            pipeline_name: config.name.clone(),
            snapshot_date,
            batch_size: config.batch_size,
            batch_size_bytes: config.batch_size_bytes,
            flush_interval: config.flush_interval,
            artifact_path,
            callback,
            state: Mutex::new(AggregatorState {
                buffer: Vec::new(),
                estimated_bytes: 0,
                last_flush: Instant::now(),
            }),
            flushes: AtomicUsize::new(0),
            rows_flushed: AtomicU64::new(0),
        }
    }

    pub fn snapshot_date(&self) -> NaiveDate {
        self.snapshot_date
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }

    /// Buffer one file's rows, flushing synchronously when a threshold is met
    pub async fn add_file_data(
        &self,
        cancel: &CancellationToken,
        rows: Vec<TransformedRow>,
    ) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        let mut state = self.state.lock().await;

        let fields: u64 = rows.iter().map(|row| row.len() as u64).sum();
        state.estimated_bytes = state
            .estimated_bytes
            .saturating_add(fields.saturating_mul(ESTIMATED_BYTES_PER_FIELD));
        state.buffer.push(rows);
        debug!(
            pipeline = %self.pipeline_name,
            date = %self.snapshot_date,
            buffered_files = state.buffer.len(),
            estimated_bytes = state.estimated_bytes,
            "Buffered file rows"
        );

        if self.should_flush(&state) {
            self.flush_locked(cancel, &mut state).await?;
        }

        Ok(())
    }

    /// Flush whatever is still buffered; a no-op on an empty buffer
    pub async fn finalize(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.buffer.is_empty() {
            debug!(
                pipeline = %self.pipeline_name,
                date = %self.snapshot_date,
                "Nothing left to flush"
            );
            return Ok(());
        }
        self.flush_locked(cancel, &mut state).await?;
        Ok(())
    }

    pub async fn buffer_stats(&self) -> BufferStats {
        let state = self.state.lock().await;
        BufferStats {
            files: state.buffer.len(),
            rows: state.buffer.iter().map(Vec::len).sum(),
            estimated_bytes: state.estimated_bytes,
        }
    }

    /// Number of successful flushes so far
    pub fn flush_count(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    /// Rows handed to the callback across all successful flushes
    pub fn rows_flushed(&self) -> u64 {
        self.rows_flushed.load(Ordering::SeqCst)
    }

    fn should_flush(&self, state: &AggregatorState) -> bool {
        state.buffer.len() >= self.batch_size
            || state.estimated_bytes >= self.batch_size_bytes
            || state.last_flush.elapsed() >= self.flush_interval
    }

    async fn flush_locked(
        &self,
        cancel: &CancellationToken,
        state: &mut AggregatorState,
    ) -> std::result::Result<(), AggregationError> {
        let row_count: usize = state.buffer.iter().map(Vec::len).sum();
        if row_count == 0 {
            // Files that produced no rows leave nothing to write.
            state.buffer.clear();
            state.estimated_bytes = 0;
            state.last_flush = Instant::now();
            return Ok(());
        }

        let bytes = encode_rows(state.buffer.iter().flatten()).map_err(|source| match source {
            EncodeError::Csv(e) => AggregationError::Serialize(e),
            EncodeError::Io(e) => AggregationError::Write {
                path: self.artifact_path.clone(),
                source: e,
            },
        })?;

        if let Some(dir) = self.artifact_path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| AggregationError::CreateDir {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }

        tokio::fs::write(&self.artifact_path, &bytes)
            .await
            .map_err(|source| AggregationError::Write {
                path: self.artifact_path.clone(),
                source,
            })?;

        if let Err(source) = self.callback.on_flush(cancel, &self.artifact_path).await {
            warn!(
                pipeline = %self.pipeline_name,
                date = %self.snapshot_date,
                artifact = %self.artifact_path.display(),
                buffered_rows = row_count,
                error = format!("{:#}", source),
                "Flush callback failed, keeping buffer"
            );
            return Err(AggregationError::Callback {
                path: self.artifact_path.clone(),
                source,
            });
        }

        let flushed_files = state.buffer.len();
        let flushed_bytes = state.estimated_bytes;
        state.buffer.clear();
        state.estimated_bytes = 0;
        state.last_flush = Instant::now();
        self.flushes.fetch_add(1, Ordering::SeqCst);
        self.rows_flushed.fetch_add(row_count as u64, Ordering::SeqCst);

        info!(
            pipeline = %self.pipeline_name,
            date = %self.snapshot_date,
            artifact = %self.artifact_path.display(),
            rows = row_count,
            files = flushed_files,
            estimated_bytes = flushed_bytes,
            "Flushed buffer"
        );
        Ok(())
    }
}

/// Artifact location for one business date
pub fn artifact_path(output_dir: &Path, snapshot_date: NaiveDate) -> PathBuf {
    output_dir.join(format!("{}.csv", snapshot_date.format("%Y%m%d")))
}

enum EncodeError {
    Csv(csv::Error),
    Io(std::io::Error),
}

/// Header from the first row's columns, then every row projected onto it
fn encode_rows<'a, I>(rows: I) -> std::result::Result<Vec<u8>, EncodeError>
where
    I: IntoIterator<Item = &'a TransformedRow>,
{
    let mut rows = rows.into_iter().peekable();
    let headers: Vec<String> = match rows.peek() {
        Some(first) => first.columns().map(str::to_string).collect(),
        None => return Ok(Vec::new()),
    };

    let mut buf = Vec::new();
    {
        let mut writer = csv::Writer::from_writer(&mut buf);
        writer.write_record(&headers).map_err(EncodeError::Csv)?;
        for row in rows {
            writer
                .write_record(headers.iter().map(|column| {
                    row.get(column)
                        .map(|value| value.to_string())
                        .unwrap_or_default()
                }))
                .map_err(EncodeError::Csv)?;
        }
        writer.flush().map_err(EncodeError::Io)?;
    }
    Ok(buf)
}
