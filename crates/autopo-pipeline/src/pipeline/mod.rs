//! Pipeline contract
//!
//! One implementation per data type. The worker, aggregator and orchestrator
//! only ever see `dyn Pipeline`, so a new data type is added by implementing
//! this trait and nothing else.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::fmt::Write as _;
use std::path::Path;
use tokio_util::sync::CancellationToken;

pub mod csv_snapshot;
pub mod row;

pub use csv_snapshot::CsvSnapshotPipeline;
pub use row::{FieldValue, TransformedRow};

/// Filename date layout used when a pipeline does not configure its own.
pub const DEFAULT_DATE_LAYOUT: &str = "%Y%m%d";

/// A pluggable unit of work for one data type
#[async_trait]
pub trait Pipeline: Send + Sync {
    /// Stable identifier used for run keys, logging and output paths
    fn name(&self) -> &str;

    /// Structural check on one input file
    ///
    /// Must not mutate any state and runs before any transform work.
    async fn validate(&self, path: &Path) -> Result<()>;

    /// Parse one file into rows
    ///
    /// Either the complete row set for the file or an error; never a partial
    /// result.
    async fn transform(
        &self,
        cancel: &CancellationToken,
        path: &Path,
    ) -> Result<Vec<TransformedRow>>;

    /// Target dataset identifier for downstream consumers
    fn output_table(&self) -> &str;

    /// Business date encoded in `filename`, derived without any I/O
    fn snapshot_date(&self, filename: &str) -> Result<NaiveDate>;
}

/// Derive a date from the leading characters of a file stem
///
/// The number of characters inspected is the rendered width of `layout`, so
/// `20240105_stock.csv` with `%Y%m%d` yields 2024-01-05.
pub fn parse_filename_date(filename: &str, layout: &str) -> Result<NaiveDate> {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or(filename);
    let stem = Path::new(base)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(base);

    let width = layout_width(layout)?;
    let prefix = match stem.get(..width) {
        Some(prefix) => prefix,
        None => bail!(
            "filename {:?} is shorter than date layout {:?}",
            filename,
            layout
        ),
    };

    NaiveDate::parse_from_str(prefix, layout)
        .with_context(|| format!("filename {:?} does not start with a {} date", filename, layout))
}

fn layout_width(layout: &str) -> Result<usize> {
    let reference = NaiveDate::from_ymd_opt(2006, 1, 2).context("invalid reference date")?;
    let mut rendered = String::new();
    write!(rendered, "{}", reference.format(layout))
        .map_err(|_| anyhow::anyhow!("invalid date layout {:?}", layout))?;
    if rendered.is_empty() {
        bail!("date layout must not be empty");
    }
    Ok(rendered.len())
}
