//! File source abstraction
//!
//! The pipeline only needs names (for date derivation) and byte streams, so
//! any store that can list a folder and stream a file plugs in here.
//!
//! Drops are laid out as date-named folders (`20240105/`), each with an
//! `input/` subfolder holding the per-store files. [`fetch_folder`] pulls
//! those into one flat local directory as `<date>_<file name>` so the
//! pipeline can read the business date back from the name. Spreadsheets are
//! converted to `<date>_<file stem>.csv` on the way in.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pipeline::{parse_filename_date, DEFAULT_DATE_LAYOUT};

pub mod local;
pub mod xlsx;

pub use local::LocalFileSource;
pub use xlsx::convert_xlsx_to_csv;

/// Name of the per-date subfolder that holds input files.
pub const INPUT_FOLDER: &str = "input";

/// A listed entry in a file store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    /// Store-specific handle, passed back to `list_files`/`download`
    pub id: String,
    pub name: String,
    pub size: u64,
    pub modified_at: Option<DateTime<Utc>>,
    pub is_folder: bool,
}

#[async_trait]
pub trait FileSource: Send + Sync {
    /// Entries directly inside `folder_id`
    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>>;

    /// Stream a file's bytes into `sink`, returning the number of bytes copied
    async fn download(
        &self,
        file: &RemoteFile,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64>;
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Layout of the date folder names
    pub date_layout: String,
    /// Only fetch folders whose name starts with this date
    pub snapshot_date: Option<NaiveDate>,
    /// Lower-case extensions without the dot; empty accepts everything
    pub extensions: Vec<String>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            date_layout: DEFAULT_DATE_LAYOUT.to_string(),
            snapshot_date: None,
            extensions: vec!["csv".to_string(), xlsx::XLSX_EXTENSION.to_string()],
        }
    }
}

impl FetchOptions {
    fn accepts_extension(&self, name: &str) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        let ext = Path::new(name)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();
        self.extensions.iter().any(|allowed| *allowed == ext)
    }

    /// Whether a folder name starts with a date, and the wanted one if set
    fn wants_folder(&self, folder_name: &str) -> bool {
        match parse_filename_date(folder_name.trim(), &self.date_layout) {
            Ok(date) => self.snapshot_date.map_or(true, |wanted| wanted == date),
            Err(_) => false,
        }
    }
}

/// Download every wanted input file under `root_folder_id` into `download_dir`
///
/// Files already present locally with the same size and a modification time
/// no older than the remote one are reused. Returns the local paths sorted by
/// name.
pub async fn fetch_folder(
    source: &dyn FileSource,
    cancel: &CancellationToken,
    root_folder_id: &str,
    download_dir: &Path,
    options: &FetchOptions,
) -> Result<Vec<PathBuf>> {
    if download_dir.as_os_str().is_empty() {
        bail!("download dir is required");
    }
    tokio::fs::create_dir_all(download_dir)
        .await
        .with_context(|| format!("failed to create download dir {}", download_dir.display()))?;

    let mut local_paths = Vec::new();
    let mut downloaded = 0usize;

    for folder in source.list_files(root_folder_id).await? {
        if !folder.is_folder {
            continue;
        }
        if !options.wants_folder(&folder.name) {
            continue;
        }
        let date_prefix = folder.name.trim();

        let children = source
            .list_files(&folder.id)
            .await
            .with_context(|| format!("failed to list date folder {}", folder.name))?;
        let Some(input) = children
            .iter()
            .find(|child| child.is_folder && child.name.trim().eq_ignore_ascii_case(INPUT_FOLDER))
        else {
            debug!(folder = %folder.name, "Date folder has no input folder, skipping");
            continue;
        };

        let files = source
            .list_files(&input.id)
            .await
            .with_context(|| format!("failed to list input folder for {}", folder.name))?;

        for file in files {
            if cancel.is_cancelled() {
                bail!("download cancelled");
            }
            if file.is_folder || !options.accepts_extension(&file.name) {
                continue;
            }

            let fetched = if xlsx::is_xlsx(&file.name) {
                fetch_xlsx(source, &file, download_dir, date_prefix).await?
            } else {
                fetch_file(source, &file, download_dir, date_prefix).await?
            };
            if fetched.downloaded {
                downloaded += 1;
            }
            local_paths.push(fetched.path);
        }
    }

    local_paths.sort();
    info!(
        download_dir = %download_dir.display(),
        files = local_paths.len(),
        downloaded = downloaded,
        "Fetched input files"
    );
    Ok(local_paths)
}

struct Fetched {
    path: PathBuf,
    downloaded: bool,
}

async fn fetch_file(
    source: &dyn FileSource,
    file: &RemoteFile,
    download_dir: &Path,
    date_prefix: &str,
) -> Result<Fetched> {
    let path = download_dir.join(format!("{}_{}", date_prefix, file.name));
    if is_current(&path, file, Some(file.size)).await {
        debug!(file = %path.display(), "Reusing local copy");
        return Ok(Fetched {
            path,
            downloaded: false,
        });
    }
    download_to(source, file, &path).await?;
    Ok(Fetched {
        path,
        downloaded: true,
    })
}

/// Download a spreadsheet and keep only its first sheet as CSV
async fn fetch_xlsx(
    source: &dyn FileSource,
    file: &RemoteFile,
    download_dir: &Path,
    date_prefix: &str,
) -> Result<Fetched> {
    let stem = Path::new(&file.name)
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_else(|| file.name.clone());
    let csv_path = download_dir.join(format!("{}_{}.csv", date_prefix, stem));
    // Converted size never matches the workbook, so only freshness counts.
    if file.modified_at.is_some() && is_current(&csv_path, file, None).await {
        debug!(file = %csv_path.display(), "Reusing converted spreadsheet");
        return Ok(Fetched {
            path: csv_path,
            downloaded: false,
        });
    }

    let workbook_path = download_dir.join(format!("{}_{}", date_prefix, file.name));
    download_to(source, file, &workbook_path).await?;

    let partial = csv_path.with_extension("csv.part");
    let converted =
        xlsx::convert_xlsx_to_csv_async(workbook_path.clone(), partial.clone()).await;
    if let Err(e) = tokio::fs::remove_file(&workbook_path).await {
        warn!(file = %workbook_path.display(), error = %e, "Could not remove downloaded spreadsheet");
    }
    let rows = match converted {
        Ok(rows) => rows,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e.context(format!("failed to convert {}", file.name)));
        },
    };
    tokio::fs::rename(&partial, &csv_path)
        .await
        .with_context(|| format!("failed to move converted file into {}", csv_path.display()))?;

    debug!(file = %file.name, csv = %csv_path.display(), rows = rows, "Converted spreadsheet");
    Ok(Fetched {
        path: csv_path,
        downloaded: true,
    })
}

/// Whether a local copy can stand in for `file`
///
/// The size must match when given, and the local copy must be at least as
/// new as the remote modification time when the store reports one.
async fn is_current(path: &Path, file: &RemoteFile, size: Option<u64>) -> bool {
    let Ok(metadata) = tokio::fs::metadata(path).await else {
        return false;
    };
    if !metadata.is_file() || size.is_some_and(|size| metadata.len() != size) {
        return false;
    }
    match (file.modified_at, metadata.modified()) {
        (None, _) => true,
        (Some(remote), Ok(local)) => DateTime::<Utc>::from(local) >= remote,
        (Some(_), Err(_)) => false,
    }
}

/// Download through a temporary file so a partial copy never looks current
async fn download_to(source: &dyn FileSource, file: &RemoteFile, path: &Path) -> Result<()> {
    let partial = path.with_extension("part");
    let mut out = tokio::fs::File::create(&partial)
        .await
        .with_context(|| format!("failed to create {}", partial.display()))?;

    let result = match source.download(file, &mut out).await {
        Ok(bytes) => out.flush().await.map(|_| bytes).map_err(anyhow::Error::from),
        Err(e) => Err(e),
    };
    drop(out);
    match result {
        Ok(bytes) => {
            tokio::fs::rename(&partial, path)
                .await
                .with_context(|| format!("failed to move download into {}", path.display()))?;
            debug!(file = %file.name, bytes = bytes, "Downloaded file");
            Ok(())
        },
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            Err(e.context(format!("failed to download {}", file.name)))
        },
    }
}
