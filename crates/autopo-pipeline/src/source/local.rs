//! Local filesystem file source
//!
//! Folder and file ids are paths relative to the source root; the empty id
//! is the root itself.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use tokio::io::AsyncWrite;

use super::{FileSource, RemoteFile};

#[derive(Debug, Clone)]
pub struct LocalFileSource {
    root: PathBuf,
}

impl LocalFileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, id: &str) -> Result<PathBuf> {
        let relative = Path::new(id);
        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            bail!("invalid file id {:?}", id);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl FileSource for LocalFileSource {
    async fn list_files(&self, folder_id: &str) -> Result<Vec<RemoteFile>> {
        let dir = self.resolve(folder_id)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .with_context(|| format!("failed to list {}", dir.display()))?;

        let mut files = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let metadata = entry.metadata().await?;
            let id = if folder_id.is_empty() {
                name.clone()
            } else {
                format!("{}/{}", folder_id.trim_end_matches('/'), name)
            };
            files.push(RemoteFile {
                id,
                name,
                size: metadata.len(),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                is_folder: metadata.is_dir(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    async fn download(
        &self,
        file: &RemoteFile,
        sink: &mut (dyn AsyncWrite + Unpin + Send),
    ) -> Result<u64> {
        let path = self.resolve(&file.id)?;
        let mut input = tokio::fs::File::open(&path)
            .await
            .with_context(|| format!("failed to open {}", path.display()))?;
        let bytes = tokio::io::copy(&mut input, sink).await?;
        Ok(bytes)
    }
}
