use std::{
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use tokio::{fs, io::AsyncWriteExt};
use tracing::{info, warn};

use crate::error::{CacheError, Result};

pub const SOURCE_FILE_NAME: &str = "systems_populated.json";

pub trait BulkSource: Send + Sync + 'static {
    fn fetch(&self, dest: &Path) -> impl Future<Output = Result<u64>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpBulkSource {
    client: reqwest::Client,
    url: String,
}

impl HttpBulkSource {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("ed-systems-cache/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed building HTTP client for bulk downloads")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn stream_to(&self, part_path: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|err| CacheError::refresh_failed(format!("GET {}: {err}", self.url)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(CacheError::refresh_failed(format!(
                "GET {} returned {status}",
                self.url
            )));
        }

        let mut file = fs::File::create(part_path)
            .await
            .map_err(|err| io_failure(part_path, err))?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| CacheError::refresh_failed(format!("reading {}: {err}", self.url)))?
        {
            file.write_all(&chunk)
                .await
                .map_err(|err| io_failure(part_path, err))?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(|err| io_failure(part_path, err))?;
        file.sync_all().await.map_err(|err| io_failure(part_path, err))?;

        Ok(written)
    }

    async fn download_to(&self, part_path: &Path, dest: &Path) -> Result<u64> {
        let size_bytes = self.stream_to(part_path).await?;
        fs::rename(part_path, dest)
            .await
            .map_err(|err| io_failure(dest, err))?;
        Ok(size_bytes)
    }
}

impl BulkSource for HttpBulkSource {
    async fn fetch(&self, dest: &Path) -> Result<u64> {
        ensure_parent_dir(dest).await?;
        let part_path = part_path_for(dest);

        info!(url = %self.url, dest = %dest.display(), "Downloading bulk systems file");
        match self.download_to(&part_path, dest).await {
            Ok(size_bytes) => {
                info!(dest = %dest.display(), size_bytes, "Bulk systems file downloaded");
                Ok(size_bytes)
            }
            Err(err) => {
                if let Err(cleanup) = delete_file_if_exists(&part_path).await {
                    warn!("Failed removing partial download: {cleanup:#}");
                }
                Err(err)
            }
        }
    }
}

pub fn part_path_for(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| SOURCE_FILE_NAME.into());
    name.push(".part");
    dest.with_file_name(name)
}

pub async fn ensure_data_dir(path: &Path) -> anyhow::Result<()> {
    fs::create_dir_all(path)
        .await
        .with_context(|| format!("Failed to create data directory at {}", path.display()))
}

async fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .map_err(|err| io_failure(parent, err))?;
    }
    Ok(())
}

pub async fn delete_file_if_exists(path: &Path) -> anyhow::Result<()> {
    match fs::remove_file(path).await {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

fn io_failure(path: &Path, err: std::io::Error) -> CacheError {
    CacheError::refresh_failed(format!("{}: {err}", path.display()))
}
