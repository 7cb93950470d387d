//! Bootstrap payload preparation
//!
//! The injector copies an agent binary into every eligible container. The
//! binary is prepared once at startup, either from a local path or by
//! downloading it from the control plane's access URL.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Bootstrap payload not found at {0}")]
    Missing(PathBuf),

    #[error("Failed to download bootstrap payload: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BootstrapSource: Send + Sync {
    /// Make the payload available locally and return its path
    async fn prepare(&self) -> Result<PathBuf, BootstrapError>;
}

/// Architecture suffix used in published binary names
pub fn release_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "arm" => "armv7",
        other => other,
    }
}

/// URL of the agent binary for this architecture under `access_url`
pub fn download_url(access_url: &str, arch: &str) -> String {
    let base = access_url.trim_end_matches('/');
    format!("{}/bin/agentlink-linux-{}", base, arch)
}

/// Payload already present on disk
#[derive(Debug, Clone)]
pub struct FileBootstrap {
    path: PathBuf,
}

impl FileBootstrap {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl BootstrapSource for FileBootstrap {
    async fn prepare(&self) -> Result<PathBuf, BootstrapError> {
        match tokio::fs::metadata(&self.path).await {
            Ok(meta) if meta.is_file() => Ok(self.path.clone()),
            _ => Err(BootstrapError::Missing(self.path.clone())),
        }
    }
}

/// Payload downloaded over HTTP into a local cache file
#[derive(Debug, Clone)]
pub struct DownloadBootstrap {
    url: String,
    cache_path: PathBuf,
    client: reqwest::Client,
}

impl DownloadBootstrap {
    pub fn new(url: impl Into<String>, cache_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            cache_path: cache_path.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Download the binary matching this host's architecture
    pub fn for_access_url(access_url: &str, cache_path: impl Into<PathBuf>) -> Self {
        Self::new(download_url(access_url, release_arch()), cache_path)
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl BootstrapSource for DownloadBootstrap {
    async fn prepare(&self) -> Result<PathBuf, BootstrapError> {
        info!(url = %self.url, "Downloading agent bootstrap payload");

        let bytes = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;

        if let Some(parent) = self.cache_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&self.cache_path, &bytes).await?;
        make_executable(&self.cache_path).await?;

        info!(
            path = %self.cache_path.display(),
            size = bytes.len(),
            "Bootstrap payload ready"
        );
        Ok(self.cache_path.clone())
    }
}

#[cfg(unix)]
async fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}
