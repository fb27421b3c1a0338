//! HTTP fetcher with an optional on-disk cache

use crate::{Error, Result};
use reqwest::header::HeaderMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

const FETCH_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Fetcher {
    url: String,
    path: Option<PathBuf>,
    interval: Duration,
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new(url: String, path: Option<PathBuf>, interval: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .user_agent(concat!("nico/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Fetcher {
            url,
            path,
            interval,
            client,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Refresh interval; zero means fetch once
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn cache_path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Download the document, writing it to the cache on success
    pub async fn fetch(&self) -> Result<(Vec<u8>, HeaderMap)> {
        let resp = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?;

        let headers = resp.headers().clone();
        let content = resp.bytes().await?;
        debug!("fetched {} bytes from {}", content.len(), self.url);

        if let Some(path) = &self.path {
            if let Err(e) = tokio::fs::write(path, &content).await {
                warn!("Failed to cache {}: {}", path.display(), e);
            }
        }

        Ok((content.to_vec(), headers))
    }

    /// Content of the last successful fetch
    pub async fn load_cache(&self) -> Result<Vec<u8>> {
        let path = self
            .path
            .as_ref()
            .ok_or_else(|| Error::config(format!("no cache path for {}", self.url)))?;
        Ok(tokio::fs::read(path).await?)
    }
}
