//! HTTP image fetcher streaming response bodies to disk.
//!
//! Bodies are streamed into a `.part` sibling and renamed into place once
//! complete, so an interrupted transfer never leaves a truncated file under
//! the final name.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, instrument};
use url::Url;

use super::error::DownloadError;
use crate::user_agent;

/// Default HTTP connect timeout for image transfers (30 seconds).
pub const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default HTTP read timeout for image transfers (5 minutes for large files).
pub const READ_TIMEOUT_SECS: u64 = 300;

/// Fetches the bytes behind an image URL into a file.
///
/// This is the only seam through which image bytes reach the filesystem;
/// tests substitute an in-memory implementation.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Writes the content at `source` to `destination`, returning the byte count.
    async fn fetch_to_file(&self, source: &Url, destination: &Path) -> Result<u64, DownloadError>;
}

/// Streaming HTTP implementation of [`ImageFetcher`].
#[derive(Debug, Clone)]
pub struct HttpImageFetcher {
    client: Client,
}

impl HttpImageFetcher {
    /// Creates a fetcher with default timeouts.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the HTTP client cannot be built.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_timeouts(CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS)
    }

    /// Creates a fetcher with explicit timeout values.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Client`] if the HTTP client cannot be built.
    pub fn with_timeouts(
        connect_timeout_secs: u64,
        read_timeout_secs: u64,
    ) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(connect_timeout_secs))
            .timeout(Duration::from_secs(read_timeout_secs))
            .user_agent(user_agent::default_user_agent())
            .gzip(true)
            .build()
            .map_err(|e| DownloadError::Client {
                reason: e.to_string(),
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl ImageFetcher for HttpImageFetcher {
    #[instrument(skip(self), fields(url = %source, path = %destination.display()))]
    async fn fetch_to_file(&self, source: &Url, destination: &Path) -> Result<u64, DownloadError> {
        let response = self
            .client
            .get(source.clone())
            .send()
            .await
            .map_err(|e| DownloadError::network(source.as_str(), e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::http_status(source.as_str(), status.as_u16()));
        }

        let part_path = part_path_for(destination);
        let file = File::create(&part_path)
            .await
            .map_err(|e| DownloadError::io(&part_path, e))?;
        let mut writer = BufWriter::new(file);
        let mut stream = response.bytes_stream();
        let mut written: u64 = 0;

        let streamed: Result<(), DownloadError> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| DownloadError::network(source.as_str(), e))?;
                writer
                    .write_all(&chunk)
                    .await
                    .map_err(|e| DownloadError::io(&part_path, e))?;
                written += chunk.len() as u64;
            }
            writer
                .flush()
                .await
                .map_err(|e| DownloadError::io(&part_path, e))
        }
        .await;

        if let Err(error) = streamed {
            let _ = tokio::fs::remove_file(&part_path).await;
            return Err(error);
        }
        drop(writer);

        tokio::fs::rename(&part_path, destination)
            .await
            .map_err(|e| DownloadError::io(destination, e))?;
        debug!(bytes = written, "Image written");
        Ok(written)
    }
}

fn part_path_for(destination: &Path) -> PathBuf {
    let mut name = destination
        .file_name()
        .map(std::ffi::OsStr::to_os_string)
        .unwrap_or_default();
    name.push(".part");
    destination.with_file_name(name)
}
