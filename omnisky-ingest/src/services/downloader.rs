//! Artifact downloader
//!
//! The pipeline only knows the `Downloader` trait; `HttpDownloader` is the
//! production implementation. Content is hashed while it is written, so no
//! second pass over the file is needed for deduplication.

use super::dedup::StreamingHasher;
use crate::models::Target;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const USER_AGENT: &str = concat!("OmniSky/", env!("CARGO_PKG_VERSION"));

/// Downloader errors
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Download timed out: {0}")]
    Timeout(String),

    #[error("HTTP {status} for {url}")]
    HttpStatus { status: u16, url: String },

    #[error("File too large: more than {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Downloader panicked: {0}")]
    Panicked(String),
}

impl DownloadError {
    /// Whether a later attempt may succeed
    ///
    /// Network failures, timeouts, 429 and 5xx responses are transient;
    /// 4xx responses, size limits and local I/O errors are not.
    pub fn is_transient(&self) -> bool {
        match self {
            DownloadError::Network(_) | DownloadError::Timeout(_) => true,
            DownloadError::HttpStatus { status, .. } => *status == 429 || *status >= 500,
            DownloadError::TooLarge { .. } | DownloadError::Io(_) | DownloadError::Panicked(_) => false,
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            DownloadError::Timeout(err.to_string())
        } else {
            DownloadError::Network(err.to_string())
        }
    }
}

/// A file fully written to its destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub size_bytes: u64,
}

/// Fetches a target's bytes to `dest`
///
/// On error the implementation must not leave a partial file at `dest`.
#[async_trait]
pub trait Downloader: Send + Sync {
    async fn fetch(&self, target: &Target, dest: &Path) -> Result<DownloadedFile, DownloadError>;
}

/// Streaming HTTP(S) downloader
pub struct HttpDownloader {
    http_client: reqwest::Client,
    max_bytes: Option<u64>,
}

impl HttpDownloader {
    pub fn new(timeout: Duration, max_bytes: Option<u64>) -> Result<Self, DownloadError> {
        let http_client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(timeout)
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(Self {
            http_client,
            max_bytes,
        })
    }

    async fn stream_to(&self, target: &Target, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        let mut response = self.http_client.get(&target.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                status: status.as_u16(),
                url: target.url.clone(),
            });
        }

        if let (Some(limit), Some(length)) = (self.max_bytes, response.content_length()) {
            if length > limit {
                return Err(DownloadError::TooLarge { limit });
            }
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut hasher = StreamingHasher::new();

        while let Some(chunk) = response.chunk().await? {
            if let Some(limit) = self.max_bytes {
                if hasher.bytes() + chunk.len() as u64 > limit {
                    return Err(DownloadError::TooLarge { limit });
                }
            }
            file.write_all(&chunk).await?;
            hasher.update(&chunk);
        }

        file.flush().await?;
        file.sync_all().await?;

        let (content_hash, size_bytes) = hasher.finalize();

        tracing::debug!(
            url = %target.url,
            path = %dest.display(),
            size_bytes,
            "Download complete"
        );

        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            content_hash,
            size_bytes,
        })
    }
}

#[async_trait]
impl Downloader for HttpDownloader {
    async fn fetch(&self, target: &Target, dest: &Path) -> Result<DownloadedFile, DownloadError> {
        let result = self.stream_to(target, dest).await;

        if result.is_err() {
            match tokio::fs::remove_file(dest).await {
                Ok(()) => tracing::debug!(path = %dest.display(), "Removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %dest.display(),
                    error = %e,
                    "Failed to remove partial download"
                ),
            }
        }

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ArtifactKind;
    use crate::services::dedup::content_hash;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response per connection
    async fn serve(status_line: &'static str, body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let body = body.clone();
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let header = format!(
                        "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        status_line,
                        body.len()
                    );
                    let _ = socket.write_all(header.as_bytes()).await;
                    let _ = socket.write_all(&body).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        format!("http://{}/data/sample.h5", addr)
    }

    #[tokio::test]
    async fn test_fetch_streams_and_hashes() {
        let body: Vec<u8> = (0..50_000u32).map(|i| (i % 256) as u8).collect();
        let url = serve("200 OK", body.clone()).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sample.h5");

        let downloader = HttpDownloader::new(Duration::from_secs(5), None).unwrap();
        let file = downloader
            .fetch(&Target::new(url, ArtifactKind::Radio), &dest)
            .await
            .unwrap();

        assert_eq!(file.size_bytes, body.len() as u64);
        assert_eq!(file.content_hash, content_hash(&body));
        assert_eq!(std::fs::read(&dest).unwrap(), body);
    }

    #[tokio::test]
    async fn test_http_error_leaves_no_file() {
        let url = serve("404 Not Found", b"missing".to_vec()).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sample.h5");

        let downloader = HttpDownloader::new(Duration::from_secs(5), None).unwrap();
        let err = downloader
            .fetch(&Target::new(url, ArtifactKind::Radio), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::HttpStatus { status: 404, .. }));
        assert!(!err.is_transient());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_size_limit_removes_partial_file() {
        let url = serve("200 OK", vec![7u8; 4096]).await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("sample.h5");

        let downloader = HttpDownloader::new(Duration::from_secs(5), Some(1024)).unwrap();
        let err = downloader
            .fetch(&Target::new(url, ArtifactKind::Radio), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::TooLarge { limit: 1024 }));
        assert!(!dest.exists());
    }

    #[test]
    fn test_transient_classification() {
        assert!(DownloadError::Network("reset".into()).is_transient());
        assert!(DownloadError::HttpStatus { status: 503, url: "u".into() }.is_transient());
        assert!(DownloadError::HttpStatus { status: 429, url: "u".into() }.is_transient());
        assert!(!DownloadError::HttpStatus { status: 403, url: "u".into() }.is_transient());
    }
}
