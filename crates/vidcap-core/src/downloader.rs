//! Media downloader.
//!
//! Fetches a captured asset to a local file, following redirects up to a
//! fixed hop limit. The destination is written as the body streams in and is
//! removed again if anything fails or the download is cancelled.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::LOCATION;
use reqwest::redirect::Policy;
use reqwest::{StatusCode, Url};
use serde::Serialize;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;

use crate::asset::CapturedAsset;

/// Default number of redirects followed before giving up.
pub const DEFAULT_MAX_REDIRECTS: usize = 5;

/// Default user agent for download requests.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0 Safari/537.36";

/// Download progress callback type (uses Arc for Clone support).
pub type ProgressCallback = Arc<dyn Fn(DownloadProgress) + Send + Sync>;

/// Download progress information.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    /// URL currently being fetched.
    pub url: String,
    /// Bytes written so far.
    pub downloaded: u64,
    /// Total bytes to download (if known).
    pub total: Option<u64>,
    /// Whether the download is complete.
    pub complete: bool,
}

impl DownloadProgress {
    /// Creates a new progress update.
    pub fn new(url: &str, downloaded: u64, total: Option<u64>) -> Self {
        Self {
            url: url.to_string(),
            downloaded,
            total,
            complete: false,
        }
    }

    /// Creates a completion progress.
    pub fn complete(url: &str, downloaded: u64) -> Self {
        Self {
            url: url.to_string(),
            downloaded,
            total: Some(downloaded),
            complete: true,
        }
    }

    /// Returns progress as a percentage (0-100).
    pub fn percentage(&self) -> Option<u8> {
        self.total.map(|t| {
            if t == 0 {
                100
            } else {
                ((self.downloaded as f64 / t as f64) * 100.0).min(100.0) as u8
            }
        })
    }
}

/// Error types for downloading.
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    HttpStatus(StatusCode),

    #[error("Redirect without Location header")]
    MissingLocation,

    #[error("Too many redirects (limit {0})")]
    TooManyRedirects(usize),

    #[error("Download timed out")]
    Timeout,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Downloader settings.
#[derive(Debug, Clone)]
pub struct DownloaderConfig {
    /// Redirect hops followed before failing.
    pub max_redirects: usize,
    /// Deadline for the whole transfer (None = unbounded).
    pub timeout: Option<Duration>,
    /// User agent sent with every request.
    pub user_agent: String,
}

impl Default for DownloaderConfig {
    fn default() -> Self {
        Self {
            max_redirects: DEFAULT_MAX_REDIRECTS,
            timeout: None,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

impl DownloaderConfig {
    /// Sets the redirect limit.
    pub fn with_max_redirects(mut self, max_redirects: usize) -> Self {
        self.max_redirects = max_redirects;
        self
    }

    /// Sets the transfer deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Details of a finished download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Where the body was written.
    pub path: PathBuf,
    /// URL the body was finally served from.
    pub final_url: String,
    /// Bytes written.
    pub bytes: u64,
    /// Redirect hops followed.
    pub redirects: usize,
}

/// Status object returned to callers that do not want a `Result`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DownloadResult {
    /// Whether the file was written.
    pub success: bool,
    /// Error message if failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl DownloadResult {
    fn success() -> Self {
        Self {
            success: true,
            error: None,
        }
    }

    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Downloads URLs to local files.
#[derive(Clone)]
pub struct Downloader {
    client: reqwest::Client,
    config: DownloaderConfig,
    progress: Option<ProgressCallback>,
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl Downloader {
    /// Creates a downloader with default settings.
    pub fn new() -> Result<Self, DownloadError> {
        Self::with_config(DownloaderConfig::default())
    }

    /// Creates a downloader with the given settings.
    pub fn with_config(config: DownloaderConfig) -> Result<Self, DownloadError> {
        // Redirects are followed by hand so the hop limit is ours.
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(Self {
            client,
            config,
            progress: None,
        })
    }

    /// Sets the progress callback.
    pub fn with_progress<F>(mut self, callback: F) -> Self
    where
        F: Fn(DownloadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(callback));
        self
    }

    /// Returns the settings in use.
    pub fn config(&self) -> &DownloaderConfig {
        &self.config
    }

    /// Downloads a captured asset, reporting the outcome as a status object.
    pub async fn download_asset(&self, asset: &CapturedAsset, destination: &Path) -> DownloadResult {
        match self.download(&asset.url, destination).await {
            Ok(outcome) => {
                tracing::info!(
                    "Downloaded {} ({} bytes) to {:?}",
                    asset.title,
                    outcome.bytes,
                    outcome.path
                );
                DownloadResult::success()
            }
            Err(e) => {
                tracing::warn!("Failed to download {}: {}", asset.url, e);
                DownloadResult::failure(e.to_string())
            }
        }
    }

    /// Downloads `url` to `destination`.
    ///
    /// If the transfer fails or the returned future is dropped before it
    /// finishes, the destination file is removed if this call created it.
    pub async fn download(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let transfer = self.fetch_to_file(url, destination);
        match self.config.timeout {
            Some(limit) => tokio::time::timeout(limit, transfer)
                .await
                .unwrap_or(Err(DownloadError::Timeout)),
            None => transfer.await,
        }
    }

    async fn fetch_to_file(
        &self,
        url: &str,
        destination: &Path,
    ) -> Result<DownloadOutcome, DownloadError> {
        let mut current = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        let mut redirects = 0;

        let mut response = loop {
            let response = self
                .client
                .get(current.clone())
                .send()
                .await
                .map_err(|e| DownloadError::Network(e.to_string()))?;

            let status = response.status();
            if !is_followed_redirect(status) {
                break response;
            }

            let location = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or(DownloadError::MissingLocation)?;

            if redirects >= self.config.max_redirects {
                return Err(DownloadError::TooManyRedirects(self.config.max_redirects));
            }
            redirects += 1;

            let next = current
                .join(location)
                .map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
            tracing::debug!("Redirect {} -> {} ({})", current, next, status);
            current = next;
        };

        if !response.status().is_success() {
            return Err(DownloadError::HttpStatus(response.status()));
        }

        if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await?;
        }

        let total = response.content_length();
        let mut file = File::create(destination).await?;
        let partial = PartialFile::new(destination);

        let final_url = current.to_string();
        let mut downloaded = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?
        {
            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            if let Some(ref cb) = self.progress {
                cb(DownloadProgress::new(&final_url, downloaded, total));
            }
        }
        file.flush().await?;
        partial.keep();

        if let Some(ref cb) = self.progress {
            cb(DownloadProgress::complete(&final_url, downloaded));
        }

        Ok(DownloadOutcome {
            path: destination.to_path_buf(),
            final_url,
            bytes: downloaded,
            redirects,
        })
    }
}

/// Removes a file being written unless the write is marked complete.
///
/// Runs on early return and when the owning future is dropped.
struct PartialFile<'a> {
    path: &'a Path,
    keep: bool,
}

impl<'a> PartialFile<'a> {
    fn new(path: &'a Path) -> Self {
        Self { path, keep: false }
    }

    fn keep(mut self) {
        self.keep = true;
    }
}

impl Drop for PartialFile<'_> {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        if let Err(e) = std::fs::remove_file(self.path) {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!("Failed to remove partial file {:?}: {}", self.path, e);
            }
        }
    }
}

fn is_followed_redirect(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::MOVED_PERMANENTLY
            | StatusCode::FOUND
            | StatusCode::SEE_OTHER
            | StatusCode::TEMPORARY_REDIRECT
            | StatusCode::PERMANENT_REDIRECT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicU64, Ordering};

    use http::HeaderMap;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    const BODY: &str = "fake mp4 payload";

    /// Serves a handful of canned responses keyed by request path.
    async fn spawn_origin() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match stream.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let head = String::from_utf8_lossy(&buf);
                    let path = head.split_whitespace().nth(1).unwrap_or("/").to_string();

                    if path == "/stall" {
                        let head = "HTTP/1.1 200 OK\r\nContent-Length: 100000\r\n\r\n13 bytes only";
                        let _ = stream.write_all(head.as_bytes()).await;
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        return;
                    }

                    let response = match path.as_str() {
                        "/final" => format!(
                            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                            BODY.len(),
                            BODY
                        ),
                        "/redirect" => redirect_to("/final"),
                        "/redirect-twice" => redirect_to("/redirect"),
                        "/redirect-to-missing" => redirect_to("/missing"),
                        "/redirect-to-truncated" => redirect_to("/truncated"),
                        "/loop" => redirect_to("/loop"),
                        "/no-location" => {
                            "HTTP/1.1 302 Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                                .to_string()
                        }
                        "/truncated" => "HTTP/1.1 200 OK\r\nContent-Length: 1000\r\nConnection: close\r\n\r\nonly a few bytes".to_string(),
                        _ => "HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                            .to_string(),
                    };
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });

        addr
    }

    fn redirect_to(location: &str) -> String {
        format!(
            "HTTP/1.1 302 Found\r\nLocation: {}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            location
        )
    }

    fn url(addr: SocketAddr, path: &str) -> String {
        format!("http://{}{}", addr, path)
    }

    #[test]
    fn download_progress_percentage() {
        let p = DownloadProgress::new("u", 50, Some(100));
        assert_eq!(p.percentage(), Some(50));

        let p = DownloadProgress::new("u", 0, Some(0));
        assert_eq!(p.percentage(), Some(100));

        let p = DownloadProgress::new("u", 50, None);
        assert_eq!(p.percentage(), None);

        assert!(DownloadProgress::complete("u", 3).complete);
    }

    #[test]
    fn config_defaults() {
        let config = DownloaderConfig::default();
        assert_eq!(config.max_redirects, 5);
        assert!(config.timeout.is_none());

        let config = config
            .with_max_redirects(2)
            .with_timeout(Duration::from_secs(1));
        assert_eq!(config.max_redirects, 2);
        assert_eq!(config.timeout, Some(Duration::from_secs(1)));
    }

    #[tokio::test]
    async fn downloads_plain_response() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("nested").join("clip.mp4");

        let outcome = Downloader::new()
            .unwrap()
            .download(&url(addr, "/final"), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.bytes, BODY.len() as u64);
        assert_eq!(outcome.redirects, 0);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn follows_redirects_to_final_body() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let outcome = Downloader::new()
            .unwrap()
            .download(&url(addr, "/redirect-twice"), &dest)
            .await
            .unwrap();

        assert_eq!(outcome.redirects, 2);
        assert_eq!(outcome.final_url, url(addr, "/final"));
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), BODY);
    }

    #[tokio::test]
    async fn failed_final_fetch_leaves_no_file() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let err = Downloader::new()
            .unwrap()
            .download(&url(addr, "/redirect-to-missing"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::HttpStatus(StatusCode::NOT_FOUND)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn truncated_body_is_cleaned_up() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let result = Downloader::new()
            .unwrap()
            .download(&url(addr, "/redirect-to-truncated"), &dest)
            .await;

        assert!(matches!(result, Err(DownloadError::Network(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn dropped_download_removes_partial_file() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        let downloader = Downloader::new().unwrap();

        let cancelled = tokio::time::timeout(
            Duration::from_millis(500),
            downloader.download(&url(addr, "/stall"), &dest),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn configured_timeout_removes_partial_file() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");
        let config = DownloaderConfig::default().with_timeout(Duration::from_millis(500));

        let err = Downloader::with_config(config)
            .unwrap()
            .download(&url(addr, "/stall"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::Timeout));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn redirect_loop_hits_the_limit() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let err = Downloader::new()
            .unwrap()
            .download(&url(addr, "/loop"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::TooManyRedirects(5)));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn redirect_without_location_fails() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let err = Downloader::new()
            .unwrap()
            .download(&url(addr, "/no-location"), &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::MissingLocation));
    }

    #[tokio::test]
    async fn existing_file_survives_early_failure() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("keep.mp4");
        std::fs::write(&dest, b"existing").unwrap();

        let err = Downloader::new()
            .unwrap()
            .download("not a url", &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, DownloadError::InvalidUrl(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"existing");
    }

    #[tokio::test]
    async fn download_asset_reports_status() {
        let addr = spawn_origin().await;
        let dir = TempDir::new().unwrap();
        let downloaded = Arc::new(AtomicU64::new(0));
        let downloaded_clone = downloaded.clone();

        let downloader = Downloader::new().unwrap().with_progress(move |p| {
            if p.complete {
                downloaded_clone.store(p.downloaded, Ordering::SeqCst);
            }
        });

        let good = CapturedAsset::new(url(addr, "/redirect"), &HeaderMap::new());
        let result = downloader
            .download_asset(&good, &dir.path().join("good.mp4"))
            .await;
        assert_eq!(result, DownloadResult::success());
        assert_eq!(downloaded.load(Ordering::SeqCst), BODY.len() as u64);

        let bad = CapturedAsset::new(url(addr, "/missing"), &HeaderMap::new());
        let result = downloader
            .download_asset(&bad, &dir.path().join("bad.mp4"))
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("404"));
        assert!(!dir.path().join("bad.mp4").exists());
    }
}
