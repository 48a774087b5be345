//! Vidcap Core - media matching, capture registry and downloads.
//!
//! This crate holds the pieces of vidcap that do not touch sockets:
//!
//! - [`matcher`]: decides whether a URL or host looks like a media asset
//! - [`asset`]: the [`CapturedAsset`] record and its title/quality inference
//! - [`registry`]: the per-proxy [`CaptureRegistry`] with change observers
//! - [`downloader`]: saves a captured asset to disk, following redirects

pub mod asset;
pub mod downloader;
pub mod matcher;
pub mod registry;

pub use asset::{url_hash, CapturedAsset, DEFAULT_CONTENT_TYPE, UNKNOWN_QUALITY};
pub use downloader::{
    DownloadError, DownloadOutcome, DownloadProgress, DownloadResult, Downloader,
    DownloaderConfig, ProgressCallback,
};
pub use matcher::{is_capturable, is_likely_media_domain, is_likely_media_url};
pub use registry::{CaptureRegistry, ChangeCallback};
