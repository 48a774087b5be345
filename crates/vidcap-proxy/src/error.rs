//! Error types for the proxy.

use std::time::Duration;

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP protocol error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// Every port in the retry window was taken.
    #[error("no free port in {first}..={last}: {source}")]
    NoAvailablePort {
        first: u16,
        last: u16,
        #[source]
        source: std::io::Error,
    },

    /// Listen address outside the loopback range.
    #[error("refusing to listen on non-loopback address {0}")]
    NonLoopbackHost(std::net::IpAddr),

    /// Upstream dial did not finish in time.
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },

    /// Upstream dial failed.
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Request target could not be turned into host and port.
    #[error("invalid proxy target: {0}")]
    InvalidTarget(String),

    /// Absolute URI with a scheme other than `http`.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// Client sent a request head larger than the read limit.
    #[error("request head exceeds {0} bytes")]
    HeadTooLarge(usize),

    /// Download agent could not be set up.
    #[error("Downloader error: {0}")]
    Download(#[from] vidcap_core::DownloadError),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
