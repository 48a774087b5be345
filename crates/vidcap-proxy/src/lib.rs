//! Vidcap Proxy - local forward proxy that captures media URLs.
//!
//! The proxy listens on `127.0.0.1` and serves two kinds of traffic:
//!
//! - Plain HTTP requests are offered to the [`CaptureRegistry`](vidcap_core::CaptureRegistry)
//!   and then forwarded to their origin unchanged.
//! - `CONNECT` requests are answered with `200 Connection Established` and
//!   spliced to the target. TLS is never terminated, so tunneled traffic is
//!   never inspected.
//!
//! ## Architecture
//!
//! ```text
//! Client ──► ProxyServer (accept loop)
//!                 │
//!                 ▼
//!           ProxyHandler ── CONNECT? ──► tunnel::relay ◄──► upstream
//!                 │ no
//!                 ▼
//!      CaptureRegistry::record_if_new ──► forward (hyper client) ──► origin
//! ```
//!
//! [`CaptureService`] wraps the server together with a
//! [`SystemProxyController`] and a download agent for use by a front end.

mod error;
mod handler;
mod proxy;
pub mod service;
pub mod setup;
pub mod tunnel;

pub use error::{ProxyError, Result};
pub use handler::{
    capture_url, read_request_head, ProxyBody, ProxyHandler, RequestHead, CONNECT_ESTABLISHED,
    MAX_HEAD_SIZE,
};
pub use proxy::{
    bind_with_retry, ProxyConfig, ProxyHandle, ProxyRuntimeState, ProxyServer,
    DEFAULT_CONNECT_TIMEOUT, DEFAULT_PORT_ATTEMPTS,
};
pub use service::{CaptureService, ServiceStatus};
pub use setup::{
    manual_proxy_instructions, platform_controller, CommandOutput, CommandRunner,
    MacOsController, SetupResult, SystemCommandRunner, SystemProxyController,
    UnsupportedController, WindowsController,
};
pub use tunnel::{relay, RelayStats};

/// Default proxy port.
pub const DEFAULT_PROXY_PORT: u16 = 9527;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_correct() {
        assert_eq!(DEFAULT_PROXY_PORT, 9527);
    }
}
