//! Caller-facing capture service.
//!
//! Bundles one proxy server, its capture registry, an OS proxy controller and
//! a download agent behind a small set of status-returning operations. None
//! of these operations return errors; failures show up in the returned
//! status objects.

use std::path::Path;
use std::sync::Arc;

use serde::Serialize;

use vidcap_core::{CaptureRegistry, CapturedAsset, DownloadResult, Downloader};

use crate::error::Result;
use crate::proxy::{ProxyConfig, ProxyServer};
use crate::setup::{
    manual_proxy_instructions, platform_controller, SetupResult, SystemProxyController,
};

/// Status reported to the caller after every lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    /// Whether the proxy is accepting connections.
    pub running: bool,
    /// Listening port, or the last preferred port when stopped.
    pub port: u16,
    /// Number of captured assets.
    pub captured_count: usize,
    /// Whether the OS proxy points at this service.
    pub proxy_enabled: bool,
    /// Most recent failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// The capture proxy and everything around it.
pub struct CaptureService {
    server: ProxyServer,
    controller: Box<dyn SystemProxyController>,
    downloader: Downloader,
}

impl std::fmt::Debug for CaptureService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureService")
            .field("server", &self.server)
            .field("downloader", &self.downloader)
            .finish_non_exhaustive()
    }
}

impl CaptureService {
    /// Creates a service for this platform.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        Ok(Self::with_parts(
            config,
            platform_controller(),
            Downloader::new()?,
        ))
    }

    /// Creates a service from explicit parts.
    pub fn with_parts(
        config: ProxyConfig,
        controller: Box<dyn SystemProxyController>,
        downloader: Downloader,
    ) -> Self {
        Self {
            server: ProxyServer::new(config),
            controller,
            downloader,
        }
    }

    /// Returns the capture registry.
    pub fn registry(&self) -> &Arc<CaptureRegistry> {
        self.server.registry()
    }

    /// Returns the proxy server.
    pub fn server(&self) -> &ProxyServer {
        &self.server
    }

    /// Starts the proxy on `preferred_port`, or the configured port.
    pub async fn start_proxy(&self, preferred_port: Option<u16>) -> ServiceStatus {
        self.server.start(preferred_port).await;
        self.status()
    }

    /// Stops the proxy, reverting the OS proxy first if this service set it.
    pub async fn stop_proxy(&self) -> ServiceStatus {
        if self.server.state().system_proxy_enabled {
            let result = self.disable_system_proxy();
            if !result.success {
                tracing::warn!("System proxy left enabled: {}", result.message);
            }
        }
        self.server.stop().await;
        self.status()
    }

    /// Returns the current status.
    pub fn status(&self) -> ServiceStatus {
        let state = self.server.state();
        ServiceStatus {
            running: state.listening,
            port: state.port,
            captured_count: self.registry().len(),
            proxy_enabled: state.system_proxy_enabled,
            error: state.last_error,
        }
    }

    /// Points the OS proxy at the running server.
    pub fn enable_system_proxy(&self) -> SetupResult {
        let state = self.server.state();
        if !state.listening {
            return SetupResult::failure(
                "Start the proxy before enabling the system proxy",
                "proxy not running",
            );
        }

        let host = self.server.config().host().to_string();
        let result = self.controller.enable(&host, state.port);
        if result.success {
            self.server.set_system_proxy_enabled(true);
        } else {
            self.server.set_last_error(result.error.clone());
        }
        result
    }

    /// Reverts the OS proxy.
    pub fn disable_system_proxy(&self) -> SetupResult {
        let result = self.controller.disable();
        if result.success {
            self.server.set_system_proxy_enabled(false);
        } else {
            self.server.set_last_error(result.error.clone());
        }
        result
    }

    /// Whether the OS proxy currently points at the running server.
    ///
    /// Asks the OS rather than trusting [`ServiceStatus::proxy_enabled`], so a
    /// setting reverted outside this process shows up as `false`.
    pub fn system_proxy_active(&self) -> bool {
        let state = self.server.state();
        if !state.listening {
            return false;
        }
        let host = self.server.config().host().to_string();
        self.controller.is_enabled(&host, state.port)
    }

    /// Returns captured assets, newest first.
    pub fn list_captured_assets(&self) -> Vec<CapturedAsset> {
        self.registry().list()
    }

    /// Drops every captured asset.
    pub fn clear_captured_assets(&self) {
        self.registry().clear();
    }

    /// Drops one captured asset.
    pub fn remove_captured_asset(&self, id: &str) {
        self.registry().remove(id);
    }

    /// Calls `callback` with the full asset list after every change.
    pub fn on_assets_changed<F>(&self, callback: F)
    where
        F: Fn(&[CapturedAsset]) + Send + Sync + 'static,
    {
        self.registry().on_change(callback);
    }

    /// Saves `asset` to `destination`.
    pub async fn download_asset(&self, asset: &CapturedAsset, destination: &Path) -> DownloadResult {
        self.downloader.download_asset(asset, destination).await
    }

    /// Manual setup text for the current listening address.
    pub fn manual_proxy_instructions(&self) -> String {
        let host = self.server.config().host().to_string();
        manual_proxy_instructions(&host, self.server.state().port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    /// Remembers calls and answers with a fixed outcome.
    #[derive(Default)]
    struct FakeController {
        calls: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    impl SystemProxyController for FakeController {
        fn enable(&self, host: &str, port: u16) -> SetupResult {
            self.calls.lock().push(format!("enable {}:{}", host, port));
            if self.fail {
                SetupResult::failure("denied", "exit status 1")
            } else {
                SetupResult::success("enabled")
            }
        }

        fn disable(&self) -> SetupResult {
            self.calls.lock().push("disable".to_string());
            SetupResult::success("disabled")
        }

        fn is_enabled(&self, host: &str, port: u16) -> bool {
            self.calls.lock().last() == Some(&format!("enable {}:{}", host, port))
        }
    }

    fn service(fail: bool) -> (CaptureService, Arc<Mutex<Vec<String>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let controller = FakeController {
            calls: calls.clone(),
            fail,
        };
        let service = CaptureService::with_parts(
            ProxyConfig::new().with_port(0),
            Box::new(controller),
            Downloader::new().unwrap(),
        );
        (service, calls)
    }

    #[tokio::test]
    async fn start_enable_stop_reverts_system_proxy() {
        let (service, calls) = service(false);

        let status = service.start_proxy(None).await;
        assert!(status.running);
        assert!(!status.proxy_enabled);

        assert!(service.enable_system_proxy().success);
        assert!(service.status().proxy_enabled);

        let status = service.stop_proxy().await;
        assert!(!status.running);
        assert!(!status.proxy_enabled);
        assert_eq!(
            *calls.lock(),
            vec![format!("enable 127.0.0.1:{}", status.port), "disable".to_string()]
        );
    }

    #[tokio::test]
    async fn system_proxy_active_asks_the_controller() {
        let (service, calls) = service(false);
        assert!(!service.system_proxy_active());

        service.start_proxy(None).await;
        assert!(!service.system_proxy_active());

        assert!(service.enable_system_proxy().success);
        assert!(service.system_proxy_active());

        // Reverted behind the service's back.
        calls.lock().push("disable".to_string());
        assert!(!service.system_proxy_active());
        assert!(service.status().proxy_enabled);

        service.stop_proxy().await;
        assert!(!service.system_proxy_active());
    }

    #[tokio::test]
    async fn stop_without_system_proxy_leaves_os_alone() {
        let (service, calls) = service(false);
        service.start_proxy(None).await;
        service.stop_proxy().await;
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn enable_requires_running_proxy() {
        let (service, calls) = service(false);
        let result = service.enable_system_proxy();
        assert!(!result.success);
        assert!(calls.lock().is_empty());
    }

    #[tokio::test]
    async fn failed_enable_is_reported_in_status() {
        let (service, _) = service(true);
        service.start_proxy(None).await;

        let result = service.enable_system_proxy();
        assert!(!result.success);

        let status = service.status();
        assert!(!status.proxy_enabled);
        assert_eq!(status.error.as_deref(), Some("exit status 1"));
        service.stop_proxy().await;
    }

    #[tokio::test]
    async fn captures_flow_into_status_and_list() {
        let (service, _) = service(false);
        let status = service.start_proxy(None).await;

        let changes = Arc::new(Mutex::new(Vec::new()));
        let seen = changes.clone();
        service.on_assets_changed(move |assets| seen.lock().push(assets.len()));

        // Nothing listens upstream, so the request fails with 502 after the
        // URL has been recorded.
        let upstream = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_port = upstream.local_addr().unwrap().port();
        drop(upstream);

        let mut client = TcpStream::connect(("127.0.0.1", status.port)).await.unwrap();
        let request = format!(
            "GET http://127.0.0.1:{0}/v/clip.mp4 HTTP/1.1\r\nHost: 127.0.0.1:{0}\r\n\r\n",
            upstream_port
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(String::from_utf8_lossy(&reply).starts_with("HTTP/1.1 502"));

        assert_eq!(service.status().captured_count, 1);
        let assets = service.list_captured_assets();
        assert_eq!(assets[0].title, "clip");

        service.remove_captured_asset(&assets[0].id);
        assert_eq!(service.status().captured_count, 0);
        assert_eq!(*changes.lock(), vec![1, 0]);

        service.clear_captured_assets();
        assert_eq!(*changes.lock(), vec![1, 0]);
        service.stop_proxy().await;
    }

    #[tokio::test]
    async fn failed_download_leaves_no_file() {
        let (service, _) = service(false);
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("clip.mp4");

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let asset = CapturedAsset::new(
            format!("http://127.0.0.1:{}/clip.mp4", port),
            &Default::default(),
        );
        let result = service.download_asset(&asset, &dest).await;
        assert!(!result.success);
        assert!(result.error.is_some());
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn instructions_follow_bound_port() {
        let (service, _) = service(false);
        let status = service.start_proxy(None).await;
        let text = service.manual_proxy_instructions();
        assert!(text.contains(&format!("127.0.0.1:{}", status.port)));
        service.stop_proxy().await;
    }

    #[test]
    fn status_serializes_camel_case() {
        let status = ServiceStatus {
            running: true,
            port: 9527,
            captured_count: 2,
            proxy_enabled: false,
            error: None,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["capturedCount"], 2);
        assert_eq!(json["proxyEnabled"], false);
        assert!(json.get("error").is_none());
    }
}
