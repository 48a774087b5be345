//! Local capture proxy server.
//!
//! Owns the listening socket and the accept loop. Each accepted connection is
//! handed to a [`ProxyHandler`] on its own task.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use vidcap_core::CaptureRegistry;

use crate::error::{ProxyError, Result};
use crate::handler::ProxyHandler;
use crate::DEFAULT_PROXY_PORT;

/// Ports tried on bind failure, the preferred one included.
pub const DEFAULT_PORT_ATTEMPTS: u16 = 74;

/// Upstream dial timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Proxy server configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    host: IpAddr,
    /// Preferred port.
    pub port: u16,
    /// How many consecutive ports to try before giving up.
    pub port_attempts: u16,
    /// Timeout for dialing upstream servers.
    pub connect_timeout: Duration,
}

impl ProxyConfig {
    /// Creates a configuration with default settings.
    pub fn new() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: DEFAULT_PROXY_PORT,
            port_attempts: DEFAULT_PORT_ATTEMPTS,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the preferred port.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets how many ports to try.
    pub fn with_port_attempts(mut self, attempts: u16) -> Self {
        self.port_attempts = attempts;
        self
    }

    /// Sets the upstream dial timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Returns the listen host, always `127.0.0.1`.
    pub fn host(&self) -> IpAddr {
        self.host
    }

    /// Returns the preferred listen address.
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the proxy's runtime state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyRuntimeState {
    /// Whether the listener is accepting connections.
    pub listening: bool,
    /// Bound port while listening, otherwise the last preferred port.
    pub port: u16,
    /// Whether the OS proxy currently points at this server.
    pub system_proxy_enabled: bool,
    /// Most recent failure, cleared on the next successful start.
    pub last_error: Option<String>,
}

impl Default for ProxyRuntimeState {
    fn default() -> Self {
        Self {
            listening: false,
            port: DEFAULT_PROXY_PORT,
            system_proxy_enabled: false,
            last_error: None,
        }
    }
}

/// Binds the first free port in `preferred..preferred + attempts` on `host`.
///
/// The range is clamped at `u16::MAX`. Any bind failure moves on to the next
/// port. Non-loopback hosts are rejected.
pub fn bind_with_retry(host: IpAddr, preferred: u16, attempts: u16) -> Result<std::net::TcpListener> {
    if !host.is_loopback() {
        return Err(ProxyError::NonLoopbackHost(host));
    }

    let last = preferred.saturating_add(attempts.max(1) - 1);
    let mut last_error = None;

    for port in preferred..=last {
        let addr = SocketAddr::new(host, port);
        match bind_socket(addr) {
            Ok(listener) => {
                if port != preferred {
                    tracing::info!("Port {} unavailable, bound {} instead", preferred, port);
                }
                return Ok(listener);
            }
            Err(e) => {
                tracing::debug!("Bind {} failed: {}", addr, e);
                last_error = Some(e);
            }
        }
    }

    Err(ProxyError::NoAvailablePort {
        first: preferred,
        last,
        source: last_error
            .unwrap_or_else(|| io::Error::new(io::ErrorKind::AddrInUse, "no port attempted")),
    })
}

fn bind_socket(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    // Reclaims ports left in TIME_WAIT. On Windows the same flag lets a
    // socket take over a live port.
    #[cfg(unix)]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    socket.listen(128)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// The local capture proxy.
pub struct ProxyServer {
    config: ProxyConfig,
    handler: ProxyHandler,
    state: RwLock<ProxyRuntimeState>,
    running: Mutex<Option<ProxyHandle>>,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("config", &self.config)
            .field("state", &*self.state.read())
            .finish()
    }
}

impl ProxyServer {
    /// Creates a server with its own capture registry.
    pub fn new(config: ProxyConfig) -> Self {
        Self::with_registry(config, Arc::new(CaptureRegistry::new()))
    }

    /// Creates a server recording into an existing registry.
    pub fn with_registry(config: ProxyConfig, registry: Arc<CaptureRegistry>) -> Self {
        let handler = ProxyHandler::new(registry, config.connect_timeout);
        let state = ProxyRuntimeState {
            port: config.port,
            ..ProxyRuntimeState::default()
        };
        Self {
            config,
            handler,
            state: RwLock::new(state),
            running: Mutex::new(None),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// Returns the capture registry.
    pub fn registry(&self) -> &Arc<CaptureRegistry> {
        self.handler.registry()
    }

    /// Returns a copy of the runtime state.
    pub fn state(&self) -> ProxyRuntimeState {
        self.state.read().clone()
    }

    /// Whether the listener is up.
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Records whether the OS proxy points at this server.
    pub fn set_system_proxy_enabled(&self, enabled: bool) {
        self.state.write().system_proxy_enabled = enabled;
    }

    /// Records a failure in the runtime state.
    pub fn set_last_error(&self, error: Option<String>) {
        self.state.write().last_error = error;
    }

    /// Binds a port and starts accepting connections in the background.
    ///
    /// Uses `preferred_port` or the configured port, walking upward on bind
    /// failure. Starting an already running server returns its state
    /// unchanged. Exhaustion is reported through `last_error`.
    pub async fn start(&self, preferred_port: Option<u16>) -> ProxyRuntimeState {
        let mut running = self.running.lock();
        if running.is_some() {
            return self.state();
        }

        let preferred = preferred_port.unwrap_or(self.config.port);
        match self.listen(preferred) {
            Ok(handle) => {
                let port = handle.addr().port();
                tracing::info!("Capture proxy listening on {}", handle.addr());
                *running = Some(handle);

                let mut state = self.state.write();
                state.listening = true;
                state.port = port;
                state.last_error = None;
                state.clone()
            }
            Err(e) => {
                tracing::error!("Failed to start capture proxy: {}", e);
                let mut state = self.state.write();
                state.listening = false;
                state.port = preferred;
                state.last_error = Some(e.to_string());
                state.clone()
            }
        }
    }

    fn listen(&self, preferred: u16) -> Result<ProxyHandle> {
        let std_listener = bind_with_retry(self.config.host, preferred, self.config.port_attempts)?;
        let listener = TcpListener::from_std(std_listener)?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
        let handler = self.handler.clone();
        let handle = tokio::spawn(accept_loop(listener, handler, shutdown_rx));

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
        })
    }

    /// Stops accepting connections and releases the port.
    ///
    /// Connections already accepted run to completion. Stopping a stopped
    /// server is a no-op.
    pub async fn stop(&self) -> ProxyRuntimeState {
        let handle = self.running.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!("Capture proxy stopped");
        }

        self.state.write().listening = false;
        self.state()
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: ProxyHandler,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        handler.serve(stream, peer).await;
                    });
                }
                Err(e) => {
                    // Back off on fd exhaustion.
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            _ = shutdown_rx.recv() => {
                tracing::debug!("Proxy shutdown signal received");
                break;
            }
        }
    }
}

/// Handle for controlling a running accept loop.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signals the accept loop to exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Waits for the accept loop to finish.
    pub async fn wait(self) {
        let _ = self.handle.await;
    }

    /// Shuts down the accept loop and waits for it to finish.
    pub async fn stop(self) {
        self.shutdown();
        self.wait().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    use crate::handler::CONNECT_ESTABLISHED;

    fn localhost() -> IpAddr {
        IpAddr::V4(Ipv4Addr::LOCALHOST)
    }

    fn occupied_port() -> (std::net::TcpListener, u16) {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    #[test]
    fn proxy_config_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.host(), localhost());
        assert_eq!(config.port, 9527);
        assert_eq!(config.port_attempts, 74);
        assert_eq!(config.connect_timeout, Duration::from_secs(10));
    }

    #[test]
    fn proxy_config_builders() {
        let config = ProxyConfig::new()
            .with_port(8888)
            .with_port_attempts(3)
            .with_connect_timeout(Duration::from_secs(1));
        assert_eq!(config.addr(), SocketAddr::from(([127, 0, 0, 1], 8888)));
        assert_eq!(config.port_attempts, 3);
        assert_eq!(config.connect_timeout, Duration::from_secs(1));
    }

    #[test]
    fn runtime_state_serializes_camel_case() {
        let json = serde_json::to_value(ProxyRuntimeState::default()).unwrap();
        assert_eq!(json["listening"], false);
        assert_eq!(json["port"], 9527);
        assert_eq!(json["systemProxyEnabled"], false);
        assert!(json["lastError"].is_null());
    }

    #[test]
    fn bind_skips_occupied_port() {
        let (_held, port) = occupied_port();
        let listener = bind_with_retry(localhost(), port, DEFAULT_PORT_ATTEMPTS).unwrap();
        let bound = listener.local_addr().unwrap().port();
        assert!(bound > port);
        assert!(bound <= port + 73);
    }

    #[test]
    fn bind_reports_exhaustion() {
        let (_held, port) = occupied_port();
        let err = bind_with_retry(localhost(), port, 1).unwrap_err();
        match err {
            ProxyError::NoAvailablePort { first, last, .. } => {
                assert_eq!(first, port);
                assert_eq!(last, port);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn bind_refuses_non_loopback_host() {
        let err = bind_with_retry(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0, 1).unwrap_err();
        assert!(matches!(err, ProxyError::NonLoopbackHost(_)));
    }

    #[test]
    fn bind_range_clamps_at_max_port() {
        // Only checks that the range arithmetic does not overflow.
        let _ = bind_with_retry(localhost(), u16::MAX, DEFAULT_PORT_ATTEMPTS);
    }

    #[tokio::test]
    async fn start_and_stop() {
        let server = ProxyServer::new(ProxyConfig::new());
        let state = server.start(Some(0)).await;
        assert!(state.listening);
        assert_ne!(state.port, 0);
        assert!(state.last_error.is_none());
        assert!(server.is_running());

        // Starting again is a no-op.
        assert_eq!(server.start(Some(0)).await, state);

        let port = state.port;
        TcpStream::connect(("127.0.0.1", port)).await.unwrap();

        let stopped = server.stop().await;
        assert!(!stopped.listening);
        assert!(!server.is_running());
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());

        // Stopping twice is fine.
        server.stop().await;
    }

    #[tokio::test]
    async fn second_server_walks_to_next_port() {
        let first = ProxyServer::new(ProxyConfig::new());
        let (probe, port) = occupied_port();
        drop(probe);
        let a = first.start(Some(port)).await;
        assert_eq!(a.port, port);

        let second = ProxyServer::new(ProxyConfig::new());
        let b = second.start(Some(port)).await;
        assert!(b.listening);
        assert!(b.port > port);

        first.stop().await;
        second.stop().await;
    }

    #[tokio::test]
    async fn start_failure_is_reported_in_state() {
        let (_held, port) = occupied_port();
        let server = ProxyServer::new(ProxyConfig::new().with_port_attempts(1));
        let state = server.start(Some(port)).await;
        assert!(!state.listening);
        assert_eq!(state.port, port);
        assert!(state.last_error.is_some());
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn connect_through_running_server() {
        let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let echo_port = echo.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = echo.accept().await.unwrap();
            let (mut r, mut w) = socket.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let server = ProxyServer::new(ProxyConfig::new());
        let state = server.start(Some(0)).await;

        let mut client = TcpStream::connect(("127.0.0.1", state.port)).await.unwrap();
        let request = format!("CONNECT 127.0.0.1:{} HTTP/1.1\r\n\r\n", echo_port);
        client.write_all(request.as_bytes()).await.unwrap();

        let mut reply = vec![0u8; CONNECT_ESTABLISHED.len()];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, CONNECT_ESTABLISHED);

        client.write_all(b"opaque").await.unwrap();
        let mut echoed = [0u8; 6];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"opaque");

        // Stopping the listener leaves the open tunnel alone.
        server.stop().await;
        client.write_all(b"still").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"still");
    }
}
