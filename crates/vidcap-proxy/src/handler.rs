//! Per-connection request handling.
//!
//! Each accepted connection is read up to the end of its first request head.
//! `CONNECT` requests are answered on the raw stream and spliced to upstream.
//! Everything else is handed to hyper with the buffered bytes replayed, the
//! request URL is offered to the capture registry, and the request is
//! forwarded unchanged to its origin.

use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, HOST};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use vidcap_core::CaptureRegistry;

use crate::error::{ProxyError, Result};
use crate::tunnel::{dial, parse_connect_target, relay, split_host_port, Prefixed};

/// Body type of every response the proxy produces.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Largest request head accepted before the connection is dropped.
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Reply sent once a CONNECT tunnel is up.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

const RAW_BAD_GATEWAY: &[u8] =
    b"HTTP/1.1 502 Bad Gateway\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

const RAW_BAD_REQUEST: &[u8] =
    b"HTTP/1.1 400 Bad Request\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";

/// The first request head read off a client connection.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method as sent.
    pub method: String,
    /// Request target as sent.
    pub target: String,
    /// Every byte read so far, including anything past the head.
    pub buffered: Bytes,
    /// Length of the head within `buffered`, terminator included.
    pub head_len: usize,
}

impl RequestHead {
    /// Whether this is a `CONNECT` request.
    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Bytes the client sent after the head.
    pub fn trailing(&self) -> Bytes {
        self.buffered.slice(self.head_len..)
    }
}

/// Connection handler shared by every accepted client.
#[derive(Clone)]
pub struct ProxyHandler {
    registry: Arc<CaptureRegistry>,
    connect_timeout: Duration,
}

impl std::fmt::Debug for ProxyHandler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyHandler")
            .field("captured", &self.registry.len())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

impl ProxyHandler {
    /// Creates a handler recording into `registry`.
    pub fn new(registry: Arc<CaptureRegistry>, connect_timeout: Duration) -> Self {
        Self {
            registry,
            connect_timeout,
        }
    }

    /// Returns the capture registry.
    pub fn registry(&self) -> &Arc<CaptureRegistry> {
        &self.registry
    }

    /// Serves one client connection to completion.
    ///
    /// Failures are logged and end the connection; they never propagate.
    pub async fn serve<S>(&self, mut stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let head = match read_request_head(&mut stream).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(e) => {
                tracing::debug!("Unreadable request from {}: {}", peer, e);
                if matches!(e, ProxyError::InvalidTarget(_) | ProxyError::HeadTooLarge(_)) {
                    let _ = stream.write_all(RAW_BAD_REQUEST).await;
                    let _ = stream.shutdown().await;
                }
                return;
            }
        };

        if head.is_connect() {
            self.tunnel(stream, head, peer).await;
        } else {
            let stream = Prefixed::new(head.buffered, stream);
            self.serve_http(stream, peer).await;
        }
    }

    async fn tunnel<S>(&self, mut client: S, head: RequestHead, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let Some((host, port)) = parse_connect_target(&head.target) else {
            tracing::warn!("Bad CONNECT target from {}: {:?}", peer, head.target);
            let _ = client.write_all(RAW_BAD_GATEWAY).await;
            let _ = client.shutdown().await;
            return;
        };

        let mut upstream = match dial(&host, port, self.connect_timeout).await {
            Ok(upstream) => upstream,
            Err(e) => {
                tracing::warn!("CONNECT {}:{} failed: {}", host, port, e);
                let _ = client.write_all(RAW_BAD_GATEWAY).await;
                let _ = client.shutdown().await;
                return;
            }
        };

        if let Err(e) = client.write_all(CONNECT_ESTABLISHED).await {
            tracing::debug!("Client {} left before tunnel start: {}", peer, e);
            return;
        }

        let early = head.trailing();
        if !early.is_empty() {
            if let Err(e) = upstream.write_all(&early).await {
                tracing::debug!("Tunnel to {}:{} failed: {}", host, port, e);
                return;
            }
        }

        tracing::debug!("Tunnel open {} <-> {}:{}", peer, host, port);
        match relay(client, upstream).await {
            Ok(stats) => tracing::debug!(
                "Tunnel closed {} <-> {}:{} (up {} bytes, down {} bytes)",
                peer,
                host,
                port,
                stats.a_to_b + early.len() as u64,
                stats.b_to_a
            ),
            Err(e) => tracing::debug!("Tunnel {} <-> {}:{} error: {}", peer, host, port, e),
        }
    }

    async fn serve_http<S>(&self, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let handler = self.clone();
        let service = service_fn(move |req| {
            let handler = handler.clone();
            async move { Ok::<_, Infallible>(handler.handle_request(req).await) }
        });

        if let Err(e) = http1::Builder::new()
            .keep_alive(false)
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(TokioIo::new(stream), service)
            .await
        {
            tracing::debug!("HTTP connection from {} ended: {}", peer, e);
        }
    }

    /// Records the request URL if it looks like media, then forwards it.
    pub async fn handle_request(&self, req: Request<Incoming>) -> Response<ProxyBody> {
        if let Some(url) = capture_url(&req) {
            if let Some(asset) = self.registry.record_if_new(&url, req.headers()) {
                tracing::debug!("{} quality={} size={}", asset.url, asset.quality, asset.size);
            }
        }

        let method = req.method().clone();
        let uri = req.uri().clone();
        match self.forward(req).await {
            Ok(response) => {
                tracing::debug!("{} {} -> {}", method, uri, response.status());
                response
            }
            Err(e) => {
                tracing::warn!("{} {} failed: {}", method, uri, e);
                bad_gateway()
            }
        }
    }

    async fn forward(&self, mut req: Request<Incoming>) -> Result<Response<ProxyBody>> {
        let uri = req.uri().clone();
        if let Some(scheme) = uri.scheme_str() {
            if !scheme.eq_ignore_ascii_case("http") {
                return Err(ProxyError::UnsupportedScheme(scheme.to_string()));
            }
        }

        let authority = uri
            .authority()
            .map(|a| a.as_str().to_string())
            .or_else(|| host_header(&req))
            .ok_or_else(|| ProxyError::InvalidTarget(uri.to_string()))?;
        let (host, port) = split_host_port(&authority, 80)
            .ok_or_else(|| ProxyError::InvalidTarget(authority.clone()))?;

        let stream = dial(&host, port, self.connect_timeout).await?;
        let (mut sender, conn) = hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(TokioIo::new(stream))
            .await?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!("Upstream connection error: {}", e);
            }
        });

        let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
        *req.uri_mut() = path
            .parse::<Uri>()
            .map_err(|_| ProxyError::InvalidTarget(uri.to_string()))?;
        req.headers_mut().remove("proxy-connection");
        if !req.headers().contains_key(HOST) {
            let value = HeaderValue::from_str(&authority)
                .map_err(|_| ProxyError::InvalidTarget(authority.clone()))?;
            req.headers_mut().insert(HOST, value);
        }

        let response = sender.send_request(req).await?;
        Ok(response.map(|body| body.boxed()))
    }
}

/// Reads from `stream` until a full request head is buffered.
///
/// Returns `None` when the client closes before sending anything.
pub async fn read_request_head<S>(stream: &mut S) -> Result<Option<RequestHead>>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(ProxyError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed inside request head",
            )));
        }

        let search_from = buf.len().saturating_sub(3);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_subslice(&buf[search_from..], b"\r\n\r\n") {
            let head_len = search_from + pos + 4;
            if head_len > MAX_HEAD_SIZE {
                return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
            }
            return parse_request_line(Bytes::from(buf), head_len).map(Some);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::HeadTooLarge(MAX_HEAD_SIZE));
        }
    }
}

fn parse_request_line(buffered: Bytes, head_len: usize) -> Result<RequestHead> {
    let line_end = find_subslice(&buffered, b"\r\n").unwrap_or(head_len);
    let line = std::str::from_utf8(&buffered[..line_end])
        .map_err(|_| ProxyError::InvalidTarget("request line is not UTF-8".to_string()))?;

    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(_version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(ProxyError::InvalidTarget(line.to_string()));
    };

    Ok(RequestHead {
        method: method.to_string(),
        target: target.to_string(),
        head_len,
        buffered,
    })
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// The URL a request is recorded under.
///
/// Absolute-form targets are used as sent. Origin-form targets are rebuilt
/// from the `Host` header.
pub fn capture_url<B>(req: &Request<B>) -> Option<String> {
    let uri = req.uri();
    if uri.scheme().is_some() {
        return Some(uri.to_string());
    }

    let host = host_header(req)?;
    let path = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");
    Some(format!("http://{}{}", host, path))
}

fn host_header<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string)
}

fn bad_gateway() -> Response<ProxyBody> {
    let mut response = Response::new(
        Full::new(Bytes::from_static(b"Bad Gateway"))
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = StatusCode::BAD_GATEWAY;
    response
}
