//! Byte relay between two open streams.
//!
//! Used for CONNECT tunnels. Knows nothing about HTTP.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use hyper::body::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// Bytes moved in each direction by [`relay`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Bytes copied from the first stream to the second.
    pub a_to_b: u64,
    /// Bytes copied from the second stream to the first.
    pub b_to_a: u64,
}

/// Copies bytes both ways until either direction hits EOF or fails, then
/// shuts both streams down.
///
/// The first error seen, if any, is returned after both ends are closed.
pub async fn relay<A, B>(a: A, b: B) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite,
    B: AsyncRead + AsyncWrite,
{
    let (mut a_read, mut a_write) = tokio::io::split(a);
    let (mut b_read, mut b_write) = tokio::io::split(b);
    let mut stats = RelayStats::default();

    let result = tokio::select! {
        r = pump(&mut a_read, &mut b_write, &mut stats.a_to_b) => r,
        r = pump(&mut b_read, &mut a_write, &mut stats.b_to_a) => r,
    };

    let _ = a_write.shutdown().await;
    let _ = b_write.shutdown().await;

    result.map(|_| stats)
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, count: &mut u64) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        *count += n as u64;
    }
}

/// Opens a TCP connection to `host:port`, giving up after `timeout`.
pub async fn dial(host: &str, port: u16, timeout: Duration) -> Result<TcpStream> {
    let target = format!("{}:{}", host, port);
    match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => {
            let _ = stream.set_nodelay(true);
            Ok(stream)
        }
        Ok(Err(source)) => Err(ProxyError::Connect { target, source }),
        Err(_) => Err(ProxyError::ConnectTimeout { target, timeout }),
    }
}

/// Splits a CONNECT target into host and port, defaulting to 443.
pub fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    split_host_port(target, 443)
}

/// Splits `host[:port]` into its parts.
///
/// A missing or unparseable port falls back to `default_port`. IPv6 literals
/// keep their address without brackets.
pub fn split_host_port(target: &str, default_port: u16) -> Option<(String, u16)> {
    let target = target.trim();

    let (host, port) = if let Some(rest) = target.strip_prefix('[') {
        let (host, after) = rest.split_once(']')?;
        let port = after
            .strip_prefix(':')
            .and_then(|p| p.parse().ok())
            .unwrap_or(default_port);
        (host, port)
    } else {
        match target.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().unwrap_or(default_port)),
            None => (target, default_port),
        }
    };

    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

/// A stream that replays already-read bytes before reading from `inner`.
#[derive(Debug)]
pub struct Prefixed<S> {
    prefix: Bytes,
    inner: S,
}

impl<S> Prefixed<S> {
    /// Wraps `inner`, replaying `prefix` first.
    pub fn new(prefix: Bytes, inner: S) -> Self {
        Self { prefix, inner }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prefixed<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prefixed<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
