//! Byte-stream transport seam.
//!
//! Connections read and write through a boxed [`Io`] stream; where it came
//! from is the transport's business. [`TcpTransport`] is the default. The
//! `mocks` feature adds an in-memory transport with scriptable connect
//! behavior per address.

use std::fmt;
use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::trace;

use crate::BoxFuture;

/// The stream interface connections operate on.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// A boxed byte stream.
pub type BoxIo = Box<dyn Io>;

/// Connects to a socket address, producing a byte stream.
///
/// Object-safe so the registry can hold any transport without becoming
/// generic over it.
pub trait Transport: Send + Sync + 'static {
    /// Open a connection to `addr`.
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, Result<BoxIo, io::Error>>;
}

/// TCP transport for client connections.
#[derive(Debug, Clone)]
pub struct TcpTransport {
    nodelay: bool,
}

impl TcpTransport {
    /// Create a TCP transport with `TCP_NODELAY` enabled.
    pub fn new() -> Self {
        Self { nodelay: true }
    }

    /// Control the `TCP_NODELAY` option on new connections.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for TcpTransport {
    fn connect(&self, addr: SocketAddr) -> BoxFuture<'static, Result<BoxIo, io::Error>> {
        let nodelay = self.nodelay;
        Box::pin(async move {
            let stream = TcpStream::connect(addr).await?;
            if nodelay {
                if let Err(error) = stream.set_nodelay(true) {
                    trace!(%error, "set_nodelay failed");
                }
            }
            trace!(peer.addr = %addr, "tcp connected");
            Ok(Box::new(stream) as BoxIo)
        })
    }
}

impl fmt::Debug for dyn Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn Transport")
    }
}

/// A stream with some already-read bytes in front of it.
///
/// When a connection turns into a tunnel, bytes the driver had buffered
/// past the response head belong to the tunnel's owner; this serves them
/// before reading the stream again.
pub(crate) struct PrefixedIo {
    prefix: bytes::Bytes,
    io: BoxIo,
}

impl PrefixedIo {
    pub(crate) fn new(prefix: bytes::Bytes, io: BoxIo) -> Self {
        Self { prefix, io }
    }
}

impl AsyncRead for PrefixedIo {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for PrefixedIo {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.io).poll_shutdown(cx)
    }
}
