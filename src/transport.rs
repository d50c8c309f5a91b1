//! Capability-probed transport abstraction (§9, "Connection capability
//! probing" and "Peek-and-replay").
//!
//! Rather than downcasting concrete connection types at runtime, every
//! transport the pipeline touches implements [`Transport`], a supertrait of
//! the async read/write traits with a handful of capability-query methods
//! that default to "not supported". Concrete wrappers (`TcpWrapper`,
//! `Peeked`, `TlsWrapper`) override only the methods that apply to them.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;

use crate::shaping::TrafficShaped;

/// TLS connection state exposed once a stream has been terminated inside
/// the proxy, analogous to Go's `tls.ConnectionState`.
#[derive(Debug, Clone, Default)]
pub struct TlsInfo {
    pub server_name: Option<String>,
    pub alpn_protocol: Option<String>,
}

/// The capability set the pipeline queries on every transport it holds.
pub trait Transport: AsyncRead + AsyncWrite + Unpin + Send {
    fn peer_addr(&self) -> Option<SocketAddr> {
        None
    }

    /// §4.2 step 1: enable TCP keep-alive with the given period. A no-op for
    /// any non-TCP transport (TLS-wrapped or peeked streams delegate to
    /// whatever is underneath).
    fn enable_keepalive(&self, _period: Duration) -> io::Result<()> {
        Ok(())
    }

    /// Present only once the stream has been terminated as TLS inside this
    /// proxy (post-MITM-upgrade).
    fn tls_info(&self) -> Option<TlsInfo> {
        None
    }

    /// Present only when the accepted connection implements the
    /// traffic-shape capability (§4.9). `None` for ordinary sockets.
    fn traffic_shape(&mut self) -> Option<&mut dyn TrafficShaped> {
        None
    }
}

/// Type-erased transport used to carry the "current stream" across the
/// CONNECT/MITM re-entry loop (§9, "Recursive re-entry" — unrolled as an
/// explicit loop over this boxed value rather than true recursion).
pub type BoxedTransport = Box<dyn Transport>;

/// The "buffered reader/writer pair" the connection handler wraps every
/// transport in (§4.2 step 3). `tokio::io::BufReader` buffers reads and
/// forwards writes straight through to the inner transport unbuffered, so
/// one wrapper serves both roles and still exposes a synchronous
/// `.buffer()` peek used by the CONNECT sniff (§4.4.1 step 4).
pub type BufferedTransport = tokio::io::BufReader<BoxedTransport>;

impl Transport for BoxedTransport {
    fn peer_addr(&self) -> Option<SocketAddr> {
        (**self).peer_addr()
    }
    fn enable_keepalive(&self, period: Duration) -> io::Result<()> {
        (**self).enable_keepalive(period)
    }
    fn tls_info(&self) -> Option<TlsInfo> {
        (**self).tls_info()
    }
    fn traffic_shape(&mut self) -> Option<&mut dyn TrafficShaped> {
        (**self).traffic_shape()
    }
}

/// Plain TCP socket, as handed out by the accept loop.
pub struct TcpWrapper(pub TcpStream);

impl Transport for TcpWrapper {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr().ok()
    }

    fn enable_keepalive(&self, period: Duration) -> io::Result<()> {
        let sock_ref = socket2::SockRef::from(&self.0);
        let params = socket2::TcpKeepalive::new().with_time(period);
        sock_ref.set_tcp_keepalive(&params)
    }
}

impl AsyncRead for TcpWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for TcpWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

/// A connection that pre-feeds `prefix` bytes to every reader before
/// falling through to `inner`. Used twice: once to replay the sniffed byte
/// (and anything already buffered alongside it) into the TLS handshaker,
/// and once to replay it into the plaintext HTTP parser (§4.4.1 steps 5-6).
///
/// Invariant: once `prefix` is exhausted it never leaks back in; all reads
/// thereafter go straight to `inner`.
pub struct Peeked<T> {
    prefix: Vec<u8>,
    pos: usize,
    inner: T,
}

impl<T> Peeked<T> {
    pub fn new(prefix: Vec<u8>, inner: T) -> Self {
        Peeked { prefix, pos: 0, inner }
    }

    fn remaining_prefix(&self) -> &[u8] {
        &self.prefix[self.pos..]
    }
}

impl<T: Unpin> AsyncRead for Peeked<T>
where
    T: AsyncRead,
{
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.pos < self.prefix.len() {
            let remaining = self.remaining_prefix();
            let n = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..n]);
            self.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl<T: Unpin> AsyncWrite for Peeked<T>
where
    T: AsyncWrite,
{
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl Transport for Peeked<BoxedTransport> {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr()
    }
    fn enable_keepalive(&self, period: Duration) -> io::Result<()> {
        self.inner.enable_keepalive(period)
    }
    fn tls_info(&self) -> Option<TlsInfo> {
        self.inner.tls_info()
    }
    fn traffic_shape(&mut self) -> Option<&mut dyn TrafficShaped> {
        self.inner.traffic_shape()
    }
}

/// Wraps a terminated-TLS server stream, exposing SNI/ALPN via
/// [`Transport::tls_info`] and remembering the original socket's peer
/// address (the TLS layer has no notion of it).
pub struct TlsWrapper {
    pub stream: tokio_rustls::server::TlsStream<Peeked<BoxedTransport>>,
    pub peer_addr: Option<SocketAddr>,
    pub server_name: Option<String>,
}

impl Transport for TlsWrapper {
    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }
    fn tls_info(&self) -> Option<TlsInfo> {
        let (_, conn) = self.stream.get_ref();
        Some(TlsInfo {
            server_name: self.server_name.clone(),
            alpn_protocol: conn
                .alpn_protocol()
                .map(|p| String::from_utf8_lossy(p).into_owned()),
        })
    }

    /// Forwards to the pre-MITM transport nested inside the TLS stream's
    /// I/O half, so a connection that carried the shaping capability before
    /// termination keeps it after (§1.2 ambient-stack supplement — shaping
    /// must survive the MITM upgrade the same way it already does across a
    /// blind tunnel or a plain, un-upgraded connection).
    fn traffic_shape(&mut self) -> Option<&mut dyn TrafficShaped> {
        let (io, _conn) = self.stream.get_mut();
        io.traffic_shape()
    }
}

impl AsyncRead for TlsWrapper {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for TlsWrapper {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}
