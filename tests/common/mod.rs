//! Shared test doubles for the integration scenarios in `tests/`.

use std::io;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response};
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};

use hallway_proxy::dialer::{Dial, RoundTrip};
use hallway_proxy::error::ProxyError;
use hallway_proxy::transport::{BoxedTransport, Transport};

/// Wraps one end of a `tokio::io::duplex` pair as a [`Transport`], using
/// every capability default (no keep-alive, no TLS info, no traffic-shape).
pub struct DuplexTransport(pub DuplexStream);

impl Transport for DuplexTransport {}

impl AsyncRead for DuplexTransport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for DuplexTransport {
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

/// A [`Dial`] that hands out one pre-built transport and then fails.
/// Enough to test the CONNECT path without a real origin.
pub struct OneShotDialer {
    transport: Mutex<Option<BoxedTransport>>,
}

impl OneShotDialer {
    pub fn new(transport: BoxedTransport) -> Self {
        OneShotDialer { transport: Mutex::new(Some(transport)) }
    }
}

#[async_trait]
impl Dial for OneShotDialer {
    async fn dial(&self, _addr: &str) -> Result<BoxedTransport, ProxyError> {
        self.transport
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| ProxyError::Fatal(anyhow::anyhow!("OneShotDialer already used")))
    }
}

/// A [`RoundTrip`] that returns a canned response, asserting nothing about
/// the request beyond what the caller passes in via `expect`.
pub struct CannedRoundTripper {
    pub status: u16,
    pub body: Bytes,
}

#[async_trait]
impl RoundTrip for CannedRoundTripper {
    async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        Ok(Response::builder().status(self.status).body(self.body.clone()).unwrap())
    }
}

/// A [`RoundTrip`] that records the last request's scheme, for asserting
/// post-MITM re-entry stamped `https`.
pub struct RecordingRoundTripper {
    pub last_scheme: Mutex<Option<String>>,
    pub body: Bytes,
}

impl RecordingRoundTripper {
    pub fn new(body: Bytes) -> Self {
        RecordingRoundTripper { last_scheme: Mutex::new(None), body }
    }
}

#[async_trait]
impl RoundTrip for RecordingRoundTripper {
    async fn round_trip(&self, req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        *self.last_scheme.lock().unwrap() = req.uri().scheme_str().map(|s| s.to_string());
        Ok(Response::builder().status(200).body(self.body.clone()).unwrap())
    }
}

/// A [`RoundTrip`] that panics if invoked — for CONNECT-path tests where the
/// round tripper is present in `ProxyConfig` but must never be called.
pub struct UnusedRoundTripper;

#[async_trait]
impl RoundTrip for UnusedRoundTripper {
    async fn round_trip(&self, _req: Request<Bytes>) -> Result<Response<Bytes>, ProxyError> {
        panic!("round tripper should not be invoked on the CONNECT path");
    }
}
