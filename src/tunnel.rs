//! Bidirectional byte relay for blind tunnels and post-handshake MITM leaf
//! connections (§4.4, "relay bytes until either side closes").
//!
//! Grounded in the teacher's own `pipe()` helper in `proxy.rs`, generalized
//! from a concrete `TcpStream` pair to any two [`Transport`]s so the same
//! relay serves a blind CONNECT tunnel and a MITM-terminated leaf alike.

use tokio::io::{copy, split, AsyncWriteExt};
use tracing::debug;

use crate::transport::Transport;

/// Copies bytes in both directions between `client` and `upstream` until one
/// side reaches EOF, then shuts down the other direction's write half.
/// Errors other than a clean EOF are logged, not propagated — a half-closed
/// tunnel should still drain whatever the healthy side still has to say.
pub async fn relay(client: Box<dyn Transport>, upstream: Box<dyn Transport>) {
    let (mut client_r, mut client_w) = split(client);
    let (mut upstream_r, mut upstream_w) = split(upstream);

    let client_to_upstream = async {
        let result = copy(&mut client_r, &mut upstream_w).await;
        let _ = upstream_w.shutdown().await;
        result
    };
    let upstream_to_client = async {
        let result = copy(&mut upstream_r, &mut client_w).await;
        let _ = client_w.shutdown().await;
        result
    };

    let (a, b) = tokio::join!(client_to_upstream, upstream_to_client);
    if let Err(e) = a {
        debug!(error = %e, direction = "client->upstream", "tunnel copy ended");
    }
    if let Err(e) = b {
        debug!(error = %e, direction = "upstream->client", "tunnel copy ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context as TaskContext, Poll};
    use tokio::io::{duplex, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream, ReadBuf};

    struct DuplexTransport(DuplexStream);

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

    #[tokio::test]
    async fn relays_both_directions_until_eof() {
        let (client_side, mut client_peer) = duplex(64);
        let (upstream_side, mut upstream_peer) = duplex(64);

        let handle = tokio::spawn(relay(
            Box::new(DuplexTransport(client_side)),
            Box::new(DuplexTransport(upstream_side)),
        ));

        client_peer.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        upstream_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        upstream_peer.write_all(b"pong").await.unwrap();
        let mut buf = [0u8; 4];
        client_peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        drop(client_peer);
        drop(upstream_peer);
        handle.await.unwrap();
    }
}
