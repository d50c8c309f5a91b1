//! Accept loop with exponential backoff (§4.1).
//!
//! Mirrors the shape of a standard library `net/http` accept loop: a
//! temporary accept error (file-descriptor exhaustion, a reset on an
//! already-half-open socket) doubles a backoff delay capped at 1s rather
//! than busy-spinning or tearing down the listener; any other error is
//! fatal and ends the loop.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{is_temporary, ProxyError};

const MIN_BACKOFF: Duration = Duration::from_millis(5);
const MAX_BACKOFF: Duration = Duration::from_secs(1);

/// Accepts connections from `listener` until `shutdown` fires, handing each
/// one to `on_accept`. `on_accept` is expected to `tokio::spawn` its own
/// work and return immediately — the accept loop never waits on a
/// connection's lifetime.
pub async fn serve_accept<F>(
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    mut on_accept: F,
) -> Result<(), ProxyError>
where
    F: FnMut(TcpStream, std::net::SocketAddr),
{
    let mut backoff = Duration::ZERO;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => {
                debug!("accept loop shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        backoff = Duration::ZERO;
                        on_accept(stream, addr);
                    }
                    Err(e) if is_temporary(&e) => {
                        backoff = if backoff.is_zero() {
                            MIN_BACKOFF
                        } else {
                            (backoff * 2).min(MAX_BACKOFF)
                        };
                        warn!(error = %e, backoff_ms = backoff.as_millis() as u64, "temporary accept error");
                        sleep(backoff).await;
                    }
                    Err(e) => {
                        return Err(ProxyError::Fatal(anyhow::anyhow!("accept failed: {e}")));
                    }
                }
            }
        }
    }
}
