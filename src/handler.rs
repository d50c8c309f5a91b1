//! Per-connection handler (§4.2): enables keep-alive, wraps the transport,
//! creates a Session, and drives the request loop until a closeable error.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::debug;

use crate::pipeline::{self, PipelineOutcome};
use crate::proxy::ProxyConfig;
use crate::session::Session;
use crate::transport::{BoxedTransport, TcpWrapper, Transport};

const TCP_KEEPALIVE_PERIOD: Duration = Duration::from_secs(180);

pub async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    mut cancelled: watch::Receiver<bool>,
) {
    let transport: BoxedTransport = Box::new(TcpWrapper(stream));
    if let Err(e) = transport.enable_keepalive(TCP_KEEPALIVE_PERIOD) {
        debug!(peer = %peer_addr, error = %e, "failed to enable TCP keep-alive");
    }

    if *cancelled.borrow() {
        return;
    }

    let mut buffered = BufReader::new(transport);
    let mut session = Session::new();

    loop {
        // The idle wait for the next request is bounded inside `run_once`
        // itself (§4.2, idle timeout between requests, not a total-
        // connection budget); a CONNECT tunnel or MITM relay started from
        // inside this call runs for as long as it carries traffic.
        let outcome = match pipeline::run_once(buffered, &mut session, &config, Some(peer_addr), &mut cancelled).await {
            Ok(outcome) => outcome,
            Err(e) => {
                debug!(peer = %peer_addr, session = session.id(), error = %e, "connection closed");
                return;
            }
        };

        match outcome {
            PipelineOutcome::Continue(stream) => buffered = stream,
            PipelineOutcome::Close => return,
            PipelineOutcome::Reenter(new_transport) => {
                buffered = BufReader::new(new_transport);
            }
        }
    }
}
