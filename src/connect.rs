//! `CONNECT` handling: the MITM branch and the blind-tunnel branch (§4.4).

use bytes::Bytes;
use http::{Request, Response, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::{CloseReason, ProxyError};
use crate::http1;
use crate::mitm::MitmConfig;
use crate::modifier::attach_warning;
use crate::pipeline::PipelineOutcome;
use crate::proxy::ProxyConfig;
use crate::session::{Context, Session};
use crate::transport::{BoxedTransport, BufferedTransport, Peeked, TlsWrapper, Transport};
use crate::tunnel;

fn bad_request(msg: &str) -> ProxyError {
    ProxyError::closeable(CloseReason::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.to_string(),
    )))
}

/// MITM branch (§4.4.1): synthesize the tunnel-established response, sniff
/// the first byte of whatever comes next, and either terminate TLS with a
/// minted certificate or fall through to a plain-HTTP re-entry.
///
/// Returns [`PipelineOutcome::Reenter`] rather than recursing (§9,
/// "Recursive re-entry") — the caller's handler loop drives the actual
/// looping over successive transports.
pub async fn handle_mitm(
    mut stream: BufferedTransport,
    mut req: Request<Bytes>,
    session: &mut Session,
    config: &ProxyConfig,
    mitm: &MitmConfig,
) -> Result<PipelineOutcome, ProxyError> {
    {
        let mut ctx = Context::new(session);
        if let Err(e) = config.modifiers.request.modify_request(&mut req, &mut ctx) {
            warn!(error = %e, "request modifier failed on CONNECT");
        }
        if ctx.is_hijacked() {
            return Ok(PipelineOutcome::Close);
        }
    }

    let mut response = Response::builder().status(StatusCode::OK).body(Bytes::new()).unwrap();
    {
        let mut ctx = Context::new(session);
        if let Err(e) = config.modifiers.response.modify_response(&mut response, &mut ctx) {
            warn!(error = %e, "response modifier failed on CONNECT 200");
        }
        if ctx.is_hijacked() {
            return Ok(PipelineOutcome::Close);
        }
    }

    http1::write_response(&mut stream, &response, false).await?;

    let first_byte = {
        let mut b = [0u8; 1];
        stream.read_exact(&mut b).await?;
        b[0]
    };
    let mut prefix = vec![first_byte];
    let buffered = stream.buffer();
    if !buffered.is_empty() {
        prefix.extend_from_slice(buffered);
        let n = buffered.len();
        stream.consume(n);
    }

    let host = req
        .uri()
        .host()
        .ok_or_else(|| bad_request("CONNECT target has no host"))?
        .to_string();

    if first_byte == 0x16 {
        terminate_tls(stream, prefix, &host, mitm).await
    } else {
        debug!(host, "CONNECT sniff observed clear HTTP, skipping TLS termination");
        let inner = stream.into_inner();
        let peeked: BoxedTransport = Box::new(Peeked::new(prefix, inner));
        Ok(PipelineOutcome::Reenter(peeked))
    }
}

async fn terminate_tls(
    stream: BufferedTransport,
    prefix: Vec<u8>,
    host: &str,
    mitm: &MitmConfig,
) -> Result<PipelineOutcome, ProxyError> {
    let server_config = mitm.cert_resolver.server_config_for(host).await.map_err(|e| {
        mitm.error_hook.on_handshake_error(host, &e);
        ProxyError::Fatal(e)
    })?;

    let peer_addr = stream.get_ref().peer_addr();
    let inner = stream.into_inner();
    let peeked = Peeked::new(prefix, inner);

    let acceptor = tokio_rustls::TlsAcceptor::from(server_config);
    let tls_stream = acceptor.accept(peeked).await.map_err(|e| {
        let err = anyhow::anyhow!("TLS handshake failed: {e}");
        mitm.error_hook.on_handshake_error(host, &err);
        ProxyError::closeable(CloseReason::Io(std::io::Error::new(
            std::io::ErrorKind::Other,
            err.to_string(),
        )))
    })?;

    let wrapper = TlsWrapper {
        stream: tls_stream,
        peer_addr,
        server_name: Some(host.to_string()),
    };
    Ok(PipelineOutcome::Reenter(Box::new(wrapper)))
}

/// Blind tunnel branch (§4.4.2): dial the target (directly, or via a
/// downstream proxy), answer the client, and relay until either side
/// closes. On dial failure, synthesizes a `502` and never relays.
pub async fn handle_blind_tunnel(
    mut stream: BufferedTransport,
    req: Request<Bytes>,
    session: &mut Session,
    config: &ProxyConfig,
) -> Result<PipelineOutcome, ProxyError> {
    let target = req
        .uri()
        .authority()
        .map(|a| a.to_string())
        .ok_or_else(|| bad_request("CONNECT target has no authority"))?;

    let dial_result = establish_tunnel(&req, &target, config).await;

    let (upstream, mut response) = match dial_result {
        Ok(pair) => pair,
        Err(e) => {
            // §9 open question: log the real cause, not a stale/wrong variable.
            warn!(target, error = %e, "CONNECT dial failed");
            let mut response = Response::builder().status(StatusCode::BAD_GATEWAY).body(Bytes::new()).unwrap();
            attach_warning(&mut response, "hallway-proxy", &e);
            let mut ctx = Context::new(session);
            let _ = config.modifiers.response.modify_response(&mut response, &mut ctx);
            if !ctx.is_hijacked() {
                http1::write_response(&mut stream, &response, true).await?;
            }
            return Ok(PipelineOutcome::Close);
        }
    };

    {
        let mut ctx = Context::new(session);
        if let Err(e) = config.modifiers.response.modify_response(&mut response, &mut ctx) {
            warn!(error = %e, "response modifier failed on CONNECT tunnel response");
        }
        if ctx.is_hijacked() {
            return Ok(PipelineOutcome::Close);
        }
    }

    http1::write_response(&mut stream, &response, false).await?;

    let buffered = stream.buffer().to_vec();
    let client_raw = stream.into_inner();
    let client: BoxedTransport = if buffered.is_empty() {
        client_raw
    } else {
        Box::new(Peeked::new(buffered, client_raw))
    };

    tunnel::relay(client, upstream).await;
    Ok(PipelineOutcome::Close)
}

async fn establish_tunnel(
    req: &Request<Bytes>,
    target: &str,
    config: &ProxyConfig,
) -> Result<(BoxedTransport, Response<Bytes>), ProxyError> {
    match &config.downstream_proxy {
        Some(proxy_url) => {
            let mut proxy_stream = config.dialer.dial(target).await?;
            write_connect_line(&mut proxy_stream, req, target).await?;
            let mut buffered = BufReader::new(proxy_stream);
            let proxy_response = http1::read_response(&mut buffered).await?;
            if proxy_response.status() != StatusCode::OK {
                return Err(ProxyError::Fatal(anyhow::anyhow!(
                    "downstream proxy {proxy_url} refused CONNECT {target}: {}",
                    proxy_response.status()
                )));
            }
            let response = Response::builder().status(StatusCode::OK).body(Bytes::new()).unwrap();
            Ok((buffered.into_inner(), response))
        }
        None => {
            let upstream = config.dialer.dial(target).await?;
            let response = Response::builder().status(StatusCode::OK).body(Bytes::new()).unwrap();
            Ok((upstream, response))
        }
    }
}

async fn write_connect_line(
    writer: &mut BoxedTransport,
    req: &Request<Bytes>,
    target: &str,
) -> Result<(), ProxyError> {
    let mut out = format!("CONNECT {target} HTTP/1.1\r\nHost: {target}\r\n");
    for (name, value) in req.headers() {
        if http1::is_hop_by_hop(name) {
            continue;
        }
        if let Ok(v) = value.to_str() {
            out.push_str(name.as_str());
            out.push_str(": ");
            out.push_str(v);
            out.push_str("\r\n");
        }
    }
    out.push_str("\r\n");
    writer.write_all(out.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
