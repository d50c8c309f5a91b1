//! The request pipeline (§4.3–§4.5): one request-response exchange per
//! call, routed to the CONNECT branches or the plain-request branch.

use std::net::SocketAddr;

use bytes::Bytes;
use http::{Method, Request, Response, StatusCode, Uri};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::connect;
use crate::error::{CloseReason, ProxyError};
use crate::http1;
use crate::modifier::attach_warning;
use crate::proxy::ProxyConfig;
use crate::session::{Context, Session};
use crate::shaping::{self, TrafficShaped};
use crate::transport::{BufferedTransport, Transport};

/// What the handler's connection loop should do next. A MITM CONNECT
/// upgrade yields `Reenter` with the new transport instead of the pipeline
/// recursing into itself (§9, "Recursive re-entry").
pub enum PipelineOutcome {
    /// The exchange completed normally; the caller can read another
    /// request off the same (possibly now-upgraded) transport.
    Continue(BufferedTransport),
    /// The connection is done — closed, hijacked, or torn down after an
    /// unrecoverable error.
    Close,
    /// A CONNECT+MITM upgrade (or sniffed-clear-HTTP fallthrough) produced
    /// a new transport; re-wrap it and re-enter the pipeline.
    Reenter(crate::transport::BoxedTransport),
}

/// Runs exactly one request-response exchange (§4.3). `peer_addr` is
/// stamped into the Context for modifier use; it does not change across
/// re-entries on the same physical socket (only the transport layering
/// does).
pub async fn run_once(
    stream: BufferedTransport,
    session: &mut Session,
    config: &ProxyConfig,
    peer_addr: Option<SocketAddr>,
    cancelled: &mut watch::Receiver<bool>,
) -> Result<PipelineOutcome, ProxyError> {
    let (mut stream, mut req) = match read_request_racing(stream, cancelled, config.idle_timeout).await {
        ReadOutcome::Parsed(stream, req) => (stream, req),
        ReadOutcome::ParseError(stream, e) => {
            if session.is_secure() {
                if let Some(hook) = &config.tls_closed_hook {
                    let sni = stream.get_ref().tls_info().and_then(|i| i.server_name);
                    hook.on_closed(sni.as_deref(), &anyhow::anyhow!(e.to_string()));
                }
            }
            return Ok(PipelineOutcome::Close);
        }
        ReadOutcome::Cancelled => return Ok(PipelineOutcome::Close),
        ReadOutcome::TimedOut => {
            debug!(session = session.id(), "idle timeout waiting for next request");
            return Ok(PipelineOutcome::Close);
        }
    };

    stamp(&mut req, stream.get_ref(), session, peer_addr);

    if req.method() == Method::CONNECT {
        return match &config.mitm {
            Some(mitm) => connect::handle_mitm(stream, req, session, config, mitm).await,
            None => connect::handle_blind_tunnel(stream, req, session, config).await,
        };
    }

    run_plain(&mut stream, req, session, config, &*cancelled).await?;
    Ok(PipelineOutcome::Continue(stream))
}

enum ReadOutcome {
    Parsed(BufferedTransport, Request<Bytes>),
    ParseError(BufferedTransport, ProxyError),
    Cancelled,
    TimedOut,
}

/// §4.3 stage 1: parse on a secondary task, racing it against cancellation
/// and an idle deadline so a shutting-down server — or a client that never
/// sends a next request — doesn't hold the connection open forever. The
/// deadline bounds only this wait-for-a-request phase (§4.2, "an idle
/// timeout between requests rather than a total-connection budget"); once a
/// request is parsed, nothing here bounds how long the rest of the pipeline
/// (including a CONNECT tunnel or MITM relay) takes.
async fn read_request_racing(
    mut stream: BufferedTransport,
    cancelled: &mut watch::Receiver<bool>,
    idle_timeout: std::time::Duration,
) -> ReadOutcome {
    let handle = tokio::spawn(async move {
        let result = http1::read_request(&mut stream).await;
        (stream, result)
    });
    tokio::pin!(handle);

    tokio::select! {
        biased;
        _ = cancelled.changed() => {
            handle.abort();
            ReadOutcome::Cancelled
        }
        _ = tokio::time::sleep(idle_timeout) => {
            handle.abort();
            ReadOutcome::TimedOut
        }
        joined = &mut handle => {
            match joined {
                Ok((stream, Ok(req))) => ReadOutcome::Parsed(stream, req),
                Ok((stream, Err(e))) => ReadOutcome::ParseError(stream, e),
                Err(_) => ReadOutcome::Cancelled,
            }
        }
    }
}

/// §4.3 stage 3: fill in scheme/host/RemoteAddr. Detecting "terminated TLS"
/// off the transport's capability (rather than a separate re-entry flag) is
/// what lets a MITM re-entry fall out of the ordinary pipeline path with no
/// special-casing.
fn stamp(
    req: &mut Request<Bytes>,
    transport: &crate::transport::BoxedTransport,
    session: &mut Session,
    peer_addr: Option<SocketAddr>,
) {
    let tls_info = transport.tls_info();
    if tls_info.is_some() {
        session.mark_secure();
    }
    let scheme = if session.is_secure() { "https" } else { "http" };

    let mut parts = req.uri().clone().into_parts();
    if parts.authority.is_none() {
        if let Some(host) = req
            .headers()
            .get(http::header::HOST)
            .and_then(|h| h.to_str().ok())
        {
            if let Ok(authority) = host.parse() {
                parts.authority = Some(authority);
            }
        }
    }
    if parts.scheme.is_none() && parts.authority.is_some() {
        parts.scheme = Some(scheme.parse().unwrap());
    }
    if let Ok(uri) = Uri::from_parts(parts) {
        *req.uri_mut() = uri;
    }

    let mut ctx = Context::new(session);
    if let Some(addr) = peer_addr {
        ctx.insert("remote_addr", addr);
    }
    if let Some(info) = tls_info {
        ctx.insert("tls_server_name", info.server_name.unwrap_or_default());
    }
}

/// §4.5: the non-CONNECT request branch.
async fn run_plain(
    stream: &mut BufferedTransport,
    mut req: Request<Bytes>,
    session: &mut Session,
    config: &ProxyConfig,
    cancelled: &watch::Receiver<bool>,
) -> Result<(), ProxyError> {
    let skip_round_trip = {
        let mut ctx = Context::new(session);
        if let Err(e) = config.modifiers.request.modify_request(&mut req, &mut ctx) {
            warn!(error = %e, "request modifier failed");
        }
        if ctx.is_hijacked() {
            return Ok(());
        }
        ctx.skip_round_trip()
    };

    let uri = req.uri().clone();
    let req_close = connection_close_requested(req.headers());

    let mut response = if skip_round_trip {
        Response::builder().status(StatusCode::OK).body(Bytes::new()).unwrap()
    } else {
        match config.round_tripper.round_trip(req).await {
            Ok(res) => res,
            Err(e) => {
                warn!(error = %e, "round trip failed");
                let mut res = Response::builder().status(StatusCode::BAD_GATEWAY).body(Bytes::new()).unwrap();
                attach_warning(&mut res, "hallway-proxy", &e);
                res
            }
        }
    };

    {
        let mut ctx = Context::new(session);
        if let Err(e) = config.modifiers.response.modify_response(&mut response, &mut ctx) {
            warn!(error = %e, "response modifier failed");
        }
        if ctx.is_hijacked() {
            return Ok(());
        }
    }

    let res_close = connection_close_requested(response.headers());
    let closing = req_close || res_close || *cancelled.borrow();

    if let Some(shaped) = stream.get_mut().traffic_shape() {
        let header_len = estimate_header_len(&response);
        apply_shaping_capability(shaped, &uri, response.headers(), header_len);
    }

    http1::write_response(stream, &response, closing).await?;

    if closing {
        return Err(ProxyError::closeable(CloseReason::ForceClose));
    }
    Ok(())
}

fn connection_close_requested(headers: &http::HeaderMap) -> bool {
    headers
        .get(http::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("close"))
}

fn estimate_header_len(res: &Response<Bytes>) -> usize {
    res.headers()
        .iter()
        .map(|(n, v)| n.as_str().len() + v.len() + 4)
        .sum()
}

fn apply_shaping_capability(
    shaped: &mut dyn TrafficShaped,
    uri: &Uri,
    headers: &http::HeaderMap,
    header_len: usize,
) {
    shaping::apply_shaping(shaped, uri, headers, header_len);
}
