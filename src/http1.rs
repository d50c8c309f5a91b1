//! HTTP/1.1 wire parsing and serialization.
//!
//! The teacher never parses HTTP — it blindly relays already-encrypted
//! bytes. This module is grounded instead in the example corpus's low-level
//! forward-proxy code: read raw bytes until the header terminator, tokenize
//! with `httparse`, and represent the result as `http::Request`/
//! `http::Response` with a fully-buffered `Bytes` body (no chunked-transfer
//! support — out of scope, see DESIGN.md).

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, HeaderName, HeaderValue, Method, Request, Response, StatusCode, Uri, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CloseReason, ProxyError};

const MAX_HEADER_BYTES: usize = 64 * 1024;
const MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const MAX_HEADERS: usize = 128;

fn invalid(msg: impl Into<String>) -> ProxyError {
    ProxyError::closeable(CloseReason::Io(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        msg.into(),
    )))
}

/// Reads raw bytes off `reader` up to and including the first `\r\n\r\n`,
/// consuming from the buffered reader exactly that many bytes and no more
/// — anything after the terminator that arrived in the same read stays in
/// the reader's internal buffer for the body/next-request/sniff read (§3,
/// "a buffered reader is never discarded with unread bytes").
async fn read_head<R>(reader: &mut R) -> Result<Vec<u8>, ProxyError>
where
    R: AsyncBufRead + Unpin,
{
    let mut head = Vec::with_capacity(512);
    loop {
        let chunk_len;
        let terminator_end;
        {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                return Err(ProxyError::closeable(CloseReason::Eof));
            }
            chunk_len = chunk.len();
            let search_from = head.len().saturating_sub(3);
            head.extend_from_slice(chunk);
            if head.len() > MAX_HEADER_BYTES {
                return Err(ProxyError::closeable(CloseReason::HeadersTooLarge));
            }
            terminator_end =
                find_subslice(&head[search_from..], b"\r\n\r\n").map(|pos| search_from + pos + 4);
        }
        match terminator_end {
            Some(end) => {
                let consumed_from_chunk = end - (head.len() - chunk_len);
                reader.consume(consumed_from_chunk);
                head.truncate(end);
                return Ok(head);
            }
            None => reader.consume(chunk_len),
        }
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn content_length(headers: &HeaderMap) -> Result<Option<usize>, ProxyError> {
    let Some(value) = headers.get(http::header::CONTENT_LENGTH) else {
        return Ok(None);
    };
    let value = value
        .to_str()
        .map_err(|_| invalid("non-ASCII Content-Length"))?;
    value
        .trim()
        .parse::<usize>()
        .map(Some)
        .map_err(|_| invalid("malformed Content-Length"))
}

fn is_chunked(headers: &HeaderMap) -> bool {
    headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("chunked"))
}

/// Reads a fully-buffered body according to `Content-Length`. Chunked
/// transfer-encoding is rejected outright (Non-goal) rather than silently
/// truncated.
async fn read_body<R>(reader: &mut R, headers: &HeaderMap) -> Result<Bytes, ProxyError>
where
    R: AsyncRead + Unpin,
{
    if is_chunked(headers) {
        return Err(invalid("chunked transfer-encoding is not supported"));
    }

    let Some(len) = content_length(headers)? else {
        return Ok(Bytes::new());
    };
    if len > MAX_BODY_BYTES {
        return Err(invalid("request body exceeds size limit"));
    }

    let mut body = BytesMut::with_capacity(len);
    while body.len() < len {
        let mut chunk = [0u8; 8192];
        let want = (len - body.len()).min(chunk.len());
        let n = reader.read(&mut chunk[..want]).await?;
        if n == 0 {
            return Err(ProxyError::closeable(CloseReason::Eof));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body.freeze())
}

fn headers_to_map(raw: &[httparse::Header<'_>]) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    for h in raw {
        let name =
            HeaderName::from_bytes(h.name.as_bytes()).map_err(|_| invalid("malformed header name"))?;
        let value = HeaderValue::from_bytes(h.value).map_err(|_| invalid("malformed header value"))?;
        headers.append(name, value);
    }
    Ok(headers)
}

/// Parses one HTTP/1 request-line + headers off `reader`, then — unless the
/// method is `CONNECT`, which never carries a body — reads a
/// `Content-Length`-framed body. For `CONNECT`, any bytes already sitting
/// in the buffered reader beyond the blank line are left untouched; the
/// CONNECT branch (§4.4) sniffs them later.
pub async fn read_request<R>(reader: &mut R) -> Result<Request<Bytes>, ProxyError>
where
    R: AsyncBufRead + AsyncRead + Unpin,
{
    let head = read_head(reader).await?;

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut raw_headers);
    let status = parsed
        .parse(&head)
        .map_err(|e| invalid(format!("malformed request: {e}")))?;
    if status.is_partial() {
        return Err(invalid("incomplete request headers"));
    }

    let method: Method = parsed
        .method
        .ok_or_else(|| invalid("missing method"))?
        .parse()
        .map_err(|_| invalid("unknown method"))?;
    let path = parsed.path.ok_or_else(|| invalid("missing request target"))?;

    let uri: Uri = if method == Method::CONNECT {
        format!("//{path}").parse().map_err(|_| invalid("malformed CONNECT authority"))?
    } else {
        path.parse().map_err(|_| invalid("malformed request target"))?
    };

    let headers = headers_to_map(parsed.headers)?;

    let body = if method == Method::CONNECT {
        Bytes::new()
    } else {
        read_body(reader, &headers).await?
    };

    let mut builder = Request::builder().method(method).uri(uri).version(Version::HTTP_11);
    *builder.headers_mut().unwrap() = headers;
    builder.body(body).map_err(|e| invalid(e.to_string()))
}

/// Parses an HTTP/1 status-line + headers + `Content-Length` body off
/// `reader` — used by the default round-tripper to read the origin's
/// response.
pub async fn read_response<R>(reader: &mut R) -> Result<Response<Bytes>, ProxyError>
where
    R: AsyncBufRead + AsyncRead + Unpin,
{
    let head = read_head(reader).await?;

    let mut raw_headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Response::new(&mut raw_headers);
    let status = parsed
        .parse(&head)
        .map_err(|e| invalid(format!("malformed response: {e}")))?;
    if status.is_partial() {
        return Err(invalid("incomplete response headers"));
    }

    let code = parsed.code.ok_or_else(|| invalid("missing status code"))?;
    let status_code = StatusCode::from_u16(code).map_err(|_| invalid("invalid status code"))?;

    let headers = headers_to_map(parsed.headers)?;
    let body = read_body(reader, &headers).await?;

    let mut builder = Response::builder().status(status_code).version(Version::HTTP_11);
    *builder.headers_mut().unwrap() = headers;
    builder.body(body).map_err(|e| invalid(e.to_string()))
}

/// Hop-by-hop headers must never be forwarded across a proxy boundary
/// (RFC 7230 §6.1) — grounded in the example corpus's forward-proxy code,
/// which enumerates exactly this set.
pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    matches!(
        name.as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "transfer-encoding"
            | "te"
            | "trailer"
            | "trailers"
            | "upgrade"
            | "proxy-authenticate"
            | "proxy-authorization"
    )
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let hop_by_hop: Vec<HeaderName> = headers.keys().filter(|n| is_hop_by_hop(n)).cloned().collect();
    for name in hop_by_hop {
        headers.remove(name);
    }
}

/// Whether the request-target should be written in absolute-form
/// (`http://host/path`, as required when forwarding through a downstream
/// proxy) or origin-form (`/path`, when dialing the origin directly).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetForm {
    Absolute,
    Origin,
}

/// Serializes `req` onto `writer`, stripping hop-by-hop headers and framing
/// the body with `Content-Length`.
pub async fn write_request<W>(
    writer: &mut W,
    req: &Request<Bytes>,
    form: TargetForm,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let target = match form {
        TargetForm::Absolute => req.uri().to_string(),
        TargetForm::Origin => {
            let mut t = req.uri().path().to_string();
            if t.is_empty() {
                t.push('/');
            }
            if let Some(q) = req.uri().query() {
                t.push('?');
                t.push_str(q);
            }
            t
        }
    };

    let mut out = BytesMut::with_capacity(256 + req.body().len());
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", req.method(), target).as_bytes());

    let mut headers = req.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(http::header::CONTENT_LENGTH);
    write_headers(&mut out, &headers);
    out.extend_from_slice(format!("content-length: {}\r\n", req.body().len()).as_bytes());
    out.extend_from_slice(b"connection: close\r\n\r\n");
    out.extend_from_slice(req.body());

    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

/// Serializes `res` onto `writer`. A body-less `res` (e.g. the synthetic
/// `200` for CONNECT) writes no `Content-Length` and no body bytes.
///
/// `closing` controls the wire-level `Connection` header explicitly rather
/// than trusting one the caller may have set on `res`: hop-by-hop stripping
/// removes any `Connection` the response already carries (e.g. forwarded
/// from the origin) before this function is the one to decide whether the
/// final header reads `close`, so the deliberate close signal a caller
/// wants (§4.5 step 4) always reaches the wire instead of being stripped
/// out from under it.
pub async fn write_response<W>(
    writer: &mut W,
    res: &Response<Bytes>,
    closing: bool,
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let reason = res.status().canonical_reason().unwrap_or("");
    let mut out = BytesMut::with_capacity(256 + res.body().len());
    out.extend_from_slice(format!("HTTP/1.1 {} {reason}\r\n", res.status().as_u16()).as_bytes());

    let mut headers = res.headers().clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(http::header::CONTENT_LENGTH);
    write_headers(&mut out, &headers);

    // A body-less 200 is exactly the synthetic CONNECT-established response
    // (§4.4), which must carry no Content-Length so it doesn't look like a
    // zero-length entity to the peer; every other response, including a
    // body-less error, still gets one.
    if !res.body().is_empty() || res.status() != StatusCode::OK {
        out.extend_from_slice(format!("content-length: {}\r\n", res.body().len()).as_bytes());
    }
    if closing {
        out.extend_from_slice(b"connection: close\r\n");
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(res.body());

    writer.write_all(&out).await?;
    writer.flush().await?;
    Ok(())
}

fn write_headers(out: &mut BytesMut, headers: &HeaderMap) {
    for (name, value) in headers.iter() {
        out.extend_from_slice(name.as_str().as_bytes());
        out.extend_from_slice(b": ");
        out.extend_from_slice(value.as_bytes());
        out.extend_from_slice(b"\r\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_simple_get_request() {
        let raw = b"GET http://example.test/a HTTP/1.1\r\nHost: example.test\r\n\r\n".to_vec();
        let mut reader = BufReader::new(&raw[..]);
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.method(), Method::GET);
        assert_eq!(req.uri().to_string(), "http://example.test/a");
        assert_eq!(req.headers().get("host").unwrap(), "example.test");
        assert!(req.body().is_empty());
    }

    #[tokio::test]
    async fn reads_request_with_body() {
        let raw = b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\n\r\nhello".to_vec();
        let mut reader = BufReader::new(&raw[..]);
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.body().as_ref(), b"hello");
    }

    #[tokio::test]
    async fn connect_leaves_trailing_bytes_unconsumed() {
        let raw = b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n\x16\x03\x01extra".to_vec();
        let mut reader = BufReader::new(&raw[..]);
        let req = read_request(&mut reader).await.unwrap();
        assert_eq!(req.method(), Method::CONNECT);
        assert!(req.body().is_empty());

        let mut remaining = Vec::new();
        reader.read_to_end(&mut remaining).await.unwrap();
        assert_eq!(remaining, b"\x16\x03\x01extra");
    }

    #[tokio::test]
    async fn rejects_chunked_bodies() {
        let raw =
            b"POST /x HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
                .to_vec();
        let mut reader = BufReader::new(&raw[..]);
        let err = read_request(&mut reader).await.unwrap_err();
        assert!(err.is_closeable());
    }

    #[tokio::test]
    async fn write_request_strips_hop_by_hop_and_uses_origin_form() {
        let req = Request::builder()
            .method(Method::GET)
            .uri("http://example.test/a?x=1")
            .header("Connection", "keep-alive")
            .header("X-Custom", "v")
            .body(Bytes::new())
            .unwrap();

        let mut out = Vec::new();
        write_request(&mut out, &req, TargetForm::Origin).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("GET /a?x=1 HTTP/1.1\r\n"));
        assert!(!text.to_lowercase().contains("connection: keep-alive"));
        assert!(text.contains("x-custom: v"));
    }

    #[tokio::test]
    async fn write_response_roundtrips_status_and_body() {
        let res = Response::builder()
            .status(StatusCode::OK)
            .header("X-A", "1")
            .body(Bytes::from_static(b"hi"))
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, &res, false).await.unwrap();
        let mut reader = BufReader::new(&out[..]);
        let parsed = read_response(&mut reader).await.unwrap();
        assert_eq!(parsed.status(), StatusCode::OK);
        assert_eq!(parsed.body().as_ref(), b"hi");
    }

    #[tokio::test]
    async fn write_response_closing_sets_connection_close() {
        let res = Response::builder().status(StatusCode::OK).body(Bytes::new()).unwrap();
        let mut out = Vec::new();
        write_response(&mut out, &res, true).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.to_lowercase().contains("connection: close"));
    }

    #[tokio::test]
    async fn write_response_not_closing_omits_connection_header() {
        let res = Response::builder()
            .status(StatusCode::OK)
            .header("Connection", "keep-alive")
            .body(Bytes::from_static(b"hi"))
            .unwrap();
        let mut out = Vec::new();
        write_response(&mut out, &res, false).await.unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.to_lowercase().contains("connection:"));
    }
}
