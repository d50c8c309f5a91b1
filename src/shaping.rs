//! Traffic-shape integration contract (§4.5 step 5, §6 "Traffic-shape
//! capability").
//!
//! The shaping transport itself — the thing that actually throttles writes
//! byte-range by byte-range — is an external collaborator (§1, out of
//! scope). The core only needs to: detect the capability on the current
//! transport, match the request URL against configured buckets, read a
//! recognized `Range` start off the response, and hand the bucket a
//! [`ShapingContext`] before the response is written.

use http::{HeaderMap, Uri};
use regex::Regex;

/// One throttle bucket: a URL pattern plus the bandwidth to apply to
/// matching responses.
pub struct UrlPattern {
    pub name: String,
    pub pattern: Regex,
    pub bandwidth_bytes_per_sec: u64,
}

impl UrlPattern {
    pub fn matches(&self, uri: &Uri) -> bool {
        self.pattern.is_match(&uri.to_string())
    }
}

/// Populated on the transport immediately before the response is written
/// (§4.5 step 5): which bucket applies, where in the resource this response
/// starts, how many header bytes precede the body, and whether the bucket
/// should throttle starting now.
#[derive(Debug, Clone)]
pub struct ShapingContext {
    pub bucket_name: String,
    pub range_start: u64,
    pub response_header_len: usize,
    pub throttle_now: bool,
}

/// Capability exposed by a connection that supports byte-range throttling.
/// The proxy never throttles directly; it only supplies the context the
/// shaping transport itself consumes on subsequent writes.
pub trait TrafficShaped: Send {
    fn patterns(&self) -> &[UrlPattern];

    /// Current throttle bandwidth (bytes/sec) for a given byte offset into
    /// the resource being served, if throttling is active right now.
    fn current_throttle(&self, byte_offset: u64) -> Option<u64>;

    fn set_context(&mut self, ctx: ShapingContext);

    fn set_bucket_capacity(&mut self, bytes_per_sec: u64);
}

/// Parses a `Range: bytes=<start>-` request header into its start offset.
/// Only the single-range, open-ended form is "recognized" per §4.5 step 5;
/// multi-range and suffix-range requests are not shaped.
pub fn recognized_range_start(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(http::header::RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes=")?;
    if spec.contains(',') {
        return None;
    }
    let (start, _end) = spec.split_once('-')?;
    start.trim().parse().ok()
}

/// §4.5 step 5 in full: find the first matching pattern for `uri`, and if
/// the response carries a recognized `Range` start, populate the shaping
/// context.
pub fn apply_shaping(
    shaped: &mut dyn TrafficShaped,
    uri: &Uri,
    response_headers: &HeaderMap,
    response_header_len: usize,
) {
    let Some(range_start) = recognized_range_start_from_response(response_headers) else {
        return;
    };

    let pattern = shaped.patterns().iter().find(|p| p.matches(uri));
    let Some(pattern) = pattern else { return };

    let throttle_now = shaped.current_throttle(range_start);
    let bandwidth = pattern.bandwidth_bytes_per_sec;
    let name = pattern.name.clone();

    shaped.set_context(ShapingContext {
        bucket_name: name,
        range_start,
        response_header_len,
        throttle_now: throttle_now.is_some(),
    });

    if throttle_now.is_some() {
        shaped.set_bucket_capacity(bandwidth);
    }
}

/// Responses answer with `Content-Range: bytes <start>-<end>/<total>`
/// rather than echoing `Range`; recognize that form here.
fn recognized_range_start_from_response(headers: &HeaderMap) -> Option<u64> {
    let value = headers.get(http::header::CONTENT_RANGE)?.to_str().ok()?;
    let spec = value.strip_prefix("bytes ")?;
    let (start, _rest) = spec.split_once('-')?;
    start.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeShaped {
        patterns: Vec<UrlPattern>,
        ctx: Option<ShapingContext>,
        capacity: Option<u64>,
        throttle: Option<u64>,
    }

    impl TrafficShaped for FakeShaped {
        fn patterns(&self) -> &[UrlPattern] {
            &self.patterns
        }
        fn current_throttle(&self, _byte_offset: u64) -> Option<u64> {
            self.throttle
        }
        fn set_context(&mut self, ctx: ShapingContext) {
            self.ctx = Some(ctx);
        }
        fn set_bucket_capacity(&mut self, bytes_per_sec: u64) {
            self.capacity = Some(bytes_per_sec);
        }
    }

    #[test]
    fn range_start_parses_open_ended_request_range() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RANGE, "bytes=1024-".parse().unwrap());
        assert_eq!(recognized_range_start(&headers), Some(1024));
    }

    #[test]
    fn range_start_rejects_multi_range() {
        let mut headers = HeaderMap::new();
        headers.insert(http::header::RANGE, "bytes=0-10,20-30".parse().unwrap());
        assert_eq!(recognized_range_start(&headers), None);
    }

    #[test]
    fn apply_shaping_sets_context_on_match() {
        let mut shaped = FakeShaped {
            patterns: vec![UrlPattern {
                name: "videos".into(),
                pattern: Regex::new("\\.mp4$").unwrap(),
                bandwidth_bytes_per_sec: 1_000_000,
            }],
            ctx: None,
            capacity: None,
            throttle: Some(1_000_000),
        };

        let uri: Uri = "http://example.test/a.mp4".parse().unwrap();
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(
            http::header::CONTENT_RANGE,
            "bytes 2048-4095/8192".parse().unwrap(),
        );

        apply_shaping(&mut shaped, &uri, &resp_headers, 128);

        let ctx = shaped.ctx.expect("context set");
        assert_eq!(ctx.bucket_name, "videos");
        assert_eq!(ctx.range_start, 2048);
        assert_eq!(ctx.response_header_len, 128);
        assert!(ctx.throttle_now);
        assert_eq!(shaped.capacity, Some(1_000_000));
    }

    #[test]
    fn apply_shaping_skips_unmatched_uri() {
        let mut shaped = FakeShaped {
            patterns: vec![UrlPattern {
                name: "videos".into(),
                pattern: Regex::new("\\.mp4$").unwrap(),
                bandwidth_bytes_per_sec: 1_000_000,
            }],
            ctx: None,
            capacity: None,
            throttle: None,
        };
        let uri: Uri = "http://example.test/a.txt".parse().unwrap();
        let mut resp_headers = HeaderMap::new();
        resp_headers.insert(
            http::header::CONTENT_RANGE,
            "bytes 0-10/100".parse().unwrap(),
        );
        apply_shaping(&mut shaped, &uri, &resp_headers, 64);
        assert!(shaped.ctx.is_none());
    }
}
