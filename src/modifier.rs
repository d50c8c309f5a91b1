//! The two-method modifier contract (§4, "Modifier contract").

use bytes::Bytes;
use http::{Request, Response};

use crate::session::Context;

/// Invoked once per non-synthetic request, immediately after scheme/host/
/// RemoteAddr stamping (§4.3 step 3). May mutate `req` in place, hijack the
/// session via `ctx`, or return an error — which the pipeline logs and
/// attaches as a `Warning` header rather than aborting the exchange.
pub trait RequestModifier: Send + Sync {
    fn modify_request(
        &self,
        req: &mut Request<Bytes>,
        ctx: &mut Context<'_>,
    ) -> anyhow::Result<()>;
}

/// Invoked once per response, immediately before it is written to the
/// client. Same hijack/error semantics as [`RequestModifier`].
pub trait ResponseModifier: Send + Sync {
    fn modify_response(
        &self,
        res: &mut Response<Bytes>,
        ctx: &mut Context<'_>,
    ) -> anyhow::Result<()>;
}

/// Default request modifier: does nothing.
pub struct NoopRequestModifier;

impl RequestModifier for NoopRequestModifier {
    fn modify_request(&self, _req: &mut Request<Bytes>, _ctx: &mut Context<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Default response modifier: does nothing.
pub struct NoopResponseModifier;

impl ResponseModifier for NoopResponseModifier {
    fn modify_response(
        &self,
        _res: &mut Response<Bytes>,
        _ctx: &mut Context<'_>,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Attaches `err` as a `Warning` header (RFC 7234 style: code, agent, text)
/// and logs it. Used uniformly for modifier errors, dial errors, and
/// round-trip errors per §7.
pub fn attach_warning<T>(res: &mut Response<T>, agent: &str, err: &dyn std::fmt::Display) {
    let value = format!("199 {agent} \"{err}\"");
    if let Ok(hv) = http::HeaderValue::from_str(&value) {
        res.headers_mut().insert(http::header::WARNING, hv);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Session;

    #[test]
    fn noop_modifiers_do_nothing() {
        let mut session = Session::new();
        let mut ctx = Context::new(&mut session);
        let mut req = Request::builder().uri("/").body(Bytes::new()).unwrap();
        NoopRequestModifier.modify_request(&mut req, &mut ctx).unwrap();

        let mut res = Response::new(Bytes::new());
        NoopResponseModifier.modify_response(&mut res, &mut ctx).unwrap();
        assert!(!ctx.is_hijacked());
    }

    #[test]
    fn attach_warning_sets_header() {
        let mut res = Response::new(Bytes::new());
        attach_warning(&mut res, "proxy", &"boom");
        let hv = res.headers().get(http::header::WARNING).unwrap();
        assert!(hv.to_str().unwrap().contains("boom"));
    }
}
