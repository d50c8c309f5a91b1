//! Per-connection [`Session`] and per-request [`Context`].
//!
//! Rather than the source's keyed side table (needed there because the
//! request/response objects are shared with a third-party HTTP stack and
//! must stay opaque), `Context` is threaded explicitly into the two modifier
//! hooks. Rust's borrow checker makes the "non-owning back-reference whose
//! lifetime is strictly shorter than the Session" invariant a compile-time
//! fact instead of a runtime one: `Context<'a>` simply borrows `&'a mut
//! Session`.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Per-connection state, created on accept and destroyed when the handler
/// returns. Owned exclusively by the task driving that connection.
#[derive(Debug)]
pub struct Session {
    id: u64,
    secure: bool,
    hijacked: bool,
}

impl Session {
    pub fn new() -> Self {
        Session {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            secure: false,
            hijacked: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Marks the session as carrying terminated TLS. Set once, on the MITM
    /// re-entry path; never unset.
    pub fn mark_secure(&mut self) {
        self.secure = true;
    }

    pub fn is_hijacked(&self) -> bool {
        self.hijacked
    }

    /// Declares that a modifier has taken ownership of the raw connection.
    /// After this call the core must not read or write the connection again
    /// for the remainder of the handler (enforced by callers checking
    /// [`Session::is_hijacked`] after every modifier invocation).
    pub fn hijack(&mut self) {
        self.hijacked = true;
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

/// Opaque attribute bag a modifier can stash request-scoped values in.
pub type Attributes = HashMap<String, Box<dyn Any + Send + Sync>>;

/// Per-request envelope. Re-created for every request on a connection,
/// including every re-entry after a MITM upgrade.
pub struct Context<'a> {
    session: &'a mut Session,
    skip_round_trip: bool,
    attrs: Attributes,
}

impl<'a> Context<'a> {
    pub fn new(session: &'a mut Session) -> Self {
        Context {
            session,
            skip_round_trip: false,
            attrs: HashMap::new(),
        }
    }

    pub fn session(&self) -> &Session {
        self.session
    }

    pub fn session_mut(&mut self) -> &mut Session {
        self.session
    }

    pub fn skip_round_trip(&self) -> bool {
        self.skip_round_trip
    }

    pub fn set_skip_round_trip(&mut self, skip: bool) {
        self.skip_round_trip = skip;
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, key: &str, value: T) {
        self.attrs.insert(key.to_string(), Box::new(value));
    }

    pub fn get<T: Any + Send + Sync>(&self, key: &str) -> Option<&T> {
        self.attrs.get(key).and_then(|v| v.downcast_ref::<T>())
    }

    /// Convenience used by the pipeline: hijack and immediately check.
    pub fn hijack(&mut self) {
        self.session.hijack();
    }

    pub fn is_hijacked(&self) -> bool {
        self.session.is_hijacked()
    }
}
