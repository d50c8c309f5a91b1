//! Error taxonomy for the proxy core.
//!
//! The pipeline distinguishes three error kinds (see the module-level docs in
//! `accept.rs` and `pipeline.rs` for where each is produced/consumed):
//!
//! * [`ProxyError::Closeable`] — tear down the current connection, the server
//!   itself is unaffected.
//! * [`ProxyError::Transient`] — accept-loop only; retried with backoff.
//! * [`ProxyError::Fatal`] — terminates `serve`.

use std::io;

use thiserror::Error;

/// Reason a connection is being torn down. Carried by [`ProxyError::Closeable`]
/// purely for logging; callers match on the outer variant, not this reason.
#[derive(Debug)]
pub enum CloseReason {
    Eof,
    Idle,
    Cancelled,
    HeadersTooLarge,
    ForceClose,
    Io(io::Error),
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Eof => write!(f, "connection closed by peer"),
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::Cancelled => write!(f, "server shutting down"),
            CloseReason::HeadersTooLarge => write!(f, "request headers exceeded size limit"),
            CloseReason::ForceClose => write!(f, "forced close from traffic-shape layer"),
            CloseReason::Io(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("closeable: {0}")]
    Closeable(CloseReason),

    #[error("transient accept error: {0}")]
    Transient(#[source] io::Error),

    #[error("fatal: {0}")]
    Fatal(#[from] anyhow::Error),
}

impl ProxyError {
    pub fn closeable(reason: CloseReason) -> Self {
        ProxyError::Closeable(reason)
    }

    /// True for the internal `errClose` sentinel and the conditions the spec
    /// groups with it (EOF, closed pipe, net timeout).
    pub fn is_closeable(&self) -> bool {
        matches!(self, ProxyError::Closeable(_))
    }
}

impl From<io::Error> for ProxyError {
    fn from(e: io::Error) -> Self {
        use io::ErrorKind::*;
        match e.kind() {
            UnexpectedEof | ConnectionReset | ConnectionAborted | BrokenPipe => {
                ProxyError::Closeable(CloseReason::Io(e))
            }
            TimedOut => ProxyError::Closeable(CloseReason::Idle),
            _ => ProxyError::Closeable(CloseReason::Io(e)),
        }
    }
}

/// Sentinel returned in place of a "no error, but stop the loop" condition —
/// the Rust equivalent of the source's internal `errClose`.
pub fn err_close() -> ProxyError {
    ProxyError::Closeable(CloseReason::Eof)
}

/// A net-level error is "temporary" (worth an accept-loop retry with backoff)
/// when the OS reports resource exhaustion rather than a permanently broken
/// listener.
pub fn is_temporary(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock
            | io::ErrorKind::Interrupted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
    ) || e.raw_os_error().is_some_and(|code| {
        // EMFILE / ENFILE: the process or system is out of file descriptors.
        // These are exactly the conditions the accept loop should retry
        // rather than treat as fatal.
        matches!(code, 24 | 23)
    })
}
