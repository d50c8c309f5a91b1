//! Core of an HTTP/1.x forward proxy with optional transparent MITM TLS
//! interception. The binary (`src/main.rs`) is a thin CLI wrapper around
//! this library; embedders construct a [`proxy::Proxy`] directly via
//! [`proxy::ProxyBuilder`] and supply their own modifiers, dialer, round
//! tripper, and MITM cert resolver.

pub mod accept;
pub mod connect;
pub mod dialer;
pub mod error;
pub mod handler;
pub mod http1;
pub mod mitm;
pub mod modifier;
pub mod pipeline;
pub mod proxy;
pub mod session;
pub mod shaping;
pub mod tls;
pub mod transport;
pub mod tunnel;

pub use dialer::{Dial, HttpRoundTripper, RoundTrip, TcpDialer};
pub use error::{CloseReason, ProxyError};
pub use mitm::{CertResolver, LoggingMitmErrorHook, MitmConfig, MitmErrorHook, RcgenCertResolver, TlsClosedHook};
pub use modifier::{NoopRequestModifier, NoopResponseModifier, RequestModifier, ResponseModifier};
pub use proxy::{Modifiers, Proxy, ProxyBuilder, ProxyConfig};
pub use session::{Context, Session};
pub use shaping::{TrafficShaped, UrlPattern};
pub use tls::FileCertResolver;
