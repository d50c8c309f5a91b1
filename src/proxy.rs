//! `Proxy`/`ProxyConfig`: the top-level entry point wiring the accept loop,
//! connection handler, and request pipeline together (§3 "Proxy
//! configuration", §4.6).
//!
//! The teacher's `Proxy` is a fixed mTLS terminate-and-redial sidecar with
//! mutable `server_cfg`/`client_cfg`/`app_cfg` fields set once in `new()`.
//! This proxy's configuration surface is much larger and pluggable (dialer,
//! round tripper, modifiers, MITM), so rather than a mutable struct guarded
//! at runtime, configuration is assembled through [`ProxyBuilder`] and
//! frozen into an immutable `Arc<ProxyConfig>` at [`ProxyBuilder::build`] —
//! the "one-shot guard" the spec allows for becomes a compile-time fact
//! instead of a runtime flag, the same trade the teacher's `Session`/
//! `Context` borrow-lifetime design made (see DESIGN.md).

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};
use url::Url;

use crate::accept;
use crate::dialer::{Dial, HttpRoundTripper, RoundTrip, TcpDialer};
use crate::error::ProxyError;
use crate::handler;
use crate::mitm::{MitmConfig, TlsClosedHook};
use crate::modifier::{NoopRequestModifier, NoopResponseModifier, RequestModifier, ResponseModifier};

const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

pub struct Modifiers {
    pub request: Arc<dyn RequestModifier>,
    pub response: Arc<dyn ResponseModifier>,
}

/// Immutable, fully-resolved proxy configuration (§3 "Proxy configuration").
pub struct ProxyConfig {
    pub idle_timeout: Duration,
    pub mitm: Option<MitmConfig>,
    pub downstream_proxy: Option<Url>,
    pub modifiers: Modifiers,
    pub dialer: Arc<dyn Dial>,
    pub round_tripper: Arc<dyn RoundTrip>,
    pub tls_closed_hook: Option<Arc<dyn TlsClosedHook>>,
}

pub struct ProxyBuilder {
    idle_timeout: Duration,
    mitm: Option<MitmConfig>,
    downstream_proxy: Option<Url>,
    request_modifier: Arc<dyn RequestModifier>,
    response_modifier: Arc<dyn ResponseModifier>,
    dialer: Option<Arc<dyn Dial>>,
    round_tripper: Option<Arc<dyn RoundTrip>>,
    tls_closed_hook: Option<Arc<dyn TlsClosedHook>>,
}

impl Default for ProxyBuilder {
    fn default() -> Self {
        ProxyBuilder {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            mitm: None,
            downstream_proxy: None,
            request_modifier: Arc::new(NoopRequestModifier),
            response_modifier: Arc::new(NoopResponseModifier),
            dialer: None,
            round_tripper: None,
            tls_closed_hook: None,
        }
    }
}

impl ProxyBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    pub fn mitm(mut self, mitm: MitmConfig) -> Self {
        self.mitm = Some(mitm);
        self
    }

    pub fn downstream_proxy(mut self, url: Url) -> Self {
        self.downstream_proxy = Some(url);
        self
    }

    pub fn request_modifier(mut self, modifier: Arc<dyn RequestModifier>) -> Self {
        self.request_modifier = modifier;
        self
    }

    pub fn response_modifier(mut self, modifier: Arc<dyn ResponseModifier>) -> Self {
        self.response_modifier = modifier;
        self
    }

    /// Installs a custom dialer. Overrides the default `TcpDialer` this
    /// builder would otherwise construct at [`Self::build`] time.
    pub fn dialer(mut self, dialer: Arc<dyn Dial>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Installs a custom round tripper. §4.6: a caller that does this still
    /// gets correct behavior from a *default* round tripper built by this
    /// same builder, because the default is constructed at `build()` time
    /// from whatever dialer/downstream-proxy were set last — not pinned
    /// eagerly when either setter ran.
    pub fn round_tripper(mut self, round_tripper: Arc<dyn RoundTrip>) -> Self {
        self.round_tripper = Some(round_tripper);
        self
    }

    pub fn tls_closed_hook(mut self, hook: Arc<dyn TlsClosedHook>) -> Self {
        self.tls_closed_hook = Some(hook);
        self
    }

    pub fn build(self) -> Proxy {
        let dialer = self.dialer.unwrap_or_else(|| {
            Arc::new(match &self.downstream_proxy {
                Some(url) => TcpDialer::via(url.clone()),
                None => TcpDialer::direct(),
            })
        });
        let round_tripper = self.round_tripper.unwrap_or_else(|| {
            Arc::new(HttpRoundTripper::new(dialer.clone(), self.downstream_proxy.clone()))
        });

        Proxy {
            config: Arc::new(ProxyConfig {
                idle_timeout: self.idle_timeout,
                mitm: self.mitm,
                downstream_proxy: self.downstream_proxy,
                modifiers: Modifiers {
                    request: self.request_modifier,
                    response: self.response_modifier,
                },
                dialer,
                round_tripper,
                tls_closed_hook: self.tls_closed_hook,
            }),
        }
    }
}

/// A fully assembled, immutable proxy ready to serve connections.
#[derive(Clone)]
pub struct Proxy {
    config: Arc<ProxyConfig>,
}

impl Proxy {
    /// Runs the accept loop (§4.1) against `listener` until `shutdown`
    /// fires. Each accepted connection is dispatched to its own task; the
    /// accept loop itself never blocks on a connection's lifetime.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ProxyError> {
        info!(addr = ?listener.local_addr().ok(), "proxy serving");
        let config = self.config.clone();

        accept::serve_accept(listener, shutdown.clone(), move |stream, peer_addr| {
            let config = config.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                handler::handle_connection(stream, peer_addr, config, shutdown).await;
            });
        })
        .await
        .inspect_err(|e| error!(error = %e, "accept loop terminated"))
    }
}
