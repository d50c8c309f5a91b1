//! MITM capability contract (§6 "MITM capability") and a default
//! certificate resolver usable out of the box for tests and local
//! development.
//!
//! The spec treats certificate minting as an external collaborator; the
//! core only consumes a per-host `ServerConfig` producer plus two error
//! hooks. [`RcgenCertResolver`] is one concrete, self-contained
//! implementation of that producer — grounded in the teacher's own
//! dev-dependency on `rcgen` for throwaway certs — so the crate is usable
//! without wiring up a real CA.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use tracing::error;

/// Producer of a per-SNI TLS server configuration for the client-facing
/// handshake (§4.4.1 step 5).
#[async_trait]
pub trait CertResolver: Send + Sync {
    async fn server_config_for(&self, sni: &str) -> anyhow::Result<Arc<rustls::ServerConfig>>;
}

/// Invoked when the client-facing TLS handshake itself fails (§4.4.1 step
/// 5, "On handshake error, invoke the MITM error callback").
pub trait MitmErrorHook: Send + Sync {
    fn on_handshake_error(&self, sni: &str, err: &anyhow::Error);
}

/// Invoked with (session id omitted — caller has it via the session),
/// SNI, error) when a terminated-TLS client connection fails to parse a
/// request (§4.3 stage 1, "TLS-closed-connection error callback").
pub trait TlsClosedHook: Send + Sync {
    fn on_closed(&self, sni: Option<&str>, err: &anyhow::Error);
}

pub struct LoggingMitmErrorHook;

impl MitmErrorHook for LoggingMitmErrorHook {
    fn on_handshake_error(&self, sni: &str, err: &anyhow::Error) {
        error!(sni, error = %err, "MITM handshake failed");
    }
}

/// Bundles the MITM collaborators behind one config object, matching §3
/// "MITM config (optional)".
pub struct MitmConfig {
    pub cert_resolver: Arc<dyn CertResolver>,
    pub error_hook: Arc<dyn MitmErrorHook>,
}

/// Mints a fresh leaf certificate per SNI, signed by an in-memory root CA,
/// and caches the resulting `ServerConfig` so repeat handshakes to the same
/// host don't re-sign. Not meant to survive a restart — exactly the "no
/// persistent proxy state" non-goal.
pub struct RcgenCertResolver {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl RcgenCertResolver {
    /// Generates a fresh throwaway root CA. Real deployments should load a
    /// CA the client's trust store actually trusts; this constructor exists
    /// so the crate has a usable default without one.
    pub fn generate() -> anyhow::Result<Self> {
        let mut params = CertificateParams::new(Vec::<String>::new())?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "hallway-proxy MITM root");
        params.distinguished_name = name;
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        let ca_key = KeyPair::generate()?;
        let ca_cert = params.self_signed(&ca_key)?;

        Ok(RcgenCertResolver {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_certificate_der(&self) -> &rcgen::Certificate {
        &self.ca_cert
    }

    fn mint(&self, sni: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let mut params = CertificateParams::new(vec![sni.to_string()])?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, sni);
        params.distinguished_name = name;

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let cert_der = rustls::pki_types::CertificateDer::from(leaf_cert.der().to_vec());
        let key_der =
            rustls::pki_types::PrivateKeyDer::try_from(leaf_key.serialize_der()).map_err(|e| {
                anyhow::anyhow!("failed to encode leaf private key: {e}")
            })?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

#[async_trait]
impl CertResolver for RcgenCertResolver {
    async fn server_config_for(&self, sni: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        if let Some(cfg) = self.cache.lock().unwrap().get(sni) {
            return Ok(cfg.clone());
        }
        let cfg = self.mint(sni)?;
        self.cache.lock().unwrap().insert(sni.to_string(), cfg.clone());
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mints_and_caches_per_sni() {
        let resolver = RcgenCertResolver::generate().unwrap();
        let a = resolver.server_config_for("example.test").await.unwrap();
        let b = resolver.server_config_for("example.test").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = resolver.server_config_for("other.test").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
