//! Certificate/key file loading utilities and a disk-backed MITM
//! [`CertResolver`](crate::mitm::CertResolver).
//!
//! The teacher uses these readers to build a client-cert-verified
//! `ServerConfig`/`ClientConfig` pair for its mTLS sidecar. This proxy never
//! verifies a *client* certificate (§6: the MITM contract is a cert
//! resolver plus two error hooks, nothing about peer auth), so
//! `build_server_config`/`build_client_config` don't carry over. What does
//! carry over is the file-loading plumbing: [`FileCertResolver`] uses it to
//! load a real CA from disk instead of [`crate::mitm::RcgenCertResolver`]'s
//! throwaway in-memory one, so a deployment can MITM with a CA the client
//! fleet actually trusts.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::RootCertStore;
use rustls_pemfile::{certs, pkcs8_private_keys};

use crate::mitm::CertResolver;

pub fn cert_reader<P: AsRef<Path>>(cert_path: P) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let cert_file = File::open(cert_path)?;
    let mut reader = BufReader::new(cert_file);
    let parsed = certs(&mut reader);

    let certs: Result<Vec<CertificateDer>, _> =
        parsed.map(|res| res.map(CertificateDer::from)).collect();
    Ok(certs?)
}

pub fn privkey_reader<P: AsRef<Path>>(key_path: P) -> anyhow::Result<PrivateKeyDer<'static>> {
    let key_file = File::open(key_path.as_ref())?;
    let mut reader = BufReader::new(key_file);

    let key = pkcs8_private_keys(&mut reader)
        .next()
        .transpose()?
        .ok_or_else(|| anyhow::anyhow!("no PKCS8 key found in {}", key_path.as_ref().display()))?;

    Ok(PrivateKeyDer::Pkcs8(key))
}

pub fn load_root_store<P: AsRef<Path>>(ca_path: P) -> anyhow::Result<RootCertStore> {
    let ca_certs = cert_reader(&ca_path)?;

    let mut root_store = RootCertStore::empty();
    root_store.add_parsable_certificates(ca_certs);

    if root_store.is_empty() {
        anyhow::bail!("CA file did not contain any valid certs")
    }
    Ok(root_store)
}

/// Mints per-SNI leaf certificates signed by a CA loaded from disk, caching
/// the resulting `ServerConfig` per host exactly like
/// [`crate::mitm::RcgenCertResolver`]. The only difference is where the
/// signing key comes from.
pub struct FileCertResolver {
    ca_cert: rcgen::Certificate,
    ca_key: KeyPair,
    cache: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl FileCertResolver {
    pub fn load<P: AsRef<Path>>(ca_cert_path: P, ca_key_path: P) -> anyhow::Result<Self> {
        let cert_der = cert_reader(&ca_cert_path)?.into_iter().next().ok_or_else(|| {
            anyhow::anyhow!("no CA certificate found in {}", ca_cert_path.as_ref().display())
        })?;
        let key_der = privkey_reader(&ca_key_path)?;
        let key_bytes = match &key_der {
            PrivateKeyDer::Pkcs8(k) => k.secret_pkcs8_der().to_vec(),
            _ => anyhow::bail!("CA key must be PKCS8"),
        };

        let ca_key = KeyPair::try_from(key_bytes.as_slice())
            .map_err(|e| anyhow::anyhow!("CA private key is not usable for signing: {e}"))?;
        let params = CertificateParams::from_ca_cert_der(&cert_der)
            .map_err(|e| anyhow::anyhow!("failed to parse CA certificate: {e}"))?;
        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| anyhow::anyhow!("failed to re-derive CA certificate: {e}"))?;

        Ok(FileCertResolver {
            ca_cert,
            ca_key,
            cache: Mutex::new(HashMap::new()),
        })
    }

    fn mint(&self, sni: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        let mut params = CertificateParams::new(vec![sni.to_string()])?;
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, sni);
        params.distinguished_name = name;

        let leaf_key = KeyPair::generate()?;
        let leaf_cert = params.signed_by(&leaf_key, &self.ca_cert, &self.ca_key)?;

        let cert_der = CertificateDer::from(leaf_cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("failed to encode leaf private key: {e}"))?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert_der], key_der)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }
}

#[async_trait]
impl CertResolver for FileCertResolver {
    async fn server_config_for(&self, sni: &str) -> anyhow::Result<Arc<rustls::ServerConfig>> {
        if let Some(cfg) = self.cache.lock().unwrap().get(sni) {
            return Ok(cfg.clone());
        }
        let cfg = self.mint(sni)?;
        self.cache.lock().unwrap().insert(sni.to_string(), cfg.clone());
        Ok(cfg)
    }
}
