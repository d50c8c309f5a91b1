//! End-to-end coverage of the numbered scenarios: clear HTTP, blind CONNECT
//! tunnel, and MITM CONNECT with TLS termination and pipeline re-entry.

mod common;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{CannedRoundTripper, DuplexTransport, OneShotDialer, RecordingRoundTripper, UnusedRoundTripper};
use hallway_proxy::dialer::TcpDialer;
use hallway_proxy::mitm::{LoggingMitmErrorHook, MitmConfig, RcgenCertResolver};
use hallway_proxy::modifier::{NoopRequestModifier, NoopResponseModifier};
use hallway_proxy::pipeline::{self, PipelineOutcome};
use hallway_proxy::proxy::{Modifiers, ProxyConfig};
use hallway_proxy::session::Session;
use hallway_proxy::transport::BoxedTransport;
use hallway_proxy::{connect, http1};
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::sync::watch;

fn plain_config(round_tripper: Arc<dyn hallway_proxy::dialer::RoundTrip>) -> ProxyConfig {
    ProxyConfig {
        idle_timeout: Duration::from_secs(5),
        mitm: None,
        downstream_proxy: None,
        modifiers: Modifiers {
            request: Arc::new(NoopRequestModifier),
            response: Arc::new(NoopResponseModifier),
        },
        dialer: Arc::new(TcpDialer::direct()),
        round_tripper,
        tls_closed_hook: None,
    }
}

/// Scenario 1: clear HTTP GET, no modifiers, origin replies 200.
#[tokio::test]
async fn clear_http_get_round_trips() {
    let (proxy_side, mut client_side) = tokio::io::duplex(4096);
    client_side
        .write_all(b"GET http://example.test/a HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();

    let transport: BoxedTransport = Box::new(DuplexTransport(proxy_side));
    let stream = BufReader::new(transport);
    let mut session = Session::new();
    let (_tx, mut cancelled) = watch::channel(false);
    let config = plain_config(Arc::new(CannedRoundTripper { status: 200, body: Bytes::from_static(b"hello") }));

    let outcome = pipeline::run_once(stream, &mut session, &config, None, &mut cancelled)
        .await
        .unwrap();
    assert!(matches!(outcome, PipelineOutcome::Continue(_)));

    let mut buf = vec![0u8; 512];
    let n = client_side.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.contains("hello"));
}

/// Scenario 5: the round tripper fails, the client still gets a `502` with a
/// `Warning` header rather than a dropped connection.
#[tokio::test]
async fn round_trip_failure_synthesizes_502() {
    struct FailingRoundTripper;
    #[async_trait::async_trait]
    impl hallway_proxy::dialer::RoundTrip for FailingRoundTripper {
        async fn round_trip(
            &self,
            _req: http::Request<Bytes>,
        ) -> Result<http::Response<Bytes>, hallway_proxy::ProxyError> {
            Err(hallway_proxy::ProxyError::Fatal(anyhow::anyhow!("origin unreachable")))
        }
    }

    let (proxy_side, mut client_side) = tokio::io::duplex(4096);
    client_side
        .write_all(b"GET http://example.test/a HTTP/1.1\r\nHost: example.test\r\n\r\n")
        .await
        .unwrap();

    let transport: BoxedTransport = Box::new(DuplexTransport(proxy_side));
    let stream = BufReader::new(transport);
    let mut session = Session::new();
    let (_tx, mut cancelled) = watch::channel(false);
    let config = plain_config(Arc::new(FailingRoundTripper));

    pipeline::run_once(stream, &mut session, &config, None, &mut cancelled).await.unwrap();

    let mut buf = vec![0u8; 512];
    let n = client_side.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 502"));
    assert!(text.to_lowercase().contains("warning:"));
}

/// Scenario 2: blind CONNECT tunnel, no MITM — the proxy answers `200` then
/// relays bytes verbatim in both directions.
#[tokio::test]
async fn blind_connect_tunnel_relays_bytes() {
    let (proxy_side, mut client_side) = tokio::io::duplex(4096);
    let (origin_proxy_side, mut origin_side) = tokio::io::duplex(4096);

    client_side
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let transport: BoxedTransport = Box::new(DuplexTransport(proxy_side));
    let mut stream = BufReader::new(transport);
    let req = http1::read_request(&mut stream).await.unwrap();

    let origin_transport: BoxedTransport = Box::new(DuplexTransport(origin_proxy_side));
    let config = ProxyConfig {
        idle_timeout: Duration::from_secs(5),
        mitm: None,
        downstream_proxy: None,
        modifiers: Modifiers {
            request: Arc::new(NoopRequestModifier),
            response: Arc::new(NoopResponseModifier),
        },
        dialer: Arc::new(OneShotDialer::new(origin_transport)),
        round_tripper: Arc::new(UnusedRoundTripper),
        tls_closed_hook: None,
    };

    let mut session = Session::new();
    let handle = tokio::spawn(async move {
        connect::handle_blind_tunnel(stream, req, &mut session, &config).await
    });

    let mut buf = vec![0u8; 256];
    let n = client_side.read(&mut buf).await.unwrap();
    assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

    client_side.write_all(b"ping").await.unwrap();
    let mut ping = [0u8; 4];
    origin_side.read_exact(&mut ping).await.unwrap();
    assert_eq!(&ping, b"ping");

    origin_side.write_all(b"pong").await.unwrap();
    let mut pong = [0u8; 4];
    client_side.read_exact(&mut pong).await.unwrap();
    assert_eq!(&pong, b"pong");

    drop(client_side);
    drop(origin_side);

    let outcome = handle.await.unwrap().unwrap();
    assert!(matches!(outcome, PipelineOutcome::Close));
}

/// Scenario 5, CONNECT variant: dial fails, proxy answers `502` and never
/// relays.
#[tokio::test]
async fn blind_connect_dial_failure_synthesizes_502_and_closes() {
    struct AlwaysFailDialer;
    #[async_trait::async_trait]
    impl hallway_proxy::dialer::Dial for AlwaysFailDialer {
        async fn dial(&self, _addr: &str) -> Result<BoxedTransport, hallway_proxy::ProxyError> {
            Err(hallway_proxy::ProxyError::Fatal(anyhow::anyhow!("connection refused")))
        }
    }

    let (proxy_side, mut client_side) = tokio::io::duplex(4096);
    client_side
        .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
        .await
        .unwrap();

    let transport: BoxedTransport = Box::new(DuplexTransport(proxy_side));
    let mut stream = BufReader::new(transport);
    let req = http1::read_request(&mut stream).await.unwrap();

    let config = ProxyConfig {
        idle_timeout: Duration::from_secs(5),
        mitm: None,
        downstream_proxy: None,
        modifiers: Modifiers {
            request: Arc::new(NoopRequestModifier),
            response: Arc::new(NoopResponseModifier),
        },
        dialer: Arc::new(AlwaysFailDialer),
        round_tripper: Arc::new(UnusedRoundTripper),
        tls_closed_hook: None,
    };
    let mut session = Session::new();

    let outcome = connect::handle_blind_tunnel(stream, req, &mut session, &config).await.unwrap();
    assert!(matches!(outcome, PipelineOutcome::Close));

    let mut buf = vec![0u8; 256];
    let n = client_side.read(&mut buf).await.unwrap();
    let text = String::from_utf8_lossy(&buf[..n]);
    assert!(text.starts_with("HTTP/1.1 502"));
}

/// Scenario 3: MITM CONNECT with TLS. The client performs a real TLS
/// handshake against the minted certificate, trusting the resolver's CA,
/// then re-enters the pipeline and gets a request stamped `https`.
#[tokio::test]
async fn mitm_connect_terminates_tls_and_restamps_https() {
    let resolver = Arc::new(RcgenCertResolver::generate().unwrap());
    let ca_der = rustls::pki_types::CertificateDer::from(resolver.ca_certificate_der().der().to_vec());

    let (proxy_side, client_side) = tokio::io::duplex(16384);

    let client_task = tokio::spawn(async move {
        let mut client_side = client_side;
        client_side
            .write_all(b"CONNECT example.test:443 HTTP/1.1\r\nHost: example.test:443\r\n\r\n")
            .await
            .unwrap();

        let mut buf = vec![0u8; 256];
        let n = client_side.read(&mut buf).await.unwrap();
        assert!(String::from_utf8_lossy(&buf[..n]).starts_with("HTTP/1.1 200"));

        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca_der).unwrap();
        let client_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        let connector = tokio_rustls::TlsConnector::from(Arc::new(client_config));
        let server_name = rustls::pki_types::ServerName::try_from("example.test").unwrap().to_owned();
        let mut tls_stream = connector.connect(server_name, client_side).await.unwrap();

        tls_stream
            .write_all(b"GET /secret HTTP/1.1\r\nHost: example.test\r\n\r\n")
            .await
            .unwrap();
        let mut resp = vec![0u8; 256];
        let n = tls_stream.read(&mut resp).await.unwrap();
        String::from_utf8_lossy(&resp[..n]).to_string()
    });

    let transport: BoxedTransport = Box::new(DuplexTransport(proxy_side));
    let mut stream = BufReader::new(transport);
    let req = http1::read_request(&mut stream).await.unwrap();

    let mitm = MitmConfig { cert_resolver: resolver.clone(), error_hook: Arc::new(LoggingMitmErrorHook) };
    let round_tripper = Arc::new(RecordingRoundTripper::new(Bytes::from_static(b"secret-body")));
    let config = ProxyConfig {
        idle_timeout: Duration::from_secs(5),
        mitm: Some(mitm),
        downstream_proxy: None,
        modifiers: Modifiers {
            request: Arc::new(NoopRequestModifier),
            response: Arc::new(NoopResponseModifier),
        },
        dialer: Arc::new(TcpDialer::direct()),
        round_tripper: round_tripper.clone(),
        tls_closed_hook: None,
    };

    let mut session = Session::new();
    let outcome = connect::handle_mitm(stream, req, &mut session, &config, config.mitm.as_ref().unwrap())
        .await
        .unwrap();

    let new_transport = match outcome {
        PipelineOutcome::Reenter(t) => t,
        _ => panic!("expected Reenter after TLS termination"),
    };

    let reentered = BufReader::new(new_transport);
    let (_tx, mut cancelled) = watch::channel(false);
    let reentry_outcome = pipeline::run_once(reentered, &mut session, &config, None, &mut cancelled)
        .await
        .unwrap();
    assert!(matches!(reentry_outcome, PipelineOutcome::Continue(_)));
    assert!(session.is_secure());
    assert_eq!(round_tripper.last_scheme.lock().unwrap().as_deref(), Some("https"));

    let client_response = client_task.await.unwrap();
    assert!(client_response.starts_with("HTTP/1.1 200"));
    assert!(client_response.contains("secret-body"));
}
