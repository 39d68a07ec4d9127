//! Integration tests for `mtlsgate`
//!
//! These tests verify end-to-end functionality including:
//! - Full mTLS handshake with CN-based identity
//! - Authorization and rate-limit dispositions at the listener
//! - Least-connections distribution and count release
//! - Half-close semantics of the relay

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsConnector;

use mtlsgate::authorizer::Authorizer;
use mtlsgate::config::TlsConfig;
use mtlsgate::forwarder::Forwarder;
use mtlsgate::listener::run_listener;
use mtlsgate::rate_limiter::RateLimiter;
use mtlsgate::tls::TlsProvider;
use mtlsgate::tls_acceptor::AuthenticatedTlsAcceptor;

const QUARANTINE: Duration = Duration::from_secs(5);
const DIAL_TIMEOUT: Duration = Duration::from_secs(1);

/// Test certificate authority plus helpers to mint identities from it
struct TestCa {
    cert: rcgen::Certificate,
    key: rcgen::KeyPair,
}

impl TestCa {
    fn new() -> Self {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
        params.key_usages = vec![
            rcgen::KeyUsagePurpose::KeyCertSign,
            rcgen::KeyUsagePurpose::DigitalSignature,
        ];
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "mtlsgate test ca");
        let cert = params.self_signed(&key).unwrap();
        Self { cert, key }
    }

    /// Write a CA-signed server certificate for localhost plus the CA bundle
    /// to temp files, returning a TlsConfig pointing at them.
    fn server_tls_config(&self, tag: &str) -> TlsConfig {
        let server_key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ServerAuth];
        let server_cert = params.signed_by(&server_key, &self.cert, &self.key).unwrap();

        TlsConfig {
            cert_path: write_temp(tag, "server.pem", &server_cert.pem()),
            key_path: write_temp(tag, "server.key", &server_key.serialize_pem()),
            ca_cert_path: write_temp(tag, "ca.pem", &self.cert.pem()),
        }
    }

    /// Mint a client identity with the given Common Name
    fn client_identity(&self, cn: &str) -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
        let key = rcgen::KeyPair::generate().unwrap();
        let mut params = rcgen::CertificateParams::new(Vec::new()).unwrap();
        params.distinguished_name = rcgen::DistinguishedName::new();
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        params.extended_key_usages = vec![rcgen::ExtendedKeyUsagePurpose::ClientAuth];
        let cert = params.signed_by(&key, &self.cert, &self.key).unwrap();

        (
            cert.der().clone(),
            PrivateKeyDer::Pkcs8(key.serialize_der().into()),
        )
    }

    /// rustls client configuration presenting the given Common Name
    fn client_config(&self, cn: &str) -> Arc<rustls::ClientConfig> {
        let mut roots = rustls::RootCertStore::empty();
        roots.add(self.cert.der().clone()).unwrap();

        let (cert, key) = self.client_identity(cn);
        let config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(vec![cert], key)
            .unwrap();
        Arc::new(config)
    }
}

fn write_temp(tag: &str, name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!(
        "mtlsgate-it-{}-{}-{}",
        std::process::id(),
        tag,
        name
    ));
    std::fs::write(&path, contents).unwrap();
    path
}

fn install_test_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}

/// Accept connections forever; echo each one until EOF.
async fn spawn_echo_upstream() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if socket.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Reserve an ephemeral port, then release it for the listener under test.
async fn reserve_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// Spin up the full listener pipeline; returns its address and the shared
/// components for assertions.
async fn spawn_gateway(
    tag: &str,
    ca: &TestCa,
    upstreams: Vec<String>,
    clients: Vec<(&str, Vec<String>)>,
    burst: u32,
) -> (SocketAddr, Arc<Forwarder>, Arc<RateLimiter>) {
    let tls_config = ca.server_tls_config(tag);
    let provider = TlsProvider::new(&tls_config).unwrap();
    let acceptor = AuthenticatedTlsAcceptor::new(provider.server_config());

    let forwarder = Arc::new(Forwarder::new(upstreams, QUARANTINE, DIAL_TIMEOUT));
    let limiter = Arc::new(RateLimiter::new(burst, 1.0));
    let authorizer = Arc::new(Authorizer::new());
    for (cn, allowed) in clients {
        authorizer.register(cn, allowed);
    }

    let addr = reserve_addr().await;
    tokio::spawn(run_listener(
        addr,
        acceptor,
        authorizer,
        limiter.clone(),
        forwarder.clone(),
    ));

    // Give the listener a moment to bind.
    tokio::time::sleep(Duration::from_millis(200)).await;

    (addr, forwarder, limiter)
}

/// TLS-connect to the gateway with the given client identity
async fn connect_client(
    addr: SocketAddr,
    config: Arc<rustls::ClientConfig>,
) -> tokio_rustls::client::TlsStream<TcpStream> {
    let connector = TlsConnector::from(config);
    let tcp = TcpStream::connect(addr).await.unwrap();
    connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap()
}

/// Read until the peer closes; tolerate either clean EOF or reset.
async fn read_to_close(stream: &mut tokio_rustls::client::TlsStream<TcpStream>) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        match tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf)).await {
            Ok(Ok(0)) | Ok(Err(_)) | Err(_) => break,
            Ok(Ok(n)) => data.extend_from_slice(&buf[..n]),
        }
    }
    data
}

#[tokio::test]
async fn test_mtls_client_is_relayed_to_upstream() {
    install_test_crypto_provider();

    let ca = TestCa::new();
    let echo = spawn_echo_upstream().await.to_string();
    let (addr, forwarder, _) = spawn_gateway(
        "relay",
        &ca,
        vec![echo.clone()],
        vec![("frontend.example", vec![echo.clone()])],
        3,
    )
    .await;

    let mut stream = connect_client(addr, ca.client_config("frontend.example")).await;

    stream.write_all(b"hello through the gate").await.unwrap();
    let mut reply = [0u8; 22];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"hello through the gate");

    stream.shutdown().await.unwrap();
    drop(stream);

    // Count returns to zero within a bounded time once the peer closes.
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if forwarder.active_count(&echo) == Some(0) {
            break;
        }
        assert!(Instant::now() < deadline, "count was not released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_unknown_client_is_dropped_without_consuming_a_token() {
    install_test_crypto_provider();

    let ca = TestCa::new();
    let echo = spawn_echo_upstream().await.to_string();
    let (addr, _, limiter) = spawn_gateway(
        "unknown",
        &ca,
        vec![echo.clone()],
        vec![("frontend.example", vec![echo])],
        1,
    )
    .await;

    // "stranger" is absent from the allow-list: handshake completes, then the
    // connection is closed without any data.
    let mut stream = connect_client(addr, ca.client_config("stranger")).await;
    let data = read_to_close(&mut stream).await;
    assert!(data.is_empty());

    // The rejection happened before the limiter: the stranger's bucket is
    // still full (burst = 1).
    assert!(limiter.admit("stranger"));
}

#[tokio::test]
async fn test_rate_limit_burst_then_denial() {
    install_test_crypto_provider();

    let ca = TestCa::new();
    let echo = spawn_echo_upstream().await.to_string();
    let (addr, _, _) = spawn_gateway(
        "burst",
        &ca,
        vec![echo.clone()],
        vec![("frontend.example", vec![echo])],
        2,
    )
    .await;

    let config = ca.client_config("frontend.example");

    // First two connections are admitted and served.
    for _ in 0..2 {
        let mut stream = connect_client(addr, config.clone()).await;
        stream.write_all(b"ok?").await.unwrap();
        let mut reply = [0u8; 3];
        stream.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok?");
        stream.shutdown().await.unwrap();
    }

    // The third back-to-back connection exhausts the bucket and is closed
    // before any dial: no echo comes back.
    let mut stream = connect_client(addr, config).await;
    stream.write_all(b"ok?").await.ok();
    let data = read_to_close(&mut stream).await;
    assert!(data.is_empty());
}

#[tokio::test]
async fn test_least_connections_distribution_across_upstreams() {
    let a = spawn_echo_upstream().await.to_string();
    let b = spawn_echo_upstream().await.to_string();
    let c = spawn_echo_upstream().await.to_string();
    let upstreams = vec![a.clone(), b.clone(), c.clone()];

    let forwarder = Arc::new(Forwarder::new(
        upstreams.clone(),
        QUARANTINE,
        DIAL_TIMEOUT,
    ));

    // Open three sessions, waiting for each to land before starting the next
    // so the selection sees the updated counts.
    let mut locals = Vec::new();
    for expected_total in 1..=3usize {
        let (local, remote) = tokio::io::duplex(1024);
        locals.push(local);

        let task_forwarder = forwarder.clone();
        let allowed = upstreams.clone();
        tokio::spawn(async move {
            let _ = task_forwarder.relay(remote, &allowed).await;
        });

        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            let total: usize = upstreams
                .iter()
                .filter_map(|u| forwarder.active_count(u))
                .sum();
            if total == expected_total {
                break;
            }
            assert!(Instant::now() < deadline, "session did not start");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    // Ties broken in allow-list order: every upstream holds exactly one.
    assert_eq!(forwarder.active_count(&a), Some(1));
    assert_eq!(forwarder.active_count(&b), Some(1));
    assert_eq!(forwarder.active_count(&c), Some(1));

    // Close all client sides; every count must return to zero.
    for mut local in locals {
        local.shutdown().await.unwrap();
        drop(local);
    }
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let total: usize = upstreams
            .iter()
            .filter_map(|u| forwarder.active_count(u))
            .sum();
        if total == 0 {
            break;
        }
        assert!(Instant::now() < deadline, "counts were not released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_failover_skips_quarantined_upstream_until_window_elapses() {
    // A refusing upstream: bound then released, so dials are rejected.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().to_string()
    };
    let live = spawn_echo_upstream().await.to_string();

    let quarantine = Duration::from_millis(300);
    let forwarder = Arc::new(Forwarder::new(
        vec![dead.clone(), live.clone()],
        quarantine,
        DIAL_TIMEOUT,
    ));
    let allowed = vec![dead.clone(), live.clone()];

    // First session: attempt dead (fail -> quarantine), then live succeeds.
    let (mut local, remote) = tokio::io::duplex(1024);
    let session = tokio::spawn({
        let forwarder = forwarder.clone();
        let allowed = allowed.clone();
        async move { forwarder.relay(remote, &allowed).await.map(|s| s.upstream) }
    });
    local.shutdown().await.unwrap();
    drop(local);
    assert_eq!(session.await.unwrap().unwrap(), live);
    assert!(forwarder.is_quarantined(&dead));

    // Within the window the dead upstream is skipped outright, even though
    // its count (0) is the minimum.
    let (mut local, remote) = tokio::io::duplex(1024);
    let session = tokio::spawn({
        let forwarder = forwarder.clone();
        let allowed = allowed.clone();
        async move { forwarder.relay(remote, &allowed).await.map(|s| s.upstream) }
    });
    local.shutdown().await.unwrap();
    drop(local);
    assert_eq!(session.await.unwrap().unwrap(), live);

    // After the window the dead upstream is eligible again (and fails again).
    tokio::time::sleep(quarantine + Duration::from_millis(100)).await;
    assert!(!forwarder.is_quarantined(&dead));

    let (mut local, remote) = tokio::io::duplex(1024);
    let session = tokio::spawn({
        let forwarder = forwarder.clone();
        let allowed = allowed.clone();
        async move { forwarder.relay(remote, &allowed).await.map(|s| s.upstream) }
    });
    local.shutdown().await.unwrap();
    drop(local);
    assert_eq!(session.await.unwrap().unwrap(), live);
    assert!(forwarder.is_quarantined(&dead));
}

#[tokio::test]
async fn test_half_close_lets_the_upstream_drain() {
    // Upstream that replies only after seeing client EOF: if the relay tore
    // down both directions when the first one finished, the reply would be
    // lost.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        if let Ok((mut socket, _)) = listener.accept().await {
            let mut request = Vec::new();
            socket.read_to_end(&mut request).await.unwrap();
            assert_eq!(request, b"ping");
            socket.write_all(b"pong after eof").await.unwrap();
        }
    });

    let forwarder = Forwarder::new(vec![addr.clone()], QUARANTINE, DIAL_TIMEOUT);
    let (mut local, remote) = tokio::io::duplex(1024);
    let allowed = vec![addr];
    let session = tokio::spawn(async move {
        let forwarder = forwarder;
        forwarder.relay(remote, &allowed).await
    });

    local.write_all(b"ping").await.unwrap();
    local.shutdown().await.unwrap();

    let mut reply = Vec::new();
    local.read_to_end(&mut reply).await.unwrap();
    assert_eq!(reply, b"pong after eof");

    let summary = session.await.unwrap().unwrap();
    assert_eq!(summary.client_to_upstream, 4);
    assert_eq!(summary.upstream_to_client, 14);
}
