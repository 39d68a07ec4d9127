//! TLS configuration
//!
//! Builds the rustls server configuration the listener terminates with:
//! - Server certificate chain and private key from PEM files
//! - Client certificates required and verified against the configured CA
//! - TLS 1.2 minimum, TLS 1.3 maximum
//! - TLS 1.2 restricted to forward-secret ECDHE/AEAD suites

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerConfig as RustlsServerConfig, WebPkiClientVerifier};
use rustls::SupportedCipherSuite;
use rustls_pemfile::{certs, pkcs8_private_keys, rsa_private_keys};
use tracing::info;

use crate::config::TlsConfig;

/// Cipher suites offered, in preference order. The TLS 1.3 suites are the
/// provider defaults; the TLS 1.2 list is pinned to ECDHE + AEAD only.
static CIPHER_SUITES: &[SupportedCipherSuite] = &[
    rustls::crypto::ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
    rustls::crypto::ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
    rustls::crypto::ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
    rustls::crypto::ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
];

/// TLS provider abstraction
pub struct TlsProvider {
    server_config: Arc<RustlsServerConfig>,
}

impl TlsProvider {
    /// Create a new TLS provider from configuration
    pub fn new(tls_config: &TlsConfig) -> anyhow::Result<Self> {
        let server_config = Self::create_rustls_config(tls_config)?;
        Ok(Self {
            server_config: Arc::new(server_config),
        })
    }

    /// Get the rustls server configuration
    pub fn server_config(&self) -> Arc<RustlsServerConfig> {
        self.server_config.clone()
    }

    /// Create rustls server configuration
    fn create_rustls_config(tls_config: &TlsConfig) -> anyhow::Result<RustlsServerConfig> {
        // Load certificate chain
        let cert_chain = Self::load_certificates(&tls_config.cert_path)?;
        info!("Loaded {} certificates from chain", cert_chain.len());

        // Load private key
        let private_key = Self::load_private_key(&tls_config.key_path)?;
        info!("Private key loaded successfully");

        // Client CA for mTLS verification
        let client_ca = Self::load_client_ca(&tls_config.ca_cert_path)?;

        let provider = Arc::new(Self::crypto_provider());

        let client_auth =
            WebPkiClientVerifier::builder_with_provider(Arc::new(client_ca), provider.clone())
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to create client verifier: {}", e))?;

        let config = RustlsServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])
            .map_err(|e| anyhow::anyhow!("Failed to set protocol versions: {}", e))?
            .with_client_cert_verifier(client_auth)
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| anyhow::anyhow!("Failed to create mTLS config: {}", e))?;

        info!("TLS 1.2+ with required client certificates");

        Ok(config)
    }

    /// Ring crypto provider with the pinned cipher-suite list
    fn crypto_provider() -> CryptoProvider {
        CryptoProvider {
            cipher_suites: CIPHER_SUITES.to_vec(),
            ..rustls::crypto::ring::default_provider()
        }
    }

    /// Load certificates from PEM file
    fn load_certificates(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open certificate file {:?}: {}", path, e))?;
        let mut reader = BufReader::new(file);

        let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to parse certificates: {}", e))?;

        if certs.is_empty() {
            return Err(anyhow::anyhow!("No certificates found in {:?}", path));
        }

        Ok(certs)
    }

    /// Load private key from PEM file
    fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
        let file = File::open(path)
            .map_err(|e| anyhow::anyhow!("Failed to open private key file {:?}: {}", path, e))?;
        let mut reader = BufReader::new(file);

        // Try PKCS#8 format first
        let pkcs8_keys: Vec<_> = pkcs8_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to parse PKCS#8 keys: {}", e))?;

        if let Some(key) = pkcs8_keys.into_iter().next() {
            return Ok(PrivateKeyDer::Pkcs8(key));
        }

        // Try RSA format
        let file = File::open(path)?;
        let mut reader = BufReader::new(file);

        let rsa_keys: Vec<_> = rsa_private_keys(&mut reader)
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Failed to parse RSA keys: {}", e))?;

        if let Some(key) = rsa_keys.into_iter().next() {
            return Ok(PrivateKeyDer::Pkcs1(key));
        }

        Err(anyhow::anyhow!("No private key found in {:?}", path))
    }

    /// Load the client CA bundle used to verify peer certificates
    fn load_client_ca(path: &Path) -> anyhow::Result<rustls::RootCertStore> {
        let mut root_store = rustls::RootCertStore::empty();

        let certs = Self::load_certificates(path)?;
        for cert in certs {
            root_store
                .add(cert)
                .map_err(|e| anyhow::anyhow!("Failed to add CA certificate: {}", e))?;
        }
        info!("Loaded {} client CA certificates", root_store.len());

        Ok(root_store)
    }
}
