//! Configuration module with TOML parsing
//!
//! All configuration values are externalized - no hardcoded ports, paths, or
//! addresses. Configuration is loaded once at startup and immutable thereafter;
//! a bad configuration is a fatal startup error.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Main proxy configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Server bind configuration
    pub server: ServerConfig,
    /// TLS configuration
    pub tls: TlsConfig,
    /// Upstream backend definitions
    #[serde(default)]
    pub upstreams: Vec<UpstreamConfig>,
    /// Client allow-list: certificate Common Name -> permitted upstream addresses
    #[serde(default)]
    pub clients: HashMap<String, Vec<String>>,
    /// Forwarder tuning (quarantine window, dial timeout)
    pub forwarder: ForwarderConfig,
    /// Per-client rate limiting
    pub rate_limiting: RateLimitConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            tls: TlsConfig::default(),
            upstreams: Vec::new(),
            clients: HashMap::new(),
            forwarder: ForwarderConfig::default(),
            rate_limiting: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Server bind configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the TLS listener (default: 0.0.0.0)
    pub bind_address: String,
    /// TCP port for the TLS listener
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8443,
        }
    }
}

impl ServerConfig {
    /// Get the full socket address
    pub fn socket_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.bind_address, self.port).parse()
    }
}

/// TLS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// Path to the server certificate chain (PEM format)
    pub cert_path: PathBuf,
    /// Path to the server private key (PEM format, PKCS#8 or RSA)
    pub key_path: PathBuf,
    /// Path to the CA bundle used to verify client certificates (PEM format)
    pub ca_cert_path: PathBuf,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert_path: PathBuf::from("/etc/mtlsgate/cert.pem"),
            key_path: PathBuf::from("/etc/mtlsgate/key.pem"),
            ca_cert_path: PathBuf::from("/etc/mtlsgate/ca.pem"),
        }
    }
}

/// A single upstream backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Upstream address ("host:port")
    pub address: String,
}

/// Forwarder tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// How long a dial failure keeps an upstream out of selection, in seconds
    pub quarantine_secs: u64,
    /// Upstream connect timeout in milliseconds
    pub dial_timeout_ms: u64,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            quarantine_secs: 30,
            dial_timeout_ms: 5000,
        }
    }
}

impl ForwarderConfig {
    pub fn quarantine(&self) -> Duration {
        Duration::from_secs(self.quarantine_secs)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }
}

/// Per-client rate limiting (token bucket)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Bucket capacity: maximum tokens, i.e. maximum burst of admitted connections
    pub burst: u32,
    /// Refill rate in tokens per second
    pub rate_per_sec: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: 3,
            rate_per_sec: 1.0,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Emit JSON-formatted logs
    pub json: bool,
    /// Access log file path (None = access log to tracing only)
    pub access_log: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            access_log: None,
        }
    }
}

impl ProxyConfig {
    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {:?}: {}", path, e))?;
        let config: ProxyConfig = toml::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file {:?}: {}", path, e))?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        self.server
            .socket_addr()
            .map_err(|e| anyhow::anyhow!("Invalid server bind address: {}", e))?;

        if self.upstreams.is_empty() {
            return Err(anyhow::anyhow!("No upstreams configured"));
        }

        let mut seen = std::collections::HashSet::new();
        for upstream in &self.upstreams {
            if upstream.address.parse::<SocketAddr>().is_err() {
                return Err(anyhow::anyhow!(
                    "Invalid upstream address '{}'",
                    upstream.address
                ));
            }
            if !seen.insert(upstream.address.as_str()) {
                warn!("Duplicate upstream address: {}", upstream.address);
            }
        }

        // Allow-list entries naming unknown upstreams are filtered at selection
        // time; surface them here so a typo is visible at startup.
        for (client, allowed) in &self.clients {
            if allowed.is_empty() {
                warn!("Client '{}' has an empty allow-list entry", client);
            }
            for address in allowed {
                if !seen.contains(address.as_str()) {
                    warn!(
                        "Client '{}' allow-list references unknown upstream '{}'",
                        client, address
                    );
                }
            }
        }

        if self.rate_limiting.burst < 1 {
            return Err(anyhow::anyhow!("rate_limiting.burst must be at least 1"));
        }
        if !(self.rate_limiting.rate_per_sec > 0.0) || !self.rate_limiting.rate_per_sec.is_finite()
        {
            return Err(anyhow::anyhow!(
                "rate_limiting.rate_per_sec must be a positive number"
            ));
        }

        if self.forwarder.quarantine_secs == 0 {
            return Err(anyhow::anyhow!("forwarder.quarantine_secs must be nonzero"));
        }
        if self.forwarder.dial_timeout_ms == 0 {
            return Err(anyhow::anyhow!("forwarder.dial_timeout_ms must be nonzero"));
        }

        // Certificate files may legitimately appear after validation (e.g. a
        // mounted secret); missing files are fatal at TLS provider construction.
        if !self.tls.cert_path.exists() {
            warn!("TLS certificate not found: {:?}", self.tls.cert_path);
        }
        if !self.tls.key_path.exists() {
            warn!("TLS private key not found: {:?}", self.tls.key_path);
        }
        if !self.tls.ca_cert_path.exists() {
            warn!("Client CA bundle not found: {:?}", self.tls.ca_cert_path);
        }

        Ok(())
    }

    /// Addresses of all configured upstreams, in configuration order
    pub fn upstream_addresses(&self) -> Vec<String> {
        self.upstreams.iter().map(|u| u.address.clone()).collect()
    }
}
