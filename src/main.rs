// Crate-level lint configuration
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::doc_markdown)]

//! `mtlsgate` - mTLS-authenticated TCP reverse load balancer
//!
//! A layer-4 proxy that:
//! - Terminates mutually-authenticated TLS (client identity = certificate CN)
//! - Authorizes each client against a static upstream allow-list
//! - Rate-limits connections per client with a token bucket
//! - Relays bytes to the least-loaded eligible upstream with passive failover

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mtlsgate::access_logger::init_access_logger;
use mtlsgate::authorizer::Authorizer;
use mtlsgate::config::ProxyConfig;
use mtlsgate::forwarder::Forwarder;
use mtlsgate::listener::run_listener;
use mtlsgate::rate_limiter::RateLimiter;
use mtlsgate::tls::TlsProvider;
use mtlsgate::tls_acceptor::AuthenticatedTlsAcceptor;

/// mtlsgate - mTLS TCP reverse load balancer
#[derive(Parser, Debug)]
#[command(name = "mtlsgate")]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "/etc/mtlsgate/config.toml",
        env = "MTLSGATE_CONFIG"
    )]
    config: PathBuf,

    /// Override bind address ("host:port")
    #[arg(long, env = "MTLSGATE_BIND")]
    bind: Option<SocketAddr>,

    /// Override CA certificate path (client verification)
    #[arg(long, env = "MTLSGATE_CA_CERT")]
    ca_cert: Option<PathBuf>,

    /// Override server certificate path
    #[arg(long, env = "MTLSGATE_CERT")]
    cert: Option<PathBuf>,

    /// Override server private key path
    #[arg(long, env = "MTLSGATE_KEY")]
    key: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(long, env = "MTLSGATE_LOG_LEVEL")]
    log_level: Option<String>,

    /// Enable JSON log format
    #[arg(long, env = "MTLSGATE_JSON_LOGS")]
    json_logs: bool,

    /// Run configuration validation only (don't start the server)
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls CryptoProvider before any TLS operations
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let args = Args::parse();

    // Load configuration
    let mut config = ProxyConfig::load(&args.config)?;

    // Apply CLI overrides
    if let Some(bind) = args.bind {
        config.server.bind_address = bind.ip().to_string();
        config.server.port = bind.port();
    }
    if let Some(ca_cert) = args.ca_cert {
        config.tls.ca_cert_path = ca_cert;
    }
    if let Some(cert) = args.cert {
        config.tls.cert_path = cert;
    }
    if let Some(key) = args.key {
        config.tls.key_path = key;
    }

    // Initialize logging
    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&config.logging.level)
        .to_string();
    init_logging(&level, args.json_logs || config.logging.json)?;

    info!("Starting mtlsgate v{}", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {:?}", args.config);

    // Validate configuration
    config.validate()?;
    info!("Configuration validated successfully");

    if args.validate {
        info!("Configuration validation successful, exiting");
        return Ok(());
    }

    let bind_addr = config
        .server
        .socket_addr()
        .map_err(|e| anyhow::anyhow!("Invalid bind address: {}", e))?;

    // Build the TLS provider (fatal if certificates are unusable)
    let tls_provider = TlsProvider::new(&config.tls)?;
    let acceptor = AuthenticatedTlsAcceptor::new(tls_provider.server_config());

    // Assemble the core components
    let forwarder = Arc::new(Forwarder::new(
        config.upstream_addresses(),
        config.forwarder.quarantine(),
        config.forwarder.dial_timeout(),
    ));
    let limiter = Arc::new(RateLimiter::new(
        config.rate_limiting.burst,
        config.rate_limiting.rate_per_sec,
    ));
    let authorizer = Arc::new(Authorizer::from_config(&config.clients));

    init_access_logger(config.logging.access_log.clone());

    print_startup_summary(&config, bind_addr);

    let listener_handle = tokio::spawn(run_listener(
        bind_addr,
        acceptor,
        authorizer,
        limiter,
        forwarder,
    ));

    // Wait for shutdown signal or listener failure
    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down");
        }
        result = listener_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Listener failed: {}", e);
                    return Err(e);
                }
                Ok(Ok(())) => {}
                Err(e) => {
                    error!("Listener task error: {}", e);
                    return Err(anyhow::anyhow!("Listener task error: {}", e));
                }
            }
        }
    }

    info!("mtlsgate shutdown complete");
    Ok(())
}

/// Initialize logging
fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_target(true))
            .init();
    }

    Ok(())
}

/// Wait for OS shutdown signal
#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut sigquit = signal(SignalKind::quit()).expect("Failed to install SIGQUIT handler");

    tokio::select! {
        _ = sigterm.recv() => {
            info!("Received SIGTERM");
        }
        _ = sigquit.recv() => {
            info!("Received SIGQUIT");
        }
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    // Fallback: just wait forever
    std::future::pending::<()>().await;
}

/// Print startup summary
fn print_startup_summary(config: &ProxyConfig, bind_addr: SocketAddr) {
    info!("═══════════════════════════════════════════════════════════════");
    info!("  mtlsgate v{}", env!("CARGO_PKG_VERSION"));
    info!("═══════════════════════════════════════════════════════════════");
    info!("  Listener:       {} (mTLS, TLS 1.2+)", bind_addr);
    info!("  Client CA:      {:?}", config.tls.ca_cert_path);
    info!(
        "  Rate limit:     burst {}, {} token(s)/s per client",
        config.rate_limiting.burst, config.rate_limiting.rate_per_sec
    );
    info!(
        "  Quarantine:     {}s, dial timeout {}ms",
        config.forwarder.quarantine_secs, config.forwarder.dial_timeout_ms
    );
    info!("  Upstreams:      {} configured", config.upstreams.len());
    for upstream in &config.upstreams {
        info!("    - {}", upstream.address);
    }
    info!("  Clients:        {} registered", config.clients.len());
    for (client, allowed) in &config.clients {
        info!("    - {} -> {} upstream(s)", client, allowed.len());
    }
    info!("═══════════════════════════════════════════════════════════════");
}
