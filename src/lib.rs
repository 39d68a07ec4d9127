//! mtlsgate - mTLS-authenticated TCP reverse load balancer
//!
//! A layer-4 proxy that:
//! - Terminates mutually-authenticated TLS (client identity = certificate CN)
//! - Authorizes each client against a static upstream allow-list
//! - Rate-limits connections per client with a token bucket
//! - Relays bytes to the least-loaded eligible upstream, failing over
//!   through a passive quarantine list on dial errors

pub mod access_logger;
pub mod authorizer;
pub mod config;
pub mod forwarder;
pub mod listener;
pub mod rate_limiter;
pub mod tls;
pub mod tls_acceptor;

// Re-export commonly used types
pub use authorizer::Authorizer;
pub use config::ProxyConfig;
pub use forwarder::{Forwarder, RelaySummary};
pub use listener::run_listener;
pub use rate_limiter::RateLimiter;
pub use tls::TlsProvider;
pub use tls_acceptor::{AuthenticatedConnection, AuthenticatedTlsAcceptor, AuthenticatedTlsStream};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
