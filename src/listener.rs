//! TLS listener and per-connection pipeline
//!
//! Accept loop for the front door. Each accepted connection runs in its own
//! task: TLS handshake with required client certificate, authorization
//! lookup, rate-limit check, then hand-off to the forwarder. A connection
//! that fails any stage is closed; nothing is written back to the client.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::access_logger::{log_access, AccessLogEntry, SessionOutcome};
use crate::authorizer::Authorizer;
use crate::forwarder::Forwarder;
use crate::rate_limiter::RateLimiter;
use crate::tls_acceptor::AuthenticatedTlsAcceptor;

/// Run the TLS listener until the task is dropped.
///
/// Binding failures are returned (fatal at startup); per-connection failures
/// are logged and absorbed.
pub async fn run_listener(
    addr: SocketAddr,
    acceptor: AuthenticatedTlsAcceptor,
    authorizer: Arc<Authorizer>,
    limiter: Arc<RateLimiter>,
    forwarder: Arc<Forwarder>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;

    info!("Listening on {} (mTLS)", addr);

    let acceptor = Arc::new(acceptor);

    loop {
        let (stream, remote_addr) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                warn!("Accept failed: {}", e);
                continue;
            }
        };

        let acceptor = acceptor.clone();
        let authorizer = authorizer.clone();
        let limiter = limiter.clone();
        let forwarder = forwarder.clone();

        tokio::spawn(async move {
            handle_connection(stream, remote_addr, &acceptor, &authorizer, &limiter, &forwarder)
                .await;
        });
    }
}

/// Drive one client connection through handshake, authorization, rate
/// limiting, and relay.
async fn handle_connection(
    stream: TcpStream,
    remote_addr: SocketAddr,
    acceptor: &AuthenticatedTlsAcceptor,
    authorizer: &Authorizer,
    limiter: &RateLimiter,
    forwarder: &Forwarder,
) {
    // Handshake failures and CN-less certificates are discarded quietly;
    // the acceptor has already logged them at debug level.
    let stream = match acceptor.accept(stream, remote_addr).await {
        Ok(Some(stream)) => stream,
        Ok(None) => return,
        Err(_) => return,
    };

    let client_cn = stream.conn_info.common_name.clone();
    let start = Instant::now();

    // Authorization first: an unknown client must not consume a token.
    let allowed = authorizer.lookup(&client_cn);
    if allowed.is_empty() {
        warn!("Client '{}' ({}) is not authorized", client_cn, remote_addr);
        log_access(&AccessLogEntry {
            remote_addr,
            client_cn,
            outcome: SessionOutcome::Unauthorized,
            upstream: None,
            bytes_in: 0,
            bytes_out: 0,
            duration_ms: 0,
        });
        return;
    }

    if !limiter.admit(&client_cn) {
        warn!("Client '{}' ({}) rate limited", client_cn, remote_addr);
        log_access(&AccessLogEntry {
            remote_addr,
            client_cn,
            outcome: SessionOutcome::RateLimited,
            upstream: None,
            bytes_in: 0,
            bytes_out: 0,
            duration_ms: 0,
        });
        return;
    }

    debug!(
        "Client '{}' ({}) admitted, {} upstream(s) allowed",
        client_cn,
        remote_addr,
        allowed.len()
    );

    match forwarder.relay(stream, &allowed).await {
        Ok(summary) => {
            log_access(&AccessLogEntry {
                remote_addr,
                client_cn,
                outcome: SessionOutcome::Relayed,
                upstream: Some(summary.upstream),
                bytes_in: summary.client_to_upstream,
                bytes_out: summary.upstream_to_client,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
        Err(e) => {
            warn!(
                "Client '{}' ({}): no upstream served the session: {}",
                client_cn, remote_addr, e
            );
            log_access(&AccessLogEntry {
                remote_addr,
                client_cn,
                outcome: SessionOutcome::Exhausted,
                upstream: None,
                bytes_in: 0,
                bytes_out: 0,
                duration_ms: start.elapsed().as_millis() as u64,
            });
        }
    }
}
