//! Forwarder: least-connections upstream selection and bidirectional relay
//!
//! Owns the per-upstream active-connection counts and the transient
//! unhealthy set. For each client connection it:
//! - selects the least-loaded eligible upstream (allow-list order breaks ties)
//! - dials it with a bounded timeout, failing over through the remaining
//!   eligible upstreams; a failed dial quarantines that upstream
//! - splices bytes in both directions until both sides have drained
//!
//! Selection and increment happen inside one critical section so two
//! concurrent selections cannot both claim the same minimum. The increment
//! is held by an RAII guard; the count is released on every exit path,
//! including copy errors and task panics.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Outcome of a completed relay session
#[derive(Debug)]
pub struct RelaySummary {
    /// The upstream that served the session
    pub upstream: String,
    /// Bytes copied client -> upstream
    pub client_to_upstream: u64,
    /// Bytes copied upstream -> client
    pub upstream_to_client: u64,
}

/// Forwarder over a fixed set of upstreams
pub struct Forwarder {
    state: Mutex<ForwarderState>,
    quarantine: Duration,
    dial_timeout: Duration,
}

struct ForwarderState {
    /// Active relay sessions per upstream address
    counts: HashMap<String, usize>,
    /// Upstream address -> quarantine expiry; entries are removed lazily
    unhealthy: HashMap<String, Instant>,
}

impl Forwarder {
    /// Create a forwarder over the given upstream addresses.
    /// Counts start at zero; the unhealthy set starts empty.
    pub fn new(
        upstreams: impl IntoIterator<Item = String>,
        quarantine: Duration,
        dial_timeout: Duration,
    ) -> Self {
        let counts = upstreams.into_iter().map(|addr| (addr, 0)).collect();
        Self {
            state: Mutex::new(ForwarderState {
                counts,
                unhealthy: HashMap::new(),
            }),
            quarantine,
            dial_timeout,
        }
    }

    /// Relay a client connection to the least-loaded eligible upstream.
    ///
    /// Returns when the session ends. On success the summary reports the
    /// chosen upstream and the bytes moved in each direction; mid-session
    /// read/write errors end the session but are not surfaced as `Err`.
    /// If every eligible upstream fails to dial, the client stream is
    /// dropped (closed) and an error is returned for the caller to log.
    pub async fn relay<S>(&self, client: S, allowed: &[String]) -> anyhow::Result<RelaySummary>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (guard, upstream_stream) = self.connect(allowed).await?;
        let upstream = guard.address.clone();

        let (client_to_upstream, upstream_to_client) = splice(client, upstream_stream).await;

        // guard drops here, releasing the count
        Ok(RelaySummary {
            upstream,
            client_to_upstream,
            upstream_to_client,
        })
    }

    /// Current active-session count for an upstream (None if unknown)
    pub fn active_count(&self, address: &str) -> Option<usize> {
        self.state.lock().counts.get(address).copied()
    }

    /// Whether an upstream is currently quarantined
    pub fn is_quarantined(&self, address: &str) -> bool {
        let state = self.state.lock();
        match state.unhealthy.get(address) {
            Some(&expiry) => expiry > Instant::now(),
            None => false,
        }
    }

    /// Dial the selected upstream, failing over through the eligible set.
    /// Each failed dial quarantines its upstream and releases its count
    /// before the next selection.
    async fn connect(&self, allowed: &[String]) -> anyhow::Result<(UpstreamGuard<'_>, TcpStream)> {
        loop {
            let Some(guard) = self.select(allowed) else {
                return Err(anyhow::anyhow!("No eligible upstream available"));
            };

            match tokio::time::timeout(self.dial_timeout, TcpStream::connect(&guard.address)).await
            {
                Ok(Ok(stream)) => {
                    debug!("Dialed upstream {}", guard.address);
                    return Ok((guard, stream));
                }
                Ok(Err(e)) => {
                    warn!("Failed to dial upstream {}: {}", guard.address, e);
                }
                Err(_) => {
                    warn!(
                        "Dial to upstream {} timed out after {:?}",
                        guard.address, self.dial_timeout
                    );
                }
            }

            self.mark_unhealthy(&guard.address);
            // guard drops at the end of this iteration, releasing the count
        }
    }

    /// Select the minimum-count eligible upstream and increment its count.
    ///
    /// Eligible: present in the configured table (unknown allow-list names
    /// are ignored) and not under an unexpired quarantine. Ties are broken
    /// by `allowed` order. The scan and the increment share one lock hold
    /// and perform no I/O.
    fn select(&self, allowed: &[String]) -> Option<UpstreamGuard<'_>> {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut best: Option<(usize, &String)> = None;
        for address in allowed {
            let Some(&count) = state.counts.get(address) else {
                continue;
            };
            match state.unhealthy.get(address).copied() {
                Some(expiry) if expiry > now => continue,
                Some(_) => {
                    state.unhealthy.remove(address);
                }
                None => {}
            }
            // Strict comparison keeps the earliest allow-list entry on ties.
            if best.map_or(true, |(best_count, _)| count < best_count) {
                best = Some((count, address));
            }
        }

        let address = best?.1.clone();
        if let Some(count) = state.counts.get_mut(&address) {
            *count += 1;
        }

        Some(UpstreamGuard {
            forwarder: self,
            address,
        })
    }

    /// Quarantine an upstream until now + the configured window
    fn mark_unhealthy(&self, address: &str) {
        let expiry = Instant::now() + self.quarantine;
        self.state
            .lock()
            .unhealthy
            .insert(address.to_string(), expiry);
    }
}

/// RAII hold on one unit of an upstream's active count.
/// Dropping the guard decrements, whatever path got us there.
struct UpstreamGuard<'a> {
    forwarder: &'a Forwarder,
    address: String,
}

impl Drop for UpstreamGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.forwarder.state.lock();
        if let Some(count) = state.counts.get_mut(&self.address) {
            *count = count.saturating_sub(1);
        }
    }
}

/// Run the two copy directions to completion.
///
/// Each direction half-closes its destination when its source reaches EOF so
/// the opposite direction can keep draining; the session is over only when
/// both directions have finished. Copy errors and panics in either task end
/// that direction; the byte counts reflect what was actually moved.
async fn splice<S>(client: S, upstream: TcpStream) -> (u64, u64)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let to_upstream = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut client_read, &mut upstream_write).await;
        let _ = upstream_write.shutdown().await;
        copied
    });

    let to_client = tokio::spawn(async move {
        let copied = tokio::io::copy(&mut upstream_read, &mut client_write).await;
        let _ = client_write.shutdown().await;
        copied
    });

    let (to_upstream, to_client) = tokio::join!(to_upstream, to_client);

    let client_to_upstream = match to_upstream {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("client->upstream copy ended with error: {}", e);
            0
        }
        Err(e) => {
            warn!("client->upstream copy task failed: {}", e);
            0
        }
    };
    let upstream_to_client = match to_client {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("upstream->client copy ended with error: {}", e);
            0
        }
        Err(e) => {
            warn!("upstream->client copy task failed: {}", e);
            0
        }
    };

    (client_to_upstream, upstream_to_client)
}
