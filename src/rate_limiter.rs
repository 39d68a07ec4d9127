//! Per-client connection rate limiting
//!
//! Token bucket with lazy refill: each client identity gets a bucket of
//! `burst` tokens refilled at `rate_per_sec`. One admitted connection costs
//! one token. Buckets are created on first sighting with a full balance and
//! are never evicted (the client population is the bounded set of issued
//! certificates).

use std::time::Instant;

use dashmap::DashMap;
use tracing::trace;

/// A single client's bucket state
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
        }
    }

    fn try_acquire(&mut self, capacity: f64, refill_rate: f64, now: Instant) -> bool {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_rate).min(capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Per-client token-bucket rate limiter
pub struct RateLimiter {
    buckets: DashMap<String, TokenBucket>,
    burst: f64,
    rate_per_sec: f64,
}

impl RateLimiter {
    /// Create a limiter with the given burst capacity (maximum tokens) and
    /// refill rate in tokens per second.
    pub fn new(burst: u32, rate_per_sec: f64) -> Self {
        Self {
            buckets: DashMap::new(),
            burst: f64::from(burst),
            rate_per_sec,
        }
    }

    /// Try to admit one connection for the given client identity.
    pub fn admit(&self, client: &str) -> bool {
        self.admit_at(client, Instant::now())
    }

    /// Admission with an explicit clock, shared by `admit` and the tests
    fn admit_at(&self, client: &str, now: Instant) -> bool {
        let mut bucket = self
            .buckets
            .entry(client.to_string())
            .or_insert_with(|| TokenBucket::new(self.burst, now));

        let admitted = bucket.try_acquire(self.burst, self.rate_per_sec, now);
        trace!(client, admitted, tokens = bucket.tokens, "rate limit check");
        admitted
    }
}
