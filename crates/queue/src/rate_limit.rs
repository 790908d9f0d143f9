//! Dispatch rate limiting.
//!
//! Provides a per-queue token bucket that refills continuously at the
//! queue's configured rate.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;

use crate::registry::QueueRegistry;

/// Token bucket state for a single queue.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum tokens held.
    capacity: f64,
    /// Tokens currently available.
    tokens: f64,
    /// Tokens added per second.
    refill_per_sec: f64,
    /// Last refill time.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a full bucket.
    #[must_use]
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        let capacity = capacity.max(1.0);
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed
            .mul_add(self.refill_per_sec, self.tokens)
            .min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token if available.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until one token will be available.
    pub fn time_until_available(&mut self, now: Instant) -> Duration {
        self.refill(now);
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - self.tokens;
        Duration::try_from_secs_f64(missing / self.refill_per_sec).unwrap_or(Duration::MAX)
    }

    /// Tokens available right now, rounded down.
    pub fn available(&mut self, now: Instant) -> u32 {
        self.refill(now);
        self.tokens.floor() as u32
    }
}

/// Per-queue dispatch rate limiter.
///
/// Each bucket sits behind its own lock, so queues never contend with each
/// other and every refill-and-take is a single atomic update.
#[derive(Debug, Default)]
pub struct RateLimiter {
    buckets: HashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiter {
    /// Create one full bucket per registered queue.
    #[must_use]
    pub fn new(registry: &QueueRegistry) -> Self {
        let buckets = registry
            .iter()
            .map(|queue| {
                let bucket = TokenBucket::new(queue.burst(), queue.rate.per_second());
                (queue.name.clone(), Mutex::new(bucket))
            })
            .collect();

        Self { buckets }
    }

    fn with_bucket<T>(&self, queue: &str, f: impl FnOnce(&mut TokenBucket) -> T) -> Option<T> {
        self.buckets.get(queue).map(|bucket| {
            let mut bucket = bucket.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut bucket)
        })
    }

    /// Take a token for `queue` without waiting.
    ///
    /// Returns false if no token is available or the queue is unknown.
    pub fn try_acquire(&self, queue: &str) -> bool {
        self.with_bucket(queue, |bucket| bucket.try_acquire(Instant::now()))
            .unwrap_or(false)
    }

    /// Time until `queue` has a token again.
    #[must_use]
    pub fn time_until_available(&self, queue: &str) -> Option<Duration> {
        self.with_bucket(queue, |bucket| bucket.time_until_available(Instant::now()))
    }

    /// Tokens currently available for `queue`.
    #[must_use]
    pub fn available(&self, queue: &str) -> Option<u32> {
        self.with_bucket(queue, |bucket| bucket.available(Instant::now()))
    }
}
