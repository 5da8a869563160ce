//! Per-connection token bucket.
//!
//! One bucket per streaming session, owned by that connection's task.
//! Deliberately `&mut self` with no internal locking: callers serialize
//! access per connection, unlike the lock-protected HTTP-level limiters.

use std::time::Instant;

/// Leaky token bucket: refills at `rate` tokens/sec, holds at most
/// `capacity`.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// A fresh bucket starts full.
    pub fn new(rate: f64, capacity: f64) -> Self {
        Self {
            rate,
            capacity,
            tokens: capacity,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `n` tokens. Returns false without deducting when fewer than `n`
    /// are available; a request above `capacity` can never succeed.
    pub fn consume(&mut self, n: f64) -> bool {
        self.refill();
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    /// Tokens available right now, after refill.
    pub fn available(&mut self) -> f64 {
        self.refill();
        self.tokens
    }
}
