//! A token bucket for byte-rate limiting.

use std::time::{Duration, Instant};

/// Token bucket refilled continuously at `refill_rate` tokens per second.
#[derive(Clone, Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a full bucket.
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Takes `amount` tokens unconditionally and returns how long the caller
    /// should wait before the bucket is back in credit.
    ///
    /// Requests larger than the capacity are charged at the capacity so a
    /// single oversized block cannot stall forever.
    pub fn reserve(&mut self, amount: f64) -> Duration {
        self.refill();
        self.tokens -= amount.min(self.capacity);
        if self.tokens >= 0.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.refill_rate)
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}
