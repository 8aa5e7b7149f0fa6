//! Per-topic token bucket.

/// A token bucket refilled continuously from the engine clock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_ms: f64,
    last_refill: i64,
}

impl TokenBucket {
    /// Creates a full bucket allowing `per_second` acquisitions per second.
    pub fn new(per_second: u32, now: i64) -> Self {
        let capacity = f64::from(per_second.max(1));
        Self {
            capacity,
            tokens: capacity,
            refill_per_ms: capacity / 1_000.0,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: i64) {
        let elapsed = now.saturating_sub(self.last_refill);
        if elapsed > 0 {
            self.tokens = (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.capacity);
            self.last_refill = now;
        }
    }

    /// Takes one token if available.
    pub fn try_acquire(&mut self, now: i64) -> bool {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Returns the tokens available at `now` without taking any.
    pub fn available(&self, now: i64) -> f64 {
        let elapsed = now.saturating_sub(self.last_refill).max(0);
        (self.tokens + elapsed as f64 * self.refill_per_ms).min(self.capacity)
    }

    /// Returns true if an acquisition at `now` would be refused.
    pub fn is_limited(&self, now: i64) -> bool {
        self.available(now) < 1.0
    }
}
