//! Sliding-window rate limiting for upgrade attempts.
//!
//! Keyed by source address: at most `limit` upgrade attempts per window.
//! Stale entries are swept opportunistically so an address scan cannot
//! grow the table without bound.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// How often the limiter sweeps stale entries from its map.
const SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// Sliding-window limiter over upgrade attempts per source address.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit: usize,
    window: Duration,
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    attempts: HashMap<String, Vec<Instant>>,
    last_sweep: Instant,
}

impl SlidingWindowRateLimiter {
    pub fn new(limit: usize, window: Duration) -> Self {
        Self {
            limit,
            window,
            inner: Mutex::new(Inner {
                attempts: HashMap::new(),
                last_sweep: Instant::now(),
            }),
        }
    }

    /// Listener limits: 10 attempts per 60 s.
    pub fn for_listener() -> Self {
        Self::new(10, Duration::from_secs(60))
    }

    /// Record an attempt from `key` and say whether it is allowed.
    pub fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut inner = self.inner.lock();

        if now.duration_since(inner.last_sweep) > SWEEP_INTERVAL {
            let window = self.window;
            inner
                .attempts
                .retain(|_, stamps| stamps.iter().any(|&t| now.duration_since(t) < window));
            inner.last_sweep = now;
        }

        let stamps = inner.attempts.entry(key.to_string()).or_default();
        stamps.retain(|&t| now.duration_since(t) < self.window);

        if stamps.len() >= self.limit {
            return false;
        }
        stamps.push(now);
        true
    }
}
