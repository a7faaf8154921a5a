//! Sliding-window rate limiter (C11).
//!
//! `governor`'s token bucket doesn't expose the per-key
//! remaining()/reset_time() contract this component needs, so it is
//! hand-rolled in the same concurrent-map style `cache.rs`'s
//! `ResponseCache` uses: one `DashMap` entry per key, each guarded by its
//! own lock rather than one lock over the whole table.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;

/// Sliding-window limiter keyed by an arbitrary string (client IP,
/// webhook URL, ...).
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: DashMap<String, Mutex<VecDeque<Instant>>>,
    conservative: bool,
}

impl RateLimiter {
    /// Construct a limiter allowing `limit` requests per `window`.
    #[must_use]
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit,
            window,
            windows: DashMap::new(),
            conservative: false,
        }
    }

    /// A degraded limiter with half the configured limit (minimum one),
    /// used when a backing store the limiter would normally consult is
    /// unavailable (spec §4.11 conservative-fallback contract).
    #[must_use]
    pub fn conservative(limit: u32, window: Duration) -> Self {
        let mut limiter = Self::new((limit / 2).max(1), window);
        limiter.conservative = true;
        limiter
    }

    /// Whether this is a degraded (conservative) limiter.
    #[must_use]
    pub fn is_conservative(&self) -> bool {
        self.conservative
    }

    /// The configured requests-per-window limit.
    #[must_use]
    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn prune(&self, deque: &mut VecDeque<Instant>) {
        let cutoff = Instant::now().checked_sub(self.window).unwrap_or(Instant::now());
        while deque.front().is_some_and(|t| *t < cutoff) {
            deque.pop_front();
        }
    }

    /// Count of requests within the window after pruning, without
    /// recording a new one.
    #[must_use]
    pub fn count(&self, key: &str) -> usize {
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut deque = entry.lock();
        self.prune(&mut deque);
        deque.len()
    }

    /// Whether `key` is at or over the limit.
    #[must_use]
    pub fn is_rate_limited(&self, key: &str) -> bool {
        self.count(key) >= self.limit as usize
    }

    /// Record a request for `key` at the current instant.
    pub fn add_request(&self, key: &str) {
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut deque = entry.lock();
        self.prune(&mut deque);
        deque.push_back(Instant::now());
    }

    /// Remaining requests permitted for `key` before the limit is hit.
    #[must_use]
    pub fn remaining(&self, key: &str) -> u32 {
        self.limit.saturating_sub(self.count(key) as u32)
    }

    /// Wall-clock instant the oldest tracked request ages out of the
    /// window, or `None` if `key` has no tracked requests.
    #[must_use]
    pub fn reset_time(&self, key: &str) -> Option<Instant> {
        let entry = self.windows.entry(key.to_string()).or_default();
        let mut deque = entry.lock();
        self.prune(&mut deque);
        deque.front().map(|t| *t + self.window)
    }
}
