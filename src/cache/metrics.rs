//! Hit/miss accounting and savings estimates
//!
//! One [`CacheMetrics`] belongs to one cache manager and is shared with its
//! components through an `Arc`; separate managers never share counters.

use crate::cache::types::CacheStats;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::trace;

/// Rough payload bytes per LLM token, used to estimate tokens saved by a hit
pub const BYTES_PER_TOKEN: u64 = 4;

/// Lock-free counters updated by concurrent cache operations
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    coalesced: AtomicU64,
    tokens_saved: AtomicU64,
    time_saved_us: AtomicU64,
    compute_time_us: AtomicU64,
    computations: AtomicU64,
    degraded: AtomicU64,
    write_failures: AtomicU64,
    rejected_oversized: AtomicU64,
    evictions_size: AtomicU64,
    evictions_ttl: AtomicU64,
}

impl CacheMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a hit worth `tokens_saved_estimate` tokens
    ///
    /// The time saved is credited as the average observed computation time.
    pub fn record_hit(&self, key: &str, tokens_saved_estimate: u64) {
        trace!("hit: {}", key);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.tokens_saved
            .fetch_add(tokens_saved_estimate, Ordering::Relaxed);
        let avg = self.average_compute_time();
        self.time_saved_us
            .fetch_add(avg.as_micros() as u64, Ordering::Relaxed);
    }

    /// Record a miss
    pub fn record_miss(&self, key: &str) {
        trace!("miss: {}", key);
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a follower that shared a leader's computation
    pub fn record_coalesced(&self, key: &str, tokens_saved_estimate: u64) {
        self.coalesced.fetch_add(1, Ordering::Relaxed);
        self.record_hit(key, tokens_saved_estimate);
    }

    /// Record how long one computation took
    pub fn record_compute_time(&self, elapsed: Duration) {
        self.compute_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.computations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an operation served without the backend
    pub fn record_degraded(&self) {
        self.degraded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_write_failure(&self) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected_oversized(&self) {
        self.rejected_oversized.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions_size(&self, count: u64) {
        self.evictions_size.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_evictions_ttl(&self, count: u64) {
        self.evictions_ttl.fetch_add(count, Ordering::Relaxed);
    }

    /// hits / (hits + misses); 0.0 when nothing has been observed
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }

    /// tokens_saved / 1000 * cost_per_1k_tokens
    pub fn cost_savings(&self, cost_per_1k_tokens: f64) -> f64 {
        self.tokens_saved.load(Ordering::Relaxed) as f64 / 1000.0 * cost_per_1k_tokens
    }

    /// Mean duration of recorded computations
    pub fn average_compute_time(&self) -> Duration {
        let n = self.computations.load(Ordering::Relaxed);
        if n == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(self.compute_time_us.load(Ordering::Relaxed) / n)
    }

    /// Counter snapshot; storage occupancy is left for the caller to fill in
    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            tokens_saved: self.tokens_saved.load(Ordering::Relaxed),
            time_saved: Duration::from_micros(self.time_saved_us.load(Ordering::Relaxed)),
            degraded: self.degraded.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            rejected_oversized: self.rejected_oversized.load(Ordering::Relaxed),
            evictions_size: self.evictions_size.load(Ordering::Relaxed),
            evictions_ttl: self.evictions_ttl.load(Ordering::Relaxed),
            entries: None,
            size_bytes: None,
        }
    }
}

/// Token estimate for a serialized payload
pub fn estimate_tokens(payload: &str) -> u64 {
    (payload.len() as u64).div_ceil(BYTES_PER_TOKEN)
}
