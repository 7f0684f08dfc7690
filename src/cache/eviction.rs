//! Admission control, size-driven LRU reclamation and TTL sweeping

use crate::cache::backend::CacheBackend;
use crate::cache::config::CacheConfig;
use crate::cache::metrics::CacheMetrics;
use crate::cache::types::CacheKey;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What one reclamation pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EvictionReport {
    /// Expired entries removed before LRU selection
    pub expired: Vec<CacheKey>,

    /// Live entries evicted in LRU order
    pub evicted: Vec<CacheKey>,

    /// Total stored bytes before the pass
    pub size_before: u64,

    /// Total stored bytes after the pass
    pub size_after: u64,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.expired.is_empty() && self.evicted.is_empty()
    }
}

/// Keeps the store within its size budget
pub struct EvictionManager {
    max_total_size: u64,
    max_entry_size: u64,
    low_watermark_bytes: u64,
    metrics: Arc<CacheMetrics>,
    /// Serializes reclamation so concurrent writers do not over-evict
    reclaiming: Mutex<()>,
}

impl EvictionManager {
    pub fn new(config: &CacheConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self {
            max_total_size: config.max_total_size,
            max_entry_size: config.max_entry_size,
            low_watermark_bytes: config.low_watermark_bytes(),
            metrics,
            reclaiming: Mutex::new(()),
        }
    }

    /// Whether a payload of `size_bytes` may be persisted
    pub fn admits(&self, size_bytes: u64) -> bool {
        size_bytes <= self.max_entry_size
    }

    /// Occupancy reclamation reduces storage to
    pub fn low_watermark_bytes(&self) -> u64 {
        self.low_watermark_bytes
    }

    /// Reclaim space when the store is over its total size limit
    ///
    /// Expired entries go first; then live entries are evicted least recently
    /// accessed first (ties: oldest creation) until the total is at or below the
    /// low watermark.
    pub async fn enforce_size_limit(&self, store: &dyn CacheBackend) -> Result<EvictionReport> {
        let _reclaiming = self.reclaiming.lock().await;

        let size_before = store.total_size().await?;
        let mut report = EvictionReport {
            size_before,
            size_after: size_before,
            ..Default::default()
        };
        if size_before <= self.max_total_size {
            return Ok(report);
        }

        debug!(
            "Cache over size limit ({} > {} bytes), reclaiming to {}",
            size_before, self.max_total_size, self.low_watermark_bytes
        );

        report.expired = store.purge_expired().await?;
        self.metrics.record_evictions_ttl(report.expired.len() as u64);

        let mut current = store.total_size().await?;
        if current > self.low_watermark_bytes {
            let mut candidates = store.summaries().await?;
            candidates.sort_by(|a, b| a.lru_cmp(b));

            for candidate in candidates {
                if current <= self.low_watermark_bytes {
                    break;
                }
                if store.delete(&candidate.key).await? {
                    debug!("Evicting entry due to size limit: {}", candidate.key);
                    current = current.saturating_sub(candidate.metadata.size_bytes);
                    report.evicted.push(candidate.key);
                }
            }
        }

        self.metrics.record_evictions_size(report.evicted.len() as u64);
        report.size_after = store.total_size().await?;

        info!(
            "Reclaimed cache space: {} expired, {} evicted, {} -> {} bytes",
            report.expired.len(),
            report.evicted.len(),
            report.size_before,
            report.size_after
        );
        Ok(report)
    }

    /// Remove entries past their expiration that no read has caught yet
    pub async fn sweep_expired(&self, store: &dyn CacheBackend) -> Result<Vec<CacheKey>> {
        let expired = store.purge_expired().await?;
        if !expired.is_empty() {
            self.metrics.record_evictions_ttl(expired.len() as u64);
            debug!("Swept {} expired entries", expired.len());
        }
        Ok(expired)
    }

    /// One maintenance pass: TTL sweep, then size enforcement
    pub async fn run_maintenance(&self, store: &dyn CacheBackend) -> Result<EvictionReport> {
        let expired = self.sweep_expired(store).await?;
        let mut report = self.enforce_size_limit(store).await?;
        report.expired.splice(0..0, expired);
        Ok(report)
    }

    /// Background task running [`EvictionManager::run_maintenance`] every `interval`
    pub fn spawn_sweeper(
        self: Arc<Self>,
        store: Arc<dyn CacheBackend>,
        interval: Duration,
    ) -> JoinHandle<()> {
        info!("Starting cache sweeper task (interval: {:?})", interval);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                ticker.tick().await;

                match self.run_maintenance(store.as_ref()).await {
                    Ok(report) if !report.is_empty() => {
                        debug!(
                            "Sweep: {} expired, {} evicted",
                            report.expired.len(),
                            report.evicted.len()
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        self.metrics.record_degraded();
                        warn!("Cache sweep failed: {}", e);
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::backend::MemoryBackend;
    use crate::cache::entry::CacheEntry;
    use chrono::{DateTime, Utc};

    fn manager(max_total: u64, max_entry: u64) -> (EvictionManager, Arc<CacheMetrics>) {
        let config = CacheConfig::builder()
            .max_total_size(max_total)
            .max_entry_size(max_entry)
            .low_watermark(0.9)
            .build();
        let metrics = Arc::new(CacheMetrics::new());
        (EvictionManager::new(&config, metrics.clone()), metrics)
    }

    /// Entry of `size` bytes created `age_s` seconds before `now`, last read `idle_s` before
    fn aged_at(now: DateTime<Utc>, key: &str, size: usize, age_s: i64, idle_s: i64) -> CacheEntry {
        let mut entry = CacheEntry::with_expiration(
            key.to_string(),
            "x".repeat(size),
            now - chrono::Duration::seconds(age_s),
            now + chrono::Duration::hours(1),
        );
        entry.metadata.accessed_at = now - chrono::Duration::seconds(idle_s);
        entry
    }

    fn aged(key: &str, size: usize, age_s: i64, idle_s: i64) -> CacheEntry {
        aged_at(Utc::now(), key, size, age_s, idle_s)
    }

    #[test]
    fn test_admission() {
        let (eviction, _) = manager(1000, 100);
        assert!(eviction.admits(0));
        assert!(eviction.admits(100));
        assert!(!eviction.admits(101));
        assert_eq!(eviction.low_watermark_bytes(), 900);
    }

    #[tokio::test]
    async fn test_under_limit_is_noop() {
        let (eviction, _) = manager(1000, 1000);
        let store = MemoryBackend::new();
        store.insert_entry(aged("a", 500, 10, 10)).await;

        let report = eviction.enforce_size_limit(&store).await.unwrap();
        assert!(report.is_empty());
        assert_eq!(store.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_evicts_lru_until_low_watermark() {
        let (eviction, metrics) = manager(1000, 1000);
        let store = MemoryBackend::new();

        // 5 x 250 = 1250 bytes; must get down to 900
        store.insert_entry(aged("oldest", 250, 50, 50)).await;
        store.insert_entry(aged("old", 250, 40, 40)).await;
        store.insert_entry(aged("recent_read", 250, 60, 1)).await;
        store.insert_entry(aged("new", 250, 5, 5)).await;
        store.insert_entry(aged("newest", 250, 2, 2)).await;

        let report = eviction.enforce_size_limit(&store).await.unwrap();

        assert_eq!(report.evicted, vec!["oldest".to_string(), "old".to_string()]);
        assert_eq!(report.size_before, 1250);
        assert_eq!(report.size_after, 750);
        assert!(store.exists("recent_read").await.unwrap());
        assert_eq!(metrics.snapshot().evictions_size, 2);
    }

    #[tokio::test]
    async fn test_ties_break_by_creation_time() {
        let (eviction, _) = manager(500, 500);
        let store = MemoryBackend::new();

        let now = Utc::now();
        store.insert_entry(aged_at(now, "young", 200, 10, 30)).await;
        store.insert_entry(aged_at(now, "elder", 200, 90, 30)).await;
        store.insert_entry(aged_at(now, "fresh", 200, 1, 1)).await;

        let report = eviction.enforce_size_limit(&store).await.unwrap();
        assert_eq!(report.evicted, vec!["elder".to_string()]);
    }

    #[tokio::test]
    async fn test_expired_entries_go_first() {
        let (eviction, metrics) = manager(500, 500);
        let store = MemoryBackend::new();

        let now = Utc::now();
        let mut dead = aged("dead", 300, 10, 0);
        dead.metadata.expires_at = now - chrono::Duration::seconds(1);
        store.insert_entry(dead).await;
        store.insert_entry(aged("idle", 300, 100, 100)).await;

        let report = eviction.enforce_size_limit(&store).await.unwrap();
        assert_eq!(report.expired, vec!["dead".to_string()]);
        assert!(report.evicted.is_empty());
        assert!(store.exists("idle").await.unwrap());
        assert_eq!(metrics.snapshot().evictions_ttl, 1);
    }

    #[tokio::test]
    async fn test_sweeper_removes_expired_entries() {
        let (eviction, metrics) = manager(10_000, 10_000);
        let store: Arc<dyn CacheBackend> = Arc::new(MemoryBackend::new());
        store.set("short", "v".into(), Duration::from_millis(20)).await.unwrap();
        store.set("long", "v".into(), Duration::from_secs(60)).await.unwrap();

        let handle = Arc::new(eviction).spawn_sweeper(store.clone(), Duration::from_millis(30));
        tokio::time::sleep(Duration::from_millis(150)).await;
        handle.abort();

        assert_eq!(store.len().await.unwrap(), 1);
        assert!(store.exists("long").await.unwrap());
        assert_eq!(metrics.snapshot().evictions_ttl, 1);
    }
}
