//! Read-through orchestration over key derivation, storage and single-flight
//!
//! [`CacheManager::get_or_process`] is the one entry point callers need: it derives
//! the key, serves a stored result when one is live, and otherwise makes sure only
//! one computation per key runs while everyone else waits for its outcome. Storage
//! failures never fail a call; they are logged, counted as degraded, and the
//! computation result is returned uncached.

use crate::cache::backend::{self, CacheBackend, Reservation};
use crate::cache::config::CacheConfig;
use crate::cache::eviction::{EvictionManager, EvictionReport};
use crate::cache::key::KeyGenerator;
use crate::cache::metrics::{estimate_tokens, CacheMetrics};
use crate::cache::singleflight::{Outcome, Role, SingleFlight};
use crate::cache::types::{CacheKey, CacheStats, CacheValue, RelationshipInput};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Per-call knobs for [`CacheManager::get_or_process`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Skip the lookup and overwrite whatever is stored
    pub force_reprocess: bool,

    /// TTL for the written entry; the configured default (with jitter) otherwise
    pub ttl: Option<Duration>,

    /// Chunk text, folded into the key when content hashing is enabled
    pub content: Option<String>,
}

impl ProcessOptions {
    pub fn forced() -> Self {
        Self {
            force_reprocess: true,
            ..Default::default()
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }
}

/// Post-processing strategy used to pre-populate the cache
#[async_trait]
pub trait ChunkProcessor: Send + Sync + 'static {
    type Output: Serialize + DeserializeOwned + Send + 'static;

    async fn process(
        &self,
        chunk_id: String,
        relationships: Vec<RelationshipInput>,
    ) -> anyhow::Result<Self::Output>;
}

/// One chunk to warm
#[derive(Debug, Clone)]
pub struct ChunkRequest {
    pub chunk_id: String,
    pub relationships: Vec<RelationshipInput>,
    pub content: Option<String>,
}

impl ChunkRequest {
    pub fn new(chunk_id: impl Into<String>, relationships: Vec<RelationshipInput>) -> Self {
        Self {
            chunk_id: chunk_id.into(),
            relationships,
            content: None,
        }
    }
}

/// Outcome of [`CacheManager::warm`]
#[derive(Debug, Default)]
pub struct WarmReport {
    /// Chunks computed and stored by this run
    pub computed: usize,

    /// Chunks that already had a live entry
    pub already_cached: usize,

    /// Chunks whose computation or key derivation failed
    pub failed: Vec<(String, CacheError)>,
}

impl WarmReport {
    pub fn total(&self) -> usize {
        self.computed + self.already_cached + self.failed.len()
    }
}

/// What a flight hands its waiters
#[derive(Debug, Clone)]
struct Published {
    payload: CacheValue,
    /// False when the leader found the result already stored
    computed: bool,
    /// The leader ran into a backend failure along the way
    degraded: bool,
}

/// A read of the store
enum Lookup {
    Hit(CacheValue),
    Miss,
    /// Backend failed; handled like a miss
    Unavailable,
}

/// How a leader stands with respect to other processes computing the same key
enum Lease {
    Held(Reservation),
    /// Coordination disabled or timed out; compute without a lease
    Unheld,
    /// Backend failed while coordinating; compute without a lease
    Unavailable,
    /// Another process stored the result while we waited
    Resolved(CacheValue),
}

/// Result cache in front of per-chunk post-processing
#[derive(Clone)]
pub struct CacheManager {
    config: Arc<CacheConfig>,
    backend: Arc<dyn CacheBackend>,
    metrics: Arc<CacheMetrics>,
    flights: Arc<SingleFlight<Published>>,
    eviction: Arc<EvictionManager>,
    keys: KeyGenerator,
}

impl CacheManager {
    /// Validate `config` and connect the backend it selects
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let backend = backend::connect(&config.backend).await?;
        Self::with_backend(config, backend)
    }

    /// Build a manager over an already constructed backend
    pub fn with_backend(config: CacheConfig, backend: Arc<dyn CacheBackend>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(CacheMetrics::new());
        let eviction = Arc::new(EvictionManager::new(&config, metrics.clone()));
        let keys = KeyGenerator::new(config.version.clone())
            .with_content_hash(config.include_content_hash);

        info!(
            "Cache manager ready (backend: {}, version: {}, enabled: {})",
            backend.kind(),
            config.version,
            config.enabled
        );

        Ok(Self {
            config: Arc::new(config),
            backend,
            metrics,
            flights: Arc::new(SingleFlight::new()),
            eviction,
            keys,
        })
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    pub fn metrics(&self) -> &Arc<CacheMetrics> {
        &self.metrics
    }

    /// Key the given inputs map to under this manager's version
    pub fn key_for(
        &self,
        chunk_id: &str,
        relationships: &[RelationshipInput],
        content: Option<&str>,
    ) -> Result<CacheKey> {
        self.keys.generate(chunk_id, relationships, content)
    }

    /// Return the stored result for these inputs, or compute, store and return it
    ///
    /// Concurrent calls with the same key run `compute` once. A failed computation
    /// is returned to every waiter as the same [`CacheError::ComputeFailed`] and
    /// nothing is stored.
    pub async fn get_or_process<R, F, Fut>(
        &self,
        chunk_id: &str,
        relationships: &[RelationshipInput],
        compute: F,
        options: ProcessOptions,
    ) -> Result<R>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
        F: FnOnce(String, Vec<RelationshipInput>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        if !self.config.enabled {
            self.metrics.record_miss(chunk_id);
            return compute(chunk_id.to_string(), relationships.to_vec())
                .await
                .map_err(|e| CacheError::ComputeFailed(Arc::new(e)));
        }

        let key = self.keys.generate(chunk_id, relationships, options.content.as_deref())?;

        let mut degraded = false;
        if !options.force_reprocess {
            match self.lookup(&key).await {
                Lookup::Hit(payload) => match serde_json::from_str::<R>(&payload) {
                    Ok(value) => {
                        self.metrics.record_hit(&key, estimate_tokens(&payload));
                        return Ok(value);
                    }
                    Err(e) => {
                        warn!("Discarding undecodable cache entry {}: {}", key, e);
                        if let Err(e) = self.backend.delete(&key).await {
                            warn!("Failed to delete undecodable entry {}: {}", key, e);
                        }
                    }
                },
                Lookup::Miss => {}
                Lookup::Unavailable => degraded = true,
            }
        }

        // Held here until some flight claims it, so a forced call can run again
        // after joining a flight that only re-read the store.
        let pending = Arc::new(Mutex::new(Some(compute)));
        let (published, role) = loop {
            let leader = self.clone();
            let claim = pending.clone();
            let flight_key = key.clone();
            let flight_chunk = chunk_id.to_string();
            let flight_relationships = relationships.to_vec();
            let flight_options = options.clone();

            let (outcome, role) = self
                .flights
                .run(&key, move || {
                    let compute = claim.lock().take();
                    leader.lead(
                        flight_key,
                        flight_chunk,
                        flight_relationships,
                        compute,
                        flight_options,
                    )
                })
                .await;
            let published = match outcome {
                Ok(published) => published,
                Err(e) => {
                    if degraded {
                        self.metrics.record_degraded();
                    }
                    return Err(e);
                }
            };

            let unclaimed = pending.lock().is_some();
            if options.force_reprocess && !published.computed && unclaimed {
                debug!("Forced call for {} joined a stored read; computing again", key);
                tokio::task::yield_now().await;
                continue;
            }
            break (published, role);
        };

        if degraded || (role == Role::Leader && published.degraded) {
            self.metrics.record_degraded();
        }

        let tokens = estimate_tokens(&published.payload);
        match role {
            Role::Leader if published.computed => self.metrics.record_miss(&key),
            Role::Leader => self.metrics.record_hit(&key, tokens),
            Role::Follower => self.metrics.record_coalesced(&key, tokens),
        }

        Ok(serde_json::from_str(&published.payload)?)
    }

    /// Body of a single-flight run; executes on its own task
    async fn lead<R, F, Fut>(
        self,
        key: CacheKey,
        chunk_id: String,
        relationships: Vec<RelationshipInput>,
        compute: Option<F>,
        options: ProcessOptions,
    ) -> Outcome<Published>
    where
        R: Serialize + Send + 'static,
        F: FnOnce(String, Vec<RelationshipInput>) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let Some(compute) = compute else {
            return Err(CacheError::Coordination(format!(
                "computation for {} was already claimed",
                key
            )));
        };

        let mut degraded = false;

        // Another caller may have finished between our lookup and becoming leader.
        if !options.force_reprocess {
            match self.lookup(&key).await {
                Lookup::Hit(payload) => {
                    return Ok(Published {
                        payload,
                        computed: false,
                        degraded,
                    })
                }
                Lookup::Miss => {}
                Lookup::Unavailable => degraded = true,
            }
        }

        let reservation = match self.acquire_lease(&key, options.force_reprocess).await {
            Lease::Held(reservation) => Some(reservation),
            Lease::Unheld => None,
            Lease::Unavailable => {
                degraded = true;
                None
            }
            Lease::Resolved(payload) => {
                return Ok(Published {
                    payload,
                    computed: false,
                    degraded,
                })
            }
        };

        let outcome = self
            .compute_and_store(&key, chunk_id, relationships, compute, options.ttl)
            .await;

        if let Some(reservation) = reservation {
            if let Err(e) = self.backend.release(&reservation).await {
                warn!("Failed to release lease on {}: {}", key, e);
            }
        }

        outcome.map(|(payload, stored_cleanly)| Published {
            payload,
            computed: true,
            degraded: degraded || !stored_cleanly,
        })
    }

    /// Computed payload, and whether storing it went without backend failures
    async fn compute_and_store<R, F, Fut>(
        &self,
        key: &str,
        chunk_id: String,
        relationships: Vec<RelationshipInput>,
        compute: F,
        ttl: Option<Duration>,
    ) -> Outcome<(CacheValue, bool)>
    where
        R: Serialize,
        F: FnOnce(String, Vec<RelationshipInput>) -> Fut,
        Fut: Future<Output = anyhow::Result<R>>,
    {
        debug!("Computing {}", key);
        let started = Instant::now();
        let result = compute(chunk_id, relationships).await;
        self.metrics.record_compute_time(started.elapsed());

        let payload = match result {
            Ok(value) => serde_json::to_string(&value)?,
            Err(e) => {
                warn!("Computation for {} failed: {}", key, e);
                return Err(CacheError::ComputeFailed(Arc::new(e)));
            }
        };

        let stored_cleanly = self.persist(key, &payload, ttl).await;
        Ok((payload, stored_cleanly))
    }

    /// Best-effort write followed by size enforcement; false on a backend failure
    async fn persist(&self, key: &str, payload: &str, ttl: Option<Duration>) -> bool {
        let size = payload.len() as u64;
        if !self.eviction.admits(size) {
            warn!(
                "Not caching {}: payload of {} bytes exceeds max_entry_size ({})",
                key, size, self.config.max_entry_size
            );
            self.metrics.record_rejected_oversized();
            return true;
        }

        let ttl = self.config.effective_ttl(ttl);
        if let Err(e) = self.backend.set(key, payload.to_string(), ttl).await {
            warn!("Cache write failed for {}, result not cached: {}", key, e);
            self.metrics.record_write_failure();
            return false;
        }
        debug!("Stored {} ({} bytes, ttl {:?})", key, size, ttl);

        if let Err(e) = self.eviction.enforce_size_limit(self.backend.as_ref()).await {
            warn!("Size enforcement failed after writing {}: {}", key, e);
            return false;
        }
        true
    }

    async fn lookup(&self, key: &str) -> Lookup {
        match self.backend.get(key).await {
            Ok(Some(entry)) => {
                debug!("Cache hit: {}", key);
                Lookup::Hit(entry.value)
            }
            Ok(None) => {
                debug!("Cache miss: {}", key);
                Lookup::Miss
            }
            Err(e) => {
                warn!("Cache lookup failed for {}, computing without cache: {}", key, e);
                Lookup::Unavailable
            }
        }
    }

    /// Claim the fleet-wide lease on `key`, waiting out another holder
    async fn acquire_lease(&self, key: &str, force: bool) -> Lease {
        if !self.config.distributed_lock {
            return Lease::Unheld;
        }

        let deadline = Instant::now() + self.config.lock_lease;
        loop {
            match self.backend.reserve(key, self.config.lock_lease).await {
                Ok(Some(reservation)) => return Lease::Held(reservation),
                Ok(None) => {}
                Err(e) => {
                    warn!("Lease on {} unavailable, computing without it: {}", key, e);
                    return Lease::Unavailable;
                }
            }

            if Instant::now() >= deadline {
                warn!("Lease on {} still held after {:?}; computing anyway", key, self.config.lock_lease);
                return Lease::Unheld;
            }
            tokio::time::sleep(self.config.lock_poll_interval).await;

            if !force {
                match self.lookup(key).await {
                    Lookup::Hit(payload) => {
                        debug!("Another process stored {}", key);
                        return Lease::Resolved(payload);
                    }
                    Lookup::Miss => {}
                    Lookup::Unavailable => return Lease::Unavailable,
                }
            }
        }
    }

    /// Remove the entry for these inputs; true if one was stored
    pub async fn invalidate(
        &self,
        chunk_id: &str,
        relationships: &[RelationshipInput],
        content: Option<&str>,
    ) -> Result<bool> {
        let key = self.key_for(chunk_id, relationships, content)?;
        let removed = self.backend.delete(&key).await?;
        if removed {
            debug!("Invalidated {}", key);
        }
        Ok(removed)
    }

    /// Remove every entry whose key matches `pattern` (`*` and `?` globs)
    pub async fn clear(&self, pattern: &str) -> Result<usize> {
        let removed = self.backend.delete_matching(pattern).await?;
        info!("Cleared {} cache entries matching {:?}", removed, pattern);
        Ok(removed)
    }

    /// Counter snapshot plus current occupancy when the backend can report it
    pub async fn stats(&self) -> CacheStats {
        let mut stats = self.metrics.snapshot();
        stats.entries = self.backend.len().await.ok();
        stats.size_bytes = self.backend.total_size().await.ok();
        stats
    }

    /// One TTL sweep and size enforcement pass
    pub async fn sweep(&self) -> Result<EvictionReport> {
        self.eviction.run_maintenance(self.backend.as_ref()).await
    }

    /// Start the periodic sweep if `enable_auto_cleanup` is set
    pub fn start_sweeper(&self) -> Option<JoinHandle<()>> {
        if !self.config.enable_auto_cleanup {
            return None;
        }
        Some(
            self.eviction
                .clone()
                .spawn_sweeper(self.backend.clone(), self.config.cleanup_interval),
        )
    }

    /// Populate the cache for `chunks`, running at most `concurrency` at a time
    pub async fn warm<P>(
        &self,
        chunks: Vec<ChunkRequest>,
        processor: Arc<P>,
        concurrency: usize,
    ) -> WarmReport
    where
        P: ChunkProcessor,
    {
        info!("Warming cache with {} chunks", chunks.len());

        let results: Vec<(String, Result<bool>)> = stream::iter(chunks)
            .map(|chunk| {
                let processor = processor.clone();
                async move {
                    let outcome = self.warm_one(chunk.clone(), processor).await;
                    (chunk.chunk_id, outcome)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut report = WarmReport::default();
        for (chunk_id, outcome) in results {
            match outcome {
                Ok(true) => report.computed += 1,
                Ok(false) => report.already_cached += 1,
                Err(e) => {
                    warn!("Warming {} failed: {}", chunk_id, e);
                    report.failed.push((chunk_id, e));
                }
            }
        }

        info!(
            "Warm complete: {} computed, {} already cached, {} failed",
            report.computed,
            report.already_cached,
            report.failed.len()
        );
        report
    }

    /// True when this call computed the chunk
    async fn warm_one<P: ChunkProcessor>(&self, chunk: ChunkRequest, processor: Arc<P>) -> Result<bool> {
        let key = self.key_for(&chunk.chunk_id, &chunk.relationships, chunk.content.as_deref())?;
        if self.backend.exists(&key).await.unwrap_or(false) {
            return Ok(false);
        }

        let options = ProcessOptions {
            content: chunk.content,
            ..Default::default()
        };
        self.get_or_process::<P::Output, _, _>(
            &chunk.chunk_id,
            &chunk.relationships,
            move |chunk_id, relationships| async move {
                processor.process(chunk_id, relationships).await
            },
            options,
        )
        .await?;
        Ok(true)
    }
}
