//! # Post-processing result cache
//!
//! Caches the output of an expensive per-chunk post-processing step, keyed by a
//! canonical digest of the chunk's relationships so that semantically identical
//! inputs share one result regardless of ordering.
//!
//! ## Features
//!
//! - **Canonical keys**: relationship order and weight noise below 4 decimals do
//!   not change the key; any other change to the relationship set does
//! - **Single-flight**: concurrent requests for one key trigger one computation
//! - **TTL expiry** with jitter, clamped to configured bounds
//! - **Size budget**: oversized results bypass storage; LRU reclamation to a low watermark
//! - **Pluggable storage**: memory, Redis or SQLite, selected by configuration
//! - **Degraded mode**: storage failures fall back to computing without the cache
//!
//! ## Example
//!
//! ```rust
//! use postproc_cache::cache::{CacheConfig, CacheManager, ProcessOptions, RelationshipInput};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let cache = CacheManager::connect(CacheConfig::ephemeral()).await?;
//! let relationships = vec![RelationshipInput::new("Alice", "Acme", "WORKS_AT", 0.9, "")];
//!
//! let summary: String = cache
//!     .get_or_process(
//!         "chunk-1",
//!         &relationships,
//!         |chunk_id, rels| async move {
//!             Ok::<_, anyhow::Error>(format!("{}: {} relationships", chunk_id, rels.len()))
//!         },
//!         ProcessOptions::default(),
//!     )
//!     .await?;
//! assert_eq!(summary, "chunk-1: 1 relationships");
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod entry;
pub mod eviction;
pub mod key;
pub mod manager;
pub mod metrics;
pub mod singleflight;
pub mod types;

pub use backend::{CacheBackend, MemoryBackend, Reservation};
pub use config::{BackendConfig, CacheConfig, CacheConfigBuilder, EvictionPolicy};
pub use entry::{CacheEntry, EntryMetadata, EntrySummary};
pub use eviction::{EvictionManager, EvictionReport};
pub use key::{generate_key, KeyGenerator};
pub use manager::{CacheManager, ChunkProcessor, ChunkRequest, ProcessOptions, WarmReport};
pub use metrics::CacheMetrics;
pub use singleflight::{Role, SingleFlight};
pub use types::{BackendKind, CacheKey, CacheStats, CacheValue, RelationshipInput};

#[cfg(feature = "redis-backend")]
pub use backend::RedisBackend;
#[cfg(feature = "sqlite-backend")]
pub use backend::SqliteBackend;
