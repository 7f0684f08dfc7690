//! # postproc-cache
//!
//! A result cache in front of per-chunk relationship post-processing.
//!
//! Post-processing a chunk's extracted relationships is slow and costs LLM tokens,
//! and the same chunk is routinely reprocessed with identical inputs. This crate
//! returns the stored result for semantically identical inputs, makes concurrent
//! requests for one input share a single computation, expires results after a TTL
//! and keeps storage within a size budget.
//!
//! ```no_run
//! use postproc_cache::{CacheConfig, CacheManager, ProcessOptions, RelationshipInput};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = CacheManager::connect(CacheConfig::shared("redis://localhost:6379")).await?;
//!     let _sweeper = cache.start_sweeper();
//!
//!     let rels = vec![RelationshipInput::new("A", "B", "DEPENDS_ON", 0.75, "a depends on b")];
//!     let entities: Vec<String> = cache
//!         .get_or_process(
//!             "doc-7:chunk-3",
//!             &rels,
//!             |_, rels| async move {
//!                 Ok::<_, anyhow::Error>(rels.iter().map(|r| r.source_id.clone()).collect())
//!             },
//!             ProcessOptions::default(),
//!         )
//!         .await?;
//!
//!     println!("{:?}\n{}", entities, cache.stats().await);
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;

// Re-export main types for convenience
pub use cache::{
    generate_key, BackendConfig, CacheBackend, CacheConfig, CacheConfigBuilder, CacheEntry,
    CacheKey, CacheManager, CacheStats, CacheValue, ChunkProcessor, ChunkRequest, KeyGenerator,
    ProcessOptions, RelationshipInput, WarmReport,
};
pub use error::{CacheError, Result};
