//! Storage backends
//!
//! Every backend implements [`CacheBackend`]. The variant is chosen once, when the
//! cache is built from its [`BackendConfig`](crate::cache::config::BackendConfig);
//! nothing downstream dispatches on backend names.

pub mod memory;
#[cfg(feature = "redis-backend")]
pub mod redis;
#[cfg(feature = "sqlite-backend")]
pub mod sqlite;

use crate::cache::config::BackendConfig;
use crate::cache::entry::{CacheEntry, EntrySummary};
use crate::cache::types::{BackendKind, CacheKey, CacheValue};
use crate::error::{CacheError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

pub use memory::MemoryBackend;
#[cfg(feature = "redis-backend")]
pub use self::redis::RedisBackend;
#[cfg(feature = "sqlite-backend")]
pub use self::sqlite::SqliteBackend;

/// Advisory claim on computing a key, held by one process at a time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub key: CacheKey,
    pub token: String,
}

impl Reservation {
    /// A reservation that needs no backend round-trip to release
    pub fn local(key: &str) -> Self {
        Self {
            key: key.to_string(),
            token: String::new(),
        }
    }
}

/// Key/value persistence with TTL and size accounting
///
/// Contract shared by all backends:
/// - `get` treats an expired entry as absent and bumps access time on a hit;
/// - `set` overwrites, recording creation, expiration and size;
/// - `exists` never counts as a read;
/// - `get` after `set` from the same caller observes the write.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> BackendKind;

    /// Fetch a live entry, marking it accessed
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>>;

    /// Store `value` under `key` for `ttl`
    async fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()>;

    /// Remove an entry; true if something was removed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Whether a live entry exists, without touching its recency
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Sum of stored payload sizes in bytes
    async fn total_size(&self) -> Result<u64>;

    /// Number of stored entries, expired-but-unswept ones included
    async fn len(&self) -> Result<usize>;

    /// Metadata of every stored entry, for eviction decisions
    async fn summaries(&self) -> Result<Vec<EntrySummary>>;

    /// Remove every expired entry, returning the removed keys
    async fn purge_expired(&self) -> Result<Vec<CacheKey>>;

    /// Remove entries whose key matches a glob (`*` and `?`), returning the count
    async fn delete_matching(&self, pattern: &str) -> Result<usize>;

    /// Try to claim the computation of `key` for `lease`
    ///
    /// `Ok(None)` means another holder currently owns it. Backends without a
    /// shared coordination domain always grant.
    async fn reserve(&self, key: &str, _lease: Duration) -> Result<Option<Reservation>> {
        Ok(Some(Reservation::local(key)))
    }

    /// Give back a reservation obtained from [`CacheBackend::reserve`]
    async fn release(&self, _reservation: &Reservation) -> Result<()> {
        Ok(())
    }
}

/// Build the backend selected by configuration
pub async fn connect(config: &BackendConfig) -> Result<Arc<dyn CacheBackend>> {
    info!("Connecting cache backend: {}", config.kind());

    match config {
        BackendConfig::Memory => Ok(Arc::new(MemoryBackend::new())),

        #[cfg(feature = "redis-backend")]
        BackendConfig::Redis { url, namespace } => {
            Ok(Arc::new(RedisBackend::connect(url, namespace).await?))
        }
        #[cfg(not(feature = "redis-backend"))]
        BackendConfig::Redis { .. } => Err(CacheError::ConfigError(
            "redis backend requested but the `redis-backend` feature is disabled".to_string(),
        )),

        #[cfg(feature = "sqlite-backend")]
        BackendConfig::Sqlite { url } => Ok(Arc::new(SqliteBackend::connect(url).await?)),
        #[cfg(not(feature = "sqlite-backend"))]
        BackendConfig::Sqlite { .. } => Err(CacheError::ConfigError(
            "sqlite backend requested but the `sqlite-backend` feature is disabled".to_string(),
        )),
    }
}

/// Glob match supporting `*` (any run) and `?` (any single character)
pub fn glob_match(pattern: &str, key: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let k: Vec<char> = key.chars().collect();

    let (mut pi, mut ki) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ki < k.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == k[ki]) {
            pi += 1;
            ki += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ki));
            pi += 1;
        } else if let Some((sp, sk)) = star {
            pi = sp + 1;
            ki = sk + 1;
            star = Some((sp, sk + 1));
        } else {
            return false;
        }
    }

    p[pi..].iter().all(|c| *c == '*')
}

/// Signed database integer to a byte count; negatives clamp to zero
#[cfg_attr(not(feature = "sqlite-backend"), allow(dead_code))]
pub(crate) fn to_u64(n: i64) -> u64 {
    u64::try_from(n).unwrap_or(0)
}

#[cfg_attr(
    not(any(feature = "redis-backend", feature = "sqlite-backend")),
    allow(dead_code)
)]
pub(crate) fn backend_err(context: &str, err: impl std::fmt::Display) -> CacheError {
    CacheError::BackendError(format!("{}: {}", context, err))
}
