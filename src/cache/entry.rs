//! Cache entry management with TTL support

use crate::cache::types::{CacheKey, CacheValue};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::time::Duration;

/// A stored processing result with TTL and recency metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// The cache key
    pub key: CacheKey,

    /// The serialized result payload
    pub value: CacheValue,

    /// Entry metadata
    pub metadata: EntryMetadata,
}

impl CacheEntry {
    /// Create a new entry expiring `ttl` from now
    pub fn new(key: CacheKey, value: CacheValue, ttl: Duration) -> Self {
        let now = Utc::now();
        Self::with_expiration(key, value, now, expires_after(now, ttl))
    }

    /// Create an entry with explicit creation and expiration times
    pub fn with_expiration(
        key: CacheKey,
        value: CacheValue,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        let size_bytes = value.len() as u64;

        Self {
            key,
            value,
            metadata: EntryMetadata {
                created_at,
                accessed_at: created_at,
                expires_at,
                access_count: 0,
                size_bytes,
            },
        }
    }

    /// Check if the entry has expired
    pub fn is_expired(&self) -> bool {
        self.metadata.is_expired_at(Utc::now())
    }

    /// Get time until expiration
    pub fn time_until_expiration(&self) -> Option<Duration> {
        (self.metadata.expires_at - Utc::now()).to_std().ok()
    }

    /// Mark the entry as accessed (updates access time and count)
    pub fn mark_accessed(&mut self) {
        self.metadata.touch(Utc::now());
    }

    /// Get the age of the entry
    pub fn age(&self) -> Duration {
        (Utc::now() - self.metadata.created_at)
            .to_std()
            .unwrap_or(Duration::from_secs(0))
    }
}

/// Metadata associated with a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// When the entry was created
    pub created_at: DateTime<Utc>,

    /// Last access time (for LRU tracking)
    pub accessed_at: DateTime<Utc>,

    /// When the entry expires
    pub expires_at: DateTime<Utc>,

    /// Number of times this entry has been read
    pub access_count: u64,

    /// Size of the payload in bytes
    pub size_bytes: u64,
}

impl EntryMetadata {
    /// Whether the entry is past its expiration at `now`
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Record a read at `now`
    pub fn touch(&mut self, now: DateTime<Utc>) {
        // Clock steps backwards must not make an entry look older.
        if now > self.accessed_at {
            self.accessed_at = now;
        }
        self.access_count += 1;
    }
}

/// Eviction view of a stored entry, without the payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrySummary {
    pub key: CacheKey,
    pub metadata: EntryMetadata,
}

impl EntrySummary {
    /// Least-recently-used ordering: last access, then creation time, then key
    pub fn lru_cmp(&self, other: &Self) -> Ordering {
        self.metadata
            .accessed_at
            .cmp(&other.metadata.accessed_at)
            .then_with(|| self.metadata.created_at.cmp(&other.metadata.created_at))
            .then_with(|| self.key.cmp(&other.key))
    }
}

impl From<&CacheEntry> for EntrySummary {
    fn from(entry: &CacheEntry) -> Self {
        Self {
            key: entry.key.clone(),
            metadata: entry.metadata.clone(),
        }
    }
}

/// `now + ttl`, saturating instead of overflowing for absurd TTLs
pub(crate) fn expires_after(now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(ttl)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
