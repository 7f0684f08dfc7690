//! Core type definitions for the cache system

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Cache key type - `pp_v{version}_{chunk_id}_{hash}` strings
pub type CacheKey = String;

/// Cache value type - stores serialized processing results
pub type CacheValue = String;

/// A single relationship attached to a chunk, as handed to the post-processor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipInput {
    /// Source entity identifier
    #[serde(alias = "src")]
    pub source_id: String,

    /// Target entity identifier
    #[serde(alias = "tgt")]
    pub target_id: String,

    /// Free-form relationship type ("causes", "integrates with", ...)
    #[serde(alias = "type")]
    pub relationship_type: String,

    /// Relationship strength
    pub weight: f64,

    /// Human-readable description
    #[serde(default)]
    pub description: String,
}

impl RelationshipInput {
    /// Create a new relationship
    pub fn new(
        source_id: impl Into<String>,
        target_id: impl Into<String>,
        relationship_type: impl Into<String>,
        weight: f64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            target_id: target_id.into(),
            relationship_type: relationship_type.into(),
            weight,
            description: description.into(),
        }
    }
}

/// Storage backend variants
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-process memory store
    Memory,

    /// Networked key-value store (Redis)
    Redis,

    /// Relational-table-backed store (SQLite)
    Sqlite,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Memory => write!(f, "memory"),
            BackendKind::Redis => write!(f, "redis"),
            BackendKind::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Point-in-time view of cache metrics and storage occupancy
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CacheStats {
    /// Total number of cache hits
    pub hits: u64,

    /// Total number of cache misses
    pub misses: u64,

    /// Followers that received a leader's result instead of computing
    pub coalesced: u64,

    /// Estimated tokens not spent thanks to hits
    pub tokens_saved: u64,

    /// Estimated computation time not spent thanks to hits
    pub time_saved: Duration,

    /// Calls served without the backend because it failed, counted once per call
    pub degraded: u64,

    /// Writes that failed after a successful computation
    pub write_failures: u64,

    /// Results not persisted because they exceeded the per-entry size limit
    pub rejected_oversized: u64,

    /// Number of evictions due to size limits
    pub evictions_size: u64,

    /// Number of evictions due to TTL expiration
    pub evictions_ttl: u64,

    /// Number of entries currently stored (None when the backend could not be read)
    pub entries: Option<usize>,

    /// Total size of stored payloads in bytes (None when the backend could not be read)
    pub size_bytes: Option<u64>,
}

impl CacheStats {
    /// Hit ratio in `[0.0, 1.0]`; 0.0 when nothing has been observed
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    /// Total evictions
    pub fn total_evictions(&self) -> u64 {
        self.evictions_size + self.evictions_ttl
    }

    /// Estimated spend avoided at the given price per 1000 tokens
    pub fn cost_savings(&self, cost_per_1k_tokens: f64) -> f64 {
        self.tokens_saved as f64 / 1000.0 * cost_per_1k_tokens
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "CacheStats {{ hits: {}, misses: {}, hit_rate: {:.2}%, tokens_saved: {}, degraded: {}, evictions: {}",
            self.hits,
            self.misses,
            self.hit_rate() * 100.0,
            self.tokens_saved,
            self.degraded,
            self.total_evictions()
        )?;
        if let Some(entries) = self.entries {
            write!(f, ", entries: {}", entries)?;
        }
        if let Some(size) = self.size_bytes {
            write!(f, ", size: {} bytes", size)?;
        }
        write!(f, " }}")
    }
}
