//! SQLite backend for durable single-node caches
//!
//! Timestamps are stored as integer nanoseconds since the epoch so entry metadata
//! round-trips exactly.

use super::{glob_match, to_u64, CacheBackend};
use crate::cache::entry::{CacheEntry, EntryMetadata, EntrySummary};
use crate::cache::types::{BackendKind, CacheKey, CacheValue};
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::time::Duration;
use tracing::{debug, info};

const NANOS_PER_SEC: i64 = 1_000_000_000;

pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open (creating if needed) the database at `database_url`
    ///
    /// Accepts either a full URL ("sqlite:cache.db") or a bare path ("cache.db").
    pub async fn connect(database_url: &str) -> Result<Self> {
        let url = if database_url.starts_with("sqlite:") {
            database_url.to_string()
        } else {
            format!("sqlite:{}?mode=rwc", database_url)
        };

        // Every connection to ":memory:" is a separate database.
        let max_connections = if url.contains(":memory:") { 1 } else { 8 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        let backend = Self { pool };
        backend.run_migrations().await?;
        info!("SQLite cache backend ready: {}", url);
        Ok(backend)
    }

    /// Private in-memory database
    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pp_cache_entries (
                cache_key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                accessed_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                access_count INTEGER NOT NULL DEFAULT 0,
                size_bytes INTEGER NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pp_cache_expires_at ON pp_cache_entries(expires_at)",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_pp_cache_accessed_at ON pp_cache_entries(accessed_at)",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn to_nanos(dt: DateTime<Utc>) -> i64 {
    // Saturated expirations (far future) do not fit in i64 nanoseconds.
    dt.timestamp_nanos_opt().unwrap_or(i64::MAX)
}

fn from_nanos(nanos: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(
        nanos.div_euclid(NANOS_PER_SEC),
        nanos.rem_euclid(NANOS_PER_SEC) as u32,
    )
    .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn metadata_from_row(row: &SqliteRow) -> Result<EntryMetadata> {
    Ok(EntryMetadata {
        created_at: from_nanos(row.try_get("created_at")?),
        accessed_at: from_nanos(row.try_get("accessed_at")?),
        expires_at: from_nanos(row.try_get("expires_at")?),
        access_count: to_u64(row.try_get("access_count")?),
        size_bytes: to_u64(row.try_get("size_bytes")?),
    })
}

#[async_trait]
impl CacheBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let row = sqlx::query(
            r#"
            SELECT value, created_at, accessed_at, expires_at, access_count, size_bytes
            FROM pp_cache_entries
            WHERE cache_key = ?
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let value: String = row.try_get("value")?;
        let mut metadata = metadata_from_row(&row)?;
        let now = Utc::now();

        if metadata.is_expired_at(now) {
            debug!("SQLite entry expired on read: {}", key);
            self.delete(key).await?;
            return Ok(None);
        }

        metadata.touch(now);
        sqlx::query(
            "UPDATE pp_cache_entries SET accessed_at = ?, access_count = ? WHERE cache_key = ?",
        )
        .bind(to_nanos(metadata.accessed_at))
        .bind(metadata.access_count as i64)
        .bind(key)
        .execute(&self.pool)
        .await?;

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            metadata,
        }))
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key.to_string(), value, ttl);
        let m = &entry.metadata;

        sqlx::query(
            r#"
            INSERT INTO pp_cache_entries
                (cache_key, value, created_at, accessed_at, expires_at, access_count, size_bytes)
            VALUES (?, ?, ?, ?, ?, 0, ?)
            ON CONFLICT(cache_key) DO UPDATE SET
                value = excluded.value,
                created_at = excluded.created_at,
                accessed_at = excluded.accessed_at,
                expires_at = excluded.expires_at,
                access_count = 0,
                size_bytes = excluded.size_bytes
            "#,
        )
        .bind(key)
        .bind(&entry.value)
        .bind(to_nanos(m.created_at))
        .bind(to_nanos(m.accessed_at))
        .bind(to_nanos(m.expires_at))
        .bind(m.size_bytes as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM pp_cache_entries WHERE cache_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let row = sqlx::query("SELECT 1 FROM pp_cache_entries WHERE cache_key = ? AND expires_at > ?")
            .bind(key)
            .bind(to_nanos(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn total_size(&self) -> Result<u64> {
        let total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM pp_cache_entries")
                .fetch_one(&self.pool)
                .await?;
        Ok(to_u64(total))
    }

    async fn len(&self) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pp_cache_entries")
            .fetch_one(&self.pool)
            .await?;
        Ok(to_u64(count) as usize)
    }

    async fn summaries(&self) -> Result<Vec<EntrySummary>> {
        let rows = sqlx::query(
            r#"
            SELECT cache_key, created_at, accessed_at, expires_at, access_count, size_bytes
            FROM pp_cache_entries
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(EntrySummary {
                    key: row.try_get("cache_key")?,
                    metadata: metadata_from_row(row)?,
                })
            })
            .collect()
    }

    async fn purge_expired(&self) -> Result<Vec<CacheKey>> {
        let keys: Vec<String> = sqlx::query_scalar(
            "DELETE FROM pp_cache_entries WHERE expires_at <= ? RETURNING cache_key",
        )
        .bind(to_nanos(Utc::now()))
        .fetch_all(&self.pool)
        .await?;
        Ok(keys)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let keys: Vec<String> = sqlx::query_scalar("SELECT cache_key FROM pp_cache_entries")
            .fetch_all(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;
        let mut removed = 0;
        for key in keys.iter().filter(|k| glob_match(pattern, k)) {
            let result = sqlx::query("DELETE FROM pp_cache_entries WHERE cache_key = ?")
                .bind(key)
                .execute(&mut *tx)
                .await?;
            removed += result.rows_affected() as usize;
        }
        tx.commit().await?;

        Ok(removed)
    }
}
