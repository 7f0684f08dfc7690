//! Redis backend shared by a fleet of workers
//!
//! Layout under a namespace `ns`:
//!
//! - `{ns}:entry:{key}`: payload string, expiring via `PX`
//! - `{ns}:meta`: hash of `key -> EntryMetadata` JSON, used for size accounting,
//!   eviction and recency
//! - `{ns}:lease:{key}`: computation lease, `SET NX PX` with a random token
//!
//! Redis expires payloads itself; metadata of expired payloads is dropped on the
//! next read of the key or by `purge_expired`.

use super::{glob_match, CacheBackend, Reservation};
use crate::cache::entry::{CacheEntry, EntryMetadata, EntrySummary};
use crate::cache::types::{BackendKind, CacheKey, CacheValue};
use crate::error::Result;
use ::redis::aio::ConnectionManager;
use ::redis::{Client, Script};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deletes the lease only if it still carries our token
const RELEASE_SCRIPT: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
else
    return 0
end
"#;

/// Writes touched metadata only while the payload still exists, so a concurrent
/// delete cannot leave an orphaned metadata field behind
const TOUCH_SCRIPT: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 1 then
    redis.call("HSET", KEYS[2], ARGV[1], ARGV[2])
    return 1
else
    return 0
end
"#;

pub struct RedisBackend {
    conn: ConnectionManager,
    namespace: String,
}

impl RedisBackend {
    /// Connect to `url`, keeping all keys under `namespace`
    pub async fn connect(url: &str, namespace: &str) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;
        info!("Redis cache backend connected (namespace: {})", namespace);

        Ok(Self {
            conn,
            namespace: namespace.to_string(),
        })
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:entry:{}", self.namespace, key)
    }

    fn meta_key(&self) -> String {
        format!("{}:meta", self.namespace)
    }

    fn lease_key(&self, key: &str) -> String {
        format!("{}:lease:{}", self.namespace, key)
    }

    async fn all_metadata(&self) -> Result<Vec<(CacheKey, EntryMetadata)>> {
        let mut conn = self.conn.clone();
        let raw: Vec<(String, String)> = ::redis::cmd("HGETALL")
            .arg(self.meta_key())
            .query_async(&mut conn)
            .await?;

        let mut out = Vec::with_capacity(raw.len());
        for (key, json) in raw {
            match serde_json::from_str::<EntryMetadata>(&json) {
                Ok(metadata) => out.push((key, metadata)),
                Err(e) => warn!("Skipping unreadable metadata for {}: {}", key, e),
            }
        }
        Ok(out)
    }

    /// Store touched metadata if the payload is still there; false when it is gone
    async fn touch(&self, key: &str, metadata: &EntryMetadata) -> Result<bool> {
        let mut conn = self.conn.clone();
        let touched: i64 = Script::new(TOUCH_SCRIPT)
            .key(self.entry_key(key))
            .key(self.meta_key())
            .arg(key)
            .arg(serde_json::to_string(metadata)?)
            .invoke_async(&mut conn)
            .await?;
        Ok(touched == 1)
    }

    /// Drop payloads and metadata for `keys`; returns how many payloads existed
    async fn remove_keys(&self, keys: &[CacheKey]) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.clone();
        let entry_keys: Vec<String> = keys.iter().map(|k| self.entry_key(k)).collect();
        let (removed, _): (usize, usize) = ::redis::pipe()
            .atomic()
            .cmd("DEL")
            .arg(&entry_keys)
            .cmd("HDEL")
            .arg(self.meta_key())
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut conn = self.conn.clone();
        let (value, meta): (Option<String>, Option<String>) = ::redis::pipe()
            .cmd("GET")
            .arg(self.entry_key(key))
            .cmd("HGET")
            .arg(self.meta_key())
            .arg(key)
            .query_async(&mut conn)
            .await?;

        let (value, meta) = match (value, meta) {
            (Some(value), Some(meta)) => (value, meta),
            (None, Some(_)) => {
                debug!("Redis entry expired on read: {}", key);
                self.remove_keys(&[key.to_string()]).await?;
                return Ok(None);
            }
            _ => return Ok(None),
        };

        let mut metadata: EntryMetadata = serde_json::from_str(&meta)?;
        let now = Utc::now();
        if metadata.is_expired_at(now) {
            self.remove_keys(&[key.to_string()]).await?;
            return Ok(None);
        }
        metadata.touch(now);
        if !self.touch(key, &metadata).await? {
            debug!("Redis entry removed while being read: {}", key);
        }

        Ok(Some(CacheEntry {
            key: key.to_string(),
            value,
            metadata,
        }))
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key.to_string(), value, ttl);
        let ttl_ms = (ttl.as_millis() as u64).max(1);

        let mut conn = self.conn.clone();
        let _: () = ::redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(self.entry_key(key))
            .arg(&entry.value)
            .arg("PX")
            .arg(ttl_ms)
            .ignore()
            .cmd("HSET")
            .arg(self.meta_key())
            .arg(key)
            .arg(serde_json::to_string(&entry.metadata)?)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.remove_keys(&[key.to_string()]).await? > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let n: i64 = ::redis::cmd("EXISTS")
            .arg(self.entry_key(key))
            .query_async(&mut conn)
            .await?;
        Ok(n > 0)
    }

    async fn total_size(&self) -> Result<u64> {
        Ok(self
            .all_metadata()
            .await?
            .iter()
            .map(|(_, m)| m.size_bytes)
            .sum())
    }

    async fn len(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let n: usize = ::redis::cmd("HLEN")
            .arg(self.meta_key())
            .query_async(&mut conn)
            .await?;
        Ok(n)
    }

    async fn summaries(&self) -> Result<Vec<EntrySummary>> {
        Ok(self
            .all_metadata()
            .await?
            .into_iter()
            .map(|(key, metadata)| EntrySummary { key, metadata })
            .collect())
    }

    async fn purge_expired(&self) -> Result<Vec<CacheKey>> {
        let now = Utc::now();
        let expired: Vec<CacheKey> = self
            .all_metadata()
            .await?
            .into_iter()
            .filter(|(_, m)| m.is_expired_at(now))
            .map(|(key, _)| key)
            .collect();

        self.remove_keys(&expired).await?;
        Ok(expired)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let mut conn = self.conn.clone();
        let keys: Vec<String> = ::redis::cmd("HKEYS")
            .arg(self.meta_key())
            .query_async(&mut conn)
            .await?;

        let matched: Vec<CacheKey> = keys.into_iter().filter(|k| glob_match(pattern, k)).collect();
        self.remove_keys(&matched).await?;
        Ok(matched.len())
    }

    async fn reserve(&self, key: &str, lease: Duration) -> Result<Option<Reservation>> {
        let token = Uuid::new_v4().to_string();
        let lease_ms = (lease.as_millis() as u64).max(1);

        let mut conn = self.conn.clone();
        let granted: Option<String> = ::redis::cmd("SET")
            .arg(self.lease_key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(lease_ms)
            .query_async(&mut conn)
            .await?;

        Ok(granted.map(|_| Reservation {
            key: key.to_string(),
            token,
        }))
    }

    async fn release(&self, reservation: &Reservation) -> Result<()> {
        let mut conn = self.conn.clone();
        let released: i64 = Script::new(RELEASE_SCRIPT)
            .key(self.lease_key(&reservation.key))
            .arg(&reservation.token)
            .invoke_async(&mut conn)
            .await?;

        if released == 0 {
            warn!("Lease on {} lapsed before release", reservation.key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use testcontainers::clients::Cli;
    use testcontainers_modules::redis::Redis;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_touch_after_delete_leaves_no_metadata() {
        let docker = Cli::default();
        let node = docker.run(Redis::default());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));
        let backend = RedisBackend::connect(&url, "pptouch").await.unwrap();

        backend
            .set("k", "payload".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        let entry = backend.get("k").await.unwrap().unwrap();
        assert!(backend.touch("k", &entry.metadata).await.unwrap());

        // A delete lands between reading the entry and recording the access.
        assert!(backend.delete("k").await.unwrap());
        assert!(!backend.touch("k", &entry.metadata).await.unwrap());

        assert_eq!(backend.len().await.unwrap(), 0);
        assert_eq!(backend.total_size().await.unwrap(), 0);
    }
}
