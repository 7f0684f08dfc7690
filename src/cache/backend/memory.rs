//! In-process memory backend

use super::{glob_match, CacheBackend};
use crate::cache::entry::{CacheEntry, EntrySummary};
use crate::cache::types::{BackendKind, CacheKey, CacheValue};
use crate::error::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::debug;

/// Memory-resident store guarded by an async `RwLock`
#[derive(Debug, Default)]
pub struct MemoryBackend {
    store: RwLock<MemoryStore>,
}

#[derive(Debug, Default)]
struct MemoryStore {
    /// Main storage: key -> entry
    entries: HashMap<CacheKey, CacheEntry>,

    /// Running sum of payload sizes
    current_size_bytes: u64,
}

impl MemoryStore {
    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.current_size_bytes = self
            .current_size_bytes
            .saturating_sub(entry.metadata.size_bytes);
        Some(entry)
    }

    fn insert_entry(&mut self, entry: CacheEntry) {
        let size = entry.metadata.size_bytes;
        if let Some(previous) = self.entries.insert(entry.key.clone(), entry) {
            self.current_size_bytes = self
                .current_size_bytes
                .saturating_sub(previous.metadata.size_bytes);
        }
        self.current_size_bytes += size;
    }
}

impl MemoryBackend {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully-formed entry, keeping its timestamps
    pub async fn insert_entry(&self, entry: CacheEntry) {
        self.store.write().await.insert_entry(entry);
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn get(&self, key: &str) -> Result<Option<CacheEntry>> {
        let mut store = self.store.write().await;
        let now = Utc::now();

        match store.entries.get_mut(key) {
            None => return Ok(None),
            Some(entry) if !entry.metadata.is_expired_at(now) => {
                entry.metadata.touch(now);
                return Ok(Some(entry.clone()));
            }
            Some(_) => {}
        }

        debug!("Memory entry expired on read: {}", key);
        store.remove_entry(key);
        Ok(None)
    }

    async fn set(&self, key: &str, value: CacheValue, ttl: Duration) -> Result<()> {
        let entry = CacheEntry::new(key.to_string(), value, ttl);
        self.store.write().await.insert_entry(entry);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.store.write().await.remove_entry(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let store = self.store.read().await;
        Ok(store
            .entries
            .get(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false))
    }

    async fn total_size(&self) -> Result<u64> {
        Ok(self.store.read().await.current_size_bytes)
    }

    async fn len(&self) -> Result<usize> {
        Ok(self.store.read().await.entries.len())
    }

    async fn summaries(&self) -> Result<Vec<EntrySummary>> {
        let store = self.store.read().await;
        Ok(store.entries.values().map(EntrySummary::from).collect())
    }

    async fn purge_expired(&self) -> Result<Vec<CacheKey>> {
        let mut store = self.store.write().await;
        let now = Utc::now();

        let expired: Vec<CacheKey> = store
            .entries
            .values()
            .filter(|e| e.metadata.is_expired_at(now))
            .map(|e| e.key.clone())
            .collect();

        for key in &expired {
            store.remove_entry(key);
        }
        Ok(expired)
    }

    async fn delete_matching(&self, pattern: &str) -> Result<usize> {
        let mut store = self.store.write().await;

        let matched: Vec<CacheKey> = store
            .entries
            .keys()
            .filter(|k| glob_match(pattern, k))
            .cloned()
            .collect();

        for key in &matched {
            store.remove_entry(key);
        }
        Ok(matched.len())
    }
}
