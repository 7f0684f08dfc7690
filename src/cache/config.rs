//! Configuration for the cache system

use crate::cache::types::BackendKind;
use crate::error::{CacheError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Storage backend selection, resolved once at construction time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process memory store
    Memory,

    /// Networked key-value store
    Redis {
        /// Connection URL (e.g. "redis://localhost:6379")
        url: String,
        /// Prefix isolating this cache's keys from other users of the server
        namespace: String,
    },

    /// Relational-table-backed store
    Sqlite {
        /// Database URL or path (e.g. "sqlite:cache.db" or "cache.db")
        url: String,
    },
}

impl BackendConfig {
    /// Which backend variant this selects
    pub fn kind(&self) -> BackendKind {
        match self {
            BackendConfig::Memory => BackendKind::Memory,
            BackendConfig::Redis { .. } => BackendKind::Redis,
            BackendConfig::Sqlite { .. } => BackendKind::Sqlite,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Memory
    }
}

/// Eviction ordering under size pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EvictionPolicy {
    /// Least recently accessed first, ties broken by creation time
    #[default]
    Lru,
}

/// Configuration for the post-processing cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// When false every call computes directly and nothing is stored
    pub enabled: bool,

    /// Storage backend
    pub backend: BackendConfig,

    /// Version tag baked into every key; changing it orphans older entries
    pub version: String,

    /// TTL used when the caller does not pass one
    pub default_ttl: Duration,

    /// Lower TTL bound; shorter TTLs are raised to it
    pub min_ttl: Duration,

    /// Upper TTL bound; longer TTLs are lowered to it
    pub max_ttl: Duration,

    /// TTL jitter factor (0.0 - 1.0) applied to the default TTL
    /// Spreads expirations of entries written together
    pub ttl_jitter: f64,

    /// Total payload bytes that triggers reclamation
    pub max_total_size: u64,

    /// Largest payload admitted to the store
    pub max_entry_size: u64,

    /// Fraction of `max_total_size` reclamation reduces storage to
    pub low_watermark: f64,

    /// Eviction ordering
    pub eviction_policy: EvictionPolicy,

    /// Run the periodic TTL/size sweep
    pub enable_auto_cleanup: bool,

    /// Interval for the periodic sweep
    pub cleanup_interval: Duration,

    /// Append a digest of chunk content to keys when content is supplied
    pub include_content_hash: bool,

    /// Coordinate computations across processes through a backend lease
    pub distributed_lock: bool,

    /// How long a cross-process lease is held before it lapses
    pub lock_lease: Duration,

    /// How often a waiting process polls for another process's result
    pub lock_poll_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            backend: BackendConfig::Memory,
            version: "1.0".to_string(),
            // 24 hours
            default_ttl: Duration::from_secs(24 * 3600),
            min_ttl: Duration::from_secs(60),
            // 30 days
            max_ttl: Duration::from_secs(30 * 24 * 3600),
            ttl_jitter: 0.1,
            // 100 MB
            max_total_size: 100 * 1024 * 1024,
            // 1 MB
            max_entry_size: 1024 * 1024,
            low_watermark: 0.9,
            eviction_policy: EvictionPolicy::Lru,
            enable_auto_cleanup: true,
            // Sweep every 5 minutes
            cleanup_interval: Duration::from_secs(300),
            include_content_hash: false,
            distributed_lock: false,
            lock_lease: Duration::from_secs(120),
            lock_poll_interval: Duration::from_millis(250),
        }
    }
}

impl CacheConfig {
    /// Create a new builder for cache configuration
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.version.is_empty() {
            return Err(CacheError::ConfigError("version must not be empty".to_string()));
        }

        if self.min_ttl > self.max_ttl {
            return Err(CacheError::ConfigError(format!(
                "min_ttl ({:?}) must not exceed max_ttl ({:?})",
                self.min_ttl, self.max_ttl
            )));
        }

        if self.min_ttl.is_zero() {
            return Err(CacheError::ConfigError("min_ttl must be greater than 0".to_string()));
        }

        if self.default_ttl < self.min_ttl || self.default_ttl > self.max_ttl {
            return Err(CacheError::ConfigError(format!(
                "default_ttl ({:?}) must be within [min_ttl, max_ttl] ({:?} - {:?})",
                self.default_ttl, self.min_ttl, self.max_ttl
            )));
        }

        if self.max_total_size == 0 {
            return Err(CacheError::ConfigError(
                "max_total_size must be greater than 0".to_string(),
            ));
        }

        if self.max_entry_size == 0 || self.max_entry_size > self.max_total_size {
            return Err(CacheError::ConfigError(
                "max_entry_size must be in 1..=max_total_size".to_string(),
            ));
        }

        if !(self.low_watermark > 0.0 && self.low_watermark <= 1.0) {
            return Err(CacheError::ConfigError(
                "low_watermark must be in (0.0, 1.0]".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.ttl_jitter) {
            return Err(CacheError::ConfigError(
                "ttl_jitter must be between 0.0 and 1.0".to_string(),
            ));
        }

        if self.cleanup_interval.is_zero() {
            return Err(CacheError::ConfigError(
                "cleanup_interval must be greater than 0".to_string(),
            ));
        }

        if let BackendConfig::Redis { namespace, .. } = &self.backend {
            if namespace.is_empty() {
                return Err(CacheError::ConfigError(
                    "redis namespace must not be empty".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Calculate the default TTL with jitter applied
    ///
    /// The default is brought into `[min_ttl, max_ttl]` before jitter, so an
    /// unvalidated config cannot overflow here.
    pub fn ttl_with_jitter(&self) -> Duration {
        let upper = self.max_ttl.max(self.min_ttl);
        let base = self.default_ttl.clamp(self.min_ttl, upper);
        if self.ttl_jitter == 0.0 {
            return base;
        }

        let base_secs = base.as_secs_f64();
        let jitter_range = base_secs * self.ttl_jitter;
        let jitter = (rand::random::<f64>() * 2.0 - 1.0) * jitter_range;
        let final_secs = (base_secs + jitter).max(0.0);

        Duration::try_from_secs_f64(final_secs).unwrap_or(upper)
    }

    /// TTL actually written: the explicit one, else the jittered default,
    /// clamped to `[min_ttl, max_ttl]`
    pub fn effective_ttl(&self, requested: Option<Duration>) -> Duration {
        let ttl = requested.unwrap_or_else(|| self.ttl_with_jitter());
        ttl.clamp(self.min_ttl, self.max_ttl.max(self.min_ttl))
    }

    /// Byte level reclamation stops at
    pub fn low_watermark_bytes(&self) -> u64 {
        (self.max_total_size as f64 * self.low_watermark).floor() as u64
    }

    /// Load configuration from `PP_CACHE_*` environment variables
    ///
    /// A `.env` file in the working directory is honoured. Unset variables keep
    /// their defaults; malformed ones are a configuration error.
    ///
    /// | Variable | Meaning |
    /// |---|---|
    /// | `PP_CACHE_ENABLED` | `true`/`false` |
    /// | `PP_CACHE_BACKEND` | `memory`, `redis` or `sqlite` |
    /// | `PP_CACHE_REDIS_URL`, `PP_CACHE_REDIS_NAMESPACE` | redis settings |
    /// | `PP_CACHE_SQLITE_URL` | sqlite database |
    /// | `PP_CACHE_VERSION` | key version tag |
    /// | `PP_CACHE_TTL_SECS`, `PP_CACHE_MIN_TTL_SECS`, `PP_CACHE_MAX_TTL_SECS` | TTLs |
    /// | `PP_CACHE_MAX_TOTAL_SIZE`, `PP_CACHE_MAX_ENTRY_SIZE` | byte limits |
    /// | `PP_CACHE_DISTRIBUTED_LOCK` | cross-process coordination |
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut builder = CacheConfig::builder();

        if let Some(v) = lookup("PP_CACHE_ENABLED") {
            builder = builder.enabled(parse_var("PP_CACHE_ENABLED", &v)?);
        }
        if let Some(v) = lookup("PP_CACHE_VERSION") {
            builder = builder.version(v);
        }
        if let Some(v) = lookup("PP_CACHE_TTL_SECS") {
            builder = builder.default_ttl(Duration::from_secs(parse_var("PP_CACHE_TTL_SECS", &v)?));
        }
        if let Some(v) = lookup("PP_CACHE_MIN_TTL_SECS") {
            builder = builder.min_ttl(Duration::from_secs(parse_var("PP_CACHE_MIN_TTL_SECS", &v)?));
        }
        if let Some(v) = lookup("PP_CACHE_MAX_TTL_SECS") {
            builder = builder.max_ttl(Duration::from_secs(parse_var("PP_CACHE_MAX_TTL_SECS", &v)?));
        }
        if let Some(v) = lookup("PP_CACHE_MAX_TOTAL_SIZE") {
            builder = builder.max_total_size(parse_var("PP_CACHE_MAX_TOTAL_SIZE", &v)?);
        }
        if let Some(v) = lookup("PP_CACHE_MAX_ENTRY_SIZE") {
            builder = builder.max_entry_size(parse_var("PP_CACHE_MAX_ENTRY_SIZE", &v)?);
        }
        if let Some(v) = lookup("PP_CACHE_DISTRIBUTED_LOCK") {
            builder = builder.distributed_lock(parse_var("PP_CACHE_DISTRIBUTED_LOCK", &v)?);
        }

        let backend = match lookup("PP_CACHE_BACKEND").as_deref() {
            None | Some("memory") => BackendConfig::Memory,
            Some("redis") => BackendConfig::Redis {
                url: lookup("PP_CACHE_REDIS_URL")
                    .unwrap_or_else(|| "redis://localhost:6379".to_string()),
                namespace: lookup("PP_CACHE_REDIS_NAMESPACE")
                    .unwrap_or_else(|| "ppcache".to_string()),
            },
            Some("sqlite") => BackendConfig::Sqlite {
                url: lookup("PP_CACHE_SQLITE_URL")
                    .unwrap_or_else(|| "sqlite:ppcache.db".to_string()),
            },
            Some(other) => {
                return Err(CacheError::ConfigError(format!(
                    "PP_CACHE_BACKEND must be memory, redis or sqlite (got {:?})",
                    other
                )))
            }
        };

        let config = builder.backend(backend).build();
        config.validate()?;
        Ok(config)
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| CacheError::ConfigError(format!("{} = {:?}: {}", name, value, e)))
}

/// Builder for cache configuration
#[derive(Debug, Default)]
pub struct CacheConfigBuilder {
    enabled: Option<bool>,
    backend: Option<BackendConfig>,
    version: Option<String>,
    default_ttl: Option<Duration>,
    min_ttl: Option<Duration>,
    max_ttl: Option<Duration>,
    ttl_jitter: Option<f64>,
    max_total_size: Option<u64>,
    max_entry_size: Option<u64>,
    low_watermark: Option<f64>,
    enable_auto_cleanup: Option<bool>,
    cleanup_interval: Option<Duration>,
    include_content_hash: Option<bool>,
    distributed_lock: Option<bool>,
    lock_lease: Option<Duration>,
    lock_poll_interval: Option<Duration>,
}

impl CacheConfigBuilder {
    /// Enable or disable caching entirely
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Select the storage backend
    pub fn backend(mut self, backend: BackendConfig) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the key version tag
    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    /// Set default TTL for cache entries
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set minimum TTL
    pub fn min_ttl(mut self, ttl: Duration) -> Self {
        self.min_ttl = Some(ttl);
        self
    }

    /// Set maximum TTL
    pub fn max_ttl(mut self, ttl: Duration) -> Self {
        self.max_ttl = Some(ttl);
        self
    }

    /// Set TTL jitter factor (0.0 - 1.0)
    pub fn ttl_jitter(mut self, jitter: f64) -> Self {
        self.ttl_jitter = Some(jitter);
        self
    }

    /// Set total size limit in bytes
    pub fn max_total_size(mut self, size: u64) -> Self {
        self.max_total_size = Some(size);
        self
    }

    /// Set per-entry size limit in bytes
    pub fn max_entry_size(mut self, size: u64) -> Self {
        self.max_entry_size = Some(size);
        self
    }

    /// Set the reclamation target as a fraction of the total size limit
    pub fn low_watermark(mut self, fraction: f64) -> Self {
        self.low_watermark = Some(fraction);
        self
    }

    /// Enable or disable automatic cleanup
    pub fn enable_auto_cleanup(mut self, enable: bool) -> Self {
        self.enable_auto_cleanup = Some(enable);
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = Some(interval);
        self
    }

    /// Include a content digest in keys
    pub fn include_content_hash(mut self, enable: bool) -> Self {
        self.include_content_hash = Some(enable);
        self
    }

    /// Enable cross-process coordination
    pub fn distributed_lock(mut self, enable: bool) -> Self {
        self.distributed_lock = Some(enable);
        self
    }

    /// Set the cross-process lease duration
    pub fn lock_lease(mut self, lease: Duration) -> Self {
        self.lock_lease = Some(lease);
        self
    }

    /// Set the cross-process poll interval
    pub fn lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = Some(interval);
        self
    }

    /// Build the cache configuration
    pub fn build(self) -> CacheConfig {
        let defaults = CacheConfig::default();

        CacheConfig {
            enabled: self.enabled.unwrap_or(defaults.enabled),
            backend: self.backend.unwrap_or(defaults.backend),
            version: self.version.unwrap_or(defaults.version),
            default_ttl: self.default_ttl.unwrap_or(defaults.default_ttl),
            min_ttl: self.min_ttl.unwrap_or(defaults.min_ttl),
            max_ttl: self.max_ttl.unwrap_or(defaults.max_ttl),
            ttl_jitter: self.ttl_jitter.unwrap_or(defaults.ttl_jitter),
            max_total_size: self.max_total_size.unwrap_or(defaults.max_total_size),
            max_entry_size: self.max_entry_size.unwrap_or(defaults.max_entry_size),
            low_watermark: self.low_watermark.unwrap_or(defaults.low_watermark),
            eviction_policy: defaults.eviction_policy,
            enable_auto_cleanup: self
                .enable_auto_cleanup
                .unwrap_or(defaults.enable_auto_cleanup),
            cleanup_interval: self.cleanup_interval.unwrap_or(defaults.cleanup_interval),
            include_content_hash: self
                .include_content_hash
                .unwrap_or(defaults.include_content_hash),
            distributed_lock: self.distributed_lock.unwrap_or(defaults.distributed_lock),
            lock_lease: self.lock_lease.unwrap_or(defaults.lock_lease),
            lock_poll_interval: self
                .lock_poll_interval
                .unwrap_or(defaults.lock_poll_interval),
        }
    }
}

/// Preset configurations for common use cases
impl CacheConfig {
    /// Small, short-lived in-memory cache for tests and local runs
    pub fn ephemeral() -> Self {
        Self {
            default_ttl: Duration::from_secs(300),
            min_ttl: Duration::from_millis(1),
            max_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.0,
            max_total_size: 10 * 1024 * 1024,
            max_entry_size: 1024 * 1024,
            enable_auto_cleanup: false,
            ..Default::default()
        }
    }

    /// Shared Redis cache for a fleet of workers
    pub fn shared(redis_url: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Redis {
                url: redis_url.into(),
                namespace: "ppcache".to_string(),
            },
            max_total_size: 1024 * 1024 * 1024,
            distributed_lock: true,
            ..Default::default()
        }
    }

    /// Durable single-node cache in a SQLite file
    pub fn persistent(path: impl Into<String>) -> Self {
        Self {
            backend: BackendConfig::Sqlite { url: path.into() },
            default_ttl: Duration::from_secs(7 * 24 * 3600),
            max_total_size: 1024 * 1024 * 1024,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert_eq!(config.backend, BackendConfig::Memory);
        assert_eq!(config.eviction_policy, EvictionPolicy::Lru);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = CacheConfig::default();
        config.min_ttl = Duration::from_secs(10);
        config.max_ttl = Duration::from_secs(5);
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.max_entry_size = config.max_total_size + 1;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.low_watermark = 0.0;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.ttl_jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = CacheConfig::default();
        config.version = String::new();
        assert!(matches!(config.validate(), Err(CacheError::ConfigError(_))));
    }

    #[test]
    fn test_config_builder() {
        let config = CacheConfig::builder()
            .version("2.1")
            .default_ttl(Duration::from_secs(600))
            .max_total_size(50_000_000)
            .max_entry_size(1_000)
            .low_watermark(0.8)
            .build();

        assert_eq!(config.version, "2.1");
        assert_eq!(config.default_ttl, Duration::from_secs(600));
        assert_eq!(config.max_total_size, 50_000_000);
        assert_eq!(config.max_entry_size, 1_000);
        assert_eq!(config.low_watermark_bytes(), 40_000_000);
    }

    #[test]
    fn test_effective_ttl_clamps() {
        let config = CacheConfig::builder()
            .min_ttl(Duration::from_secs(60))
            .max_ttl(Duration::from_secs(3600))
            .default_ttl(Duration::from_secs(600))
            .ttl_jitter(0.0)
            .build();

        assert_eq!(config.effective_ttl(Some(Duration::from_secs(1))), Duration::from_secs(60));
        assert_eq!(config.effective_ttl(Some(Duration::from_secs(99_999))), Duration::from_secs(3600));
        assert_eq!(config.effective_ttl(Some(Duration::from_secs(120))), Duration::from_secs(120));
        assert_eq!(config.effective_ttl(None), Duration::from_secs(600));
    }

    #[test]
    fn test_huge_default_ttl() {
        let config = CacheConfig::builder()
            .default_ttl(Duration::from_secs(u64::MAX))
            .build();
        assert!(matches!(config.validate(), Err(CacheError::ConfigError(_))));
        // still usable without validation
        assert!(config.effective_ttl(None) <= config.max_ttl);

        let from_env = CacheConfig::from_lookup(|k| {
            (k == "PP_CACHE_TTL_SECS").then(|| u64::MAX.to_string())
        });
        assert!(matches!(from_env, Err(CacheError::ConfigError(_))));

        let short = CacheConfig::builder()
            .min_ttl(Duration::from_secs(60))
            .default_ttl(Duration::from_secs(1))
            .build();
        assert!(short.validate().is_err());
        assert!(short.effective_ttl(None) >= short.min_ttl);
    }

    #[test]
    fn test_ttl_with_jitter() {
        let config = CacheConfig {
            default_ttl: Duration::from_secs(3600),
            ttl_jitter: 0.1,
            ..Default::default()
        };

        for _ in 0..20 {
            let ttl = config.ttl_with_jitter().as_secs_f64();
            assert!(ttl >= 3240.0 && ttl <= 3960.0);
        }
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("PP_CACHE_BACKEND", "redis"),
            ("PP_CACHE_REDIS_URL", "redis://cache:6379"),
            ("PP_CACHE_VERSION", "3"),
            ("PP_CACHE_TTL_SECS", "120"),
            ("PP_CACHE_DISTRIBUTED_LOCK", "true"),
        ]);
        let config = CacheConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(config.version, "3");
        assert_eq!(config.default_ttl, Duration::from_secs(120));
        assert!(config.distributed_lock);
        assert_eq!(
            config.backend,
            BackendConfig::Redis {
                url: "redis://cache:6379".to_string(),
                namespace: "ppcache".to_string(),
            }
        );
    }

    #[test]
    fn test_from_lookup_rejects_garbage() {
        let bad_backend = CacheConfig::from_lookup(|k| {
            (k == "PP_CACHE_BACKEND").then(|| "cassandra".to_string())
        });
        assert!(matches!(bad_backend, Err(CacheError::ConfigError(_))));

        let bad_number = CacheConfig::from_lookup(|k| {
            (k == "PP_CACHE_TTL_SECS").then(|| "soon".to_string())
        });
        assert!(matches!(bad_number, Err(CacheError::ConfigError(_))));
    }

    #[test]
    fn test_preset_configs() {
        assert!(CacheConfig::ephemeral().validate().is_ok());
        assert_eq!(CacheConfig::shared("redis://x").backend.kind(), BackendKind::Redis);
        assert!(CacheConfig::shared("redis://x").distributed_lock);
        assert_eq!(CacheConfig::persistent("c.db").backend.kind(), BackendKind::Sqlite);
    }
}
