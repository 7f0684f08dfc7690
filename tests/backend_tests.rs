//! Behaviour every storage backend must share, run against each variant
//!
//! The Redis run needs Docker and is ignored by default:
//! `cargo test --test backend_tests -- --ignored`

use postproc_cache::cache::backend::{CacheBackend, MemoryBackend};
use postproc_cache::{CacheConfig, CacheManager, ProcessOptions, RelationshipInput};
use std::sync::Arc;
use std::time::Duration;
use tokio_test::assert_ok;

async fn check_contract(backend: &dyn CacheBackend) {
    backend.delete_matching("*").await.unwrap();

    // Read-your-write
    backend
        .set("pp_v1_a", "alpha".to_string(), Duration::from_secs(60))
        .await
        .unwrap();
    let entry = assert_ok!(backend.get("pp_v1_a").await).expect("entry just written");
    assert_eq!(entry.value, "alpha");
    assert_eq!(entry.metadata.size_bytes, 5);
    assert_eq!(entry.metadata.access_count, 1);

    // Overwrite replaces value and size
    backend
        .set("pp_v1_a", "a".to_string(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(backend.get("pp_v1_a").await.unwrap().unwrap().value, "a");
    assert_eq!(backend.total_size().await.unwrap(), 1);

    // exists() never counts as a read
    let before = backend.summaries().await.unwrap()[0].metadata.clone();
    assert!(backend.exists("pp_v1_a").await.unwrap());
    assert_eq!(backend.summaries().await.unwrap()[0].metadata, before);

    // Expiry
    backend
        .set("pp_v1_b", "beta".to_string(), Duration::from_millis(40))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(120)).await;
    assert!(!backend.exists("pp_v1_b").await.unwrap());
    assert!(backend.get("pp_v1_b").await.unwrap().is_none());

    // Globbed deletion
    backend
        .set("pp_v2_a", "x".to_string(), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(assert_ok!(backend.delete_matching("pp_v1_*").await), 1);
    assert!(backend.exists("pp_v2_a").await.unwrap());
    assert!(backend.delete("pp_v2_a").await.unwrap());
    assert!(!backend.delete("pp_v2_a").await.unwrap());
    assert_eq!(backend.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_memory_backend_contract() {
    check_contract(&MemoryBackend::new()).await;
}

#[cfg(feature = "sqlite-backend")]
mod sqlite {
    use super::*;
    use postproc_cache::cache::{BackendConfig, SqliteBackend};

    #[tokio::test]
    async fn test_sqlite_backend_contract() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        check_contract(&backend).await;
    }

    #[tokio::test]
    async fn test_entries_survive_manager_restart() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite:{}?mode=rwc", dir.path().join("cache.db").display());
        let config = CacheConfig {
            backend: BackendConfig::Sqlite { url },
            ..CacheConfig::ephemeral()
        };
        let rels = vec![RelationshipInput::new("A", "B", "USES", 0.5, "")];

        let first = CacheManager::connect(config.clone()).await.unwrap();
        let _: String = first
            .get_or_process(
                "c1",
                &rels,
                |_, _| async { Ok::<_, anyhow::Error>("persisted".to_string()) },
                ProcessOptions::default(),
            )
            .await
            .unwrap();
        drop(first);

        let second = CacheManager::connect(config).await.unwrap();
        let out: String = second
            .get_or_process(
                "c1",
                &rels,
                |_, _| async { Ok::<_, anyhow::Error>("recomputed".to_string()) },
                ProcessOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(out, "persisted");
        assert_eq!(second.stats().await.hits, 1);
    }
}

#[cfg(feature = "redis-backend")]
mod redis {
    use super::*;
    use postproc_cache::cache::RedisBackend;
    use testcontainers::clients::Cli;
    use testcontainers_modules::redis::Redis;

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_redis_backend_contract() {
        let docker = Cli::default();
        let node = docker.run(Redis::default());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));

        let backend = RedisBackend::connect(&url, "pptest").await.unwrap();
        check_contract(&backend).await;
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_redis_lease_is_exclusive() {
        let docker = Cli::default();
        let node = docker.run(Redis::default());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));

        let a = RedisBackend::connect(&url, "pplease").await.unwrap();
        let b = RedisBackend::connect(&url, "pplease").await.unwrap();

        let held = a.reserve("k", Duration::from_secs(5)).await.unwrap().unwrap();
        assert!(b.reserve("k", Duration::from_secs(5)).await.unwrap().is_none());

        a.release(&held).await.unwrap();
        let taken = b.reserve("k", Duration::from_secs(5)).await.unwrap();
        assert!(taken.is_some());

        // A stale token cannot release someone else's lease.
        a.release(&held).await.unwrap();
        assert!(a.reserve("k", Duration::from_secs(5)).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Docker
    async fn test_shared_cache_across_workers() {
        let docker = Cli::default();
        let node = docker.run(Redis::default());
        let url = format!("redis://127.0.0.1:{}", node.get_host_port_ipv4(6379));

        let config = CacheConfig {
            lock_poll_interval: Duration::from_millis(10),
            ..CacheConfig::shared(url)
        };
        let worker_a = CacheManager::connect(config.clone()).await.unwrap();
        let worker_b = CacheManager::connect(config).await.unwrap();
        let rels: Arc<Vec<RelationshipInput>> =
            Arc::new(vec![RelationshipInput::new("A", "B", "USES", 0.5, "")]);

        let slow = {
            let rels = rels.clone();
            tokio::spawn(async move {
                worker_a
                    .get_or_process(
                        "c1",
                        &rels,
                        |_, _| async {
                            tokio::time::sleep(Duration::from_millis(200)).await;
                            Ok::<_, anyhow::Error>("from a".to_string())
                        },
                        ProcessOptions::default(),
                    )
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let out: String = worker_b
            .get_or_process(
                "c1",
                &rels,
                |_, _| async { Ok::<_, anyhow::Error>("from b".to_string()) },
                ProcessOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(slow.await.unwrap().unwrap(), "from a");
        assert_eq!(out, "from a");
    }
}
