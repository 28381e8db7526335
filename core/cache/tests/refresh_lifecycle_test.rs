use async_trait::async_trait;
use brain_memory_cache::{BrainMemoryCacheStore, DeltaSyncCoordinator, UpstreamError, UpstreamFetcher};
use brain_memory_schemas::{DataType, FetchOutcome, UserId};
use chrono::Utc;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::sync::Mutex;

struct CountingUpstream {
    calls: AtomicUsize,
}

#[async_trait]
impl UpstreamFetcher for CountingUpstream {
    async fn fetch(
        &self,
        _user_id: &UserId,
        _data_type: &DataType,
    ) -> Result<serde_json::Value, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(json!([{ "id": "c1", "name": "Ada", "phone": null, "email": null }]))
    }
}

/// Refresh lifecycle against an on-disk store: miss-then-fetch populates the
/// row, subsequent refreshes hit the cache, a user reset forces the next
/// refresh back upstream, and stats survive a process restart.
#[tokio::test]
async fn test_refresh_reset_and_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("cache.db");
    let user = UserId("user_a".into());

    let upstream = Arc::new(CountingUpstream {
        calls: AtomicUsize::new(0),
    });

    {
        let store = Arc::new(Mutex::new(BrainMemoryCacheStore::new(&db_path).unwrap()));
        let coordinator = DeltaSyncCoordinator::new(Arc::clone(&store), Arc::clone(&upstream) as _);

        let first = coordinator.refresh(&user, &DataType::Contacts).await.unwrap();
        assert_eq!(first.outcome, FetchOutcome::FreshFetch);

        let second = coordinator.refresh(&user, &DataType::Contacts).await.unwrap();
        assert_eq!(second.outcome, FetchOutcome::CacheHit);
        assert_eq!(second.data, first.data);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

        // Logout/reset removes the user's rows, so the next refresh goes
        // upstream again.
        let removed = store.lock().await.delete_user(&user).unwrap();
        assert_eq!(removed, 1);

        let third = coordinator.refresh(&user, &DataType::Contacts).await.unwrap();
        assert_eq!(third.outcome, FetchOutcome::FreshFetch);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }

    // Reopen the same database file: the row written before "shutdown" is
    // still there and answers without an upstream call.
    {
        let store = Arc::new(Mutex::new(BrainMemoryCacheStore::new(&db_path).unwrap()));
        let coordinator = DeltaSyncCoordinator::new(Arc::clone(&store), Arc::clone(&upstream) as _);

        let after_restart = coordinator.refresh(&user, &DataType::Contacts).await.unwrap();
        assert_eq!(after_restart.outcome, FetchOutcome::CacheHit);
        assert_eq!(upstream.calls.load(Ordering::SeqCst), 2);
    }
}

/// Stats counters only ever grow, across hits, misses and resets.
#[tokio::test]
async fn test_stats_are_monotonic() {
    let store = Arc::new(Mutex::new(BrainMemoryCacheStore::in_memory().unwrap()));
    let upstream = Arc::new(CountingUpstream {
        calls: AtomicUsize::new(0),
    });
    let coordinator = DeltaSyncCoordinator::new(Arc::clone(&store), upstream as _);
    let user = UserId("user_a".into());

    let mut last_hits = 0;
    let mut last_misses = 0;
    for _ in 0..4 {
        coordinator.refresh(&user, &DataType::Tasks).await.unwrap();
        let stats = store.lock().await.stats(&user).unwrap();
        assert!(stats.cache_hits >= last_hits);
        assert!(stats.cache_misses >= last_misses);
        last_hits = stats.cache_hits;
        last_misses = stats.cache_misses;
    }

    let stats = store.lock().await.stats(&user).unwrap();
    // One fresh fetch, then three hits.
    assert_eq!(stats.cache_misses, 1);
    assert_eq!(stats.cache_hits, 3);
    assert!(stats.avg_response_time_ms >= 0.0);
}
