use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, warn};

use crate::error::{CacheError, SyncError};
use crate::store::BrainMemoryCacheStore;
use brain_memory_schemas::{
    DataType, FetchOutcome, RefreshResponse, UserId, UPSTREAM_TIMEOUT_SECS,
};

/// Why an upstream fetch did not produce data.
#[derive(Debug, Clone)]
pub enum UpstreamError {
    /// HTTP 429 or an equivalent throttle signal.
    RateLimited,
    Failed(String),
}

/// Seam to the rate-limited external services (tasks, contacts, calendar,
/// mail). Production uses HTTP; tests substitute a counting mock.
#[async_trait]
pub trait UpstreamFetcher: Send + Sync {
    async fn fetch(
        &self,
        user_id: &UserId,
        data_type: &DataType,
    ) -> Result<serde_json::Value, UpstreamError>;
}

/// HTTP implementation against the sync gateway.
pub struct HttpUpstreamFetcher {
    client: reqwest::Client,
    base_url: String,
}

impl HttpUpstreamFetcher {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl UpstreamFetcher for HttpUpstreamFetcher {
    async fn fetch(
        &self,
        user_id: &UserId,
        data_type: &DataType,
    ) -> Result<serde_json::Value, UpstreamError> {
        let url = format!("{}/sync/{}", self.base_url, data_type);

        let response = self
            .client
            .get(&url)
            .query(&[("user_id", user_id.0.as_str())])
            .timeout(Duration::from_secs(UPSTREAM_TIMEOUT_SECS))
            .send()
            .await
            .map_err(|e| UpstreamError::Failed(e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(UpstreamError::RateLimited);
        }
        if !response.status().is_success() {
            return Err(UpstreamError::Failed(format!("HTTP {}", response.status())));
        }

        response
            .json()
            .await
            .map_err(|e| UpstreamError::Failed(e.to_string()))
    }
}

type FlightKey = (UserId, DataType);
type FlightResult = Result<RefreshResponse, SyncError>;
type FlightTable = Mutex<HashMap<FlightKey, broadcast::Sender<FlightResult>>>;

/// Single-flight, stale-tolerant front end to the durable cache store.
///
/// Concurrent `refresh` calls for the same (user, data_type) coalesce into
/// one upstream fetch and observe an identical outcome. The fetch runs on a
/// spawned task, so a caller that times out and drops its wait cancels only
/// itself, never the shared flight.
pub struct DeltaSyncCoordinator {
    store: Arc<Mutex<BrainMemoryCacheStore>>,
    fetcher: Arc<dyn UpstreamFetcher>,
    inflight: Arc<FlightTable>,
}

impl DeltaSyncCoordinator {
    pub fn new(store: Arc<Mutex<BrainMemoryCacheStore>>, fetcher: Arc<dyn UpstreamFetcher>) -> Self {
        Self {
            store,
            fetcher,
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Refresh one data type for one user, preferring the cache, coalescing
    /// duplicate fetches, and falling back to stale data on a rate limit.
    pub async fn refresh(
        &self,
        user_id: &UserId,
        data_type: &DataType,
    ) -> Result<RefreshResponse, SyncError> {
        let started = Instant::now();
        let period = data_type.as_str().to_string();

        // Fresh cache row: answer immediately, no flight needed.
        {
            let store = self.store.lock().await;
            if let Some(entry) = store.get(user_id, data_type, &period, false, Utc::now())? {
                let elapsed = started.elapsed().as_secs_f64() * 1000.0;
                Self::record(&store, user_id, FetchOutcome::CacheHit, elapsed);
                if let Err(e) = store.record_api_call_saved(user_id) {
                    warn!("Failed to record saved call for {}: {}", user_id, e);
                }
                debug!("Cache hit for {}/{}", user_id, data_type);
                return Ok(RefreshResponse {
                    data: entry.cache_data,
                    outcome: FetchOutcome::CacheHit,
                    stale: false,
                });
            }
        }

        let key = (user_id.clone(), data_type.clone());
        let (mut rx, joined) = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get(&key) {
                Some(tx) => (tx.subscribe(), true),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    inflight.insert(key.clone(), tx.clone());

                    let store = Arc::clone(&self.store);
                    let fetcher = Arc::clone(&self.fetcher);
                    let table = Arc::clone(&self.inflight);
                    let flight_key = key.clone();
                    tokio::spawn(async move {
                        let result =
                            run_flight(store, fetcher, &flight_key.0, &flight_key.1).await;
                        table.lock().await.remove(&flight_key);
                        // Nobody left waiting is fine; the write-through
                        // already happened inside the flight.
                        let _ = tx.send(result);
                    });

                    (rx, false)
                }
            }
        };

        if joined {
            // This caller's upstream call was coalesced away.
            let store = self.store.lock().await;
            if let Err(e) = store.record_api_call_saved(user_id) {
                warn!("Failed to record saved call for {}: {}", user_id, e);
            }
        }

        rx.recv()
            .await
            .map_err(|e| SyncError::Coordination(e.to_string()))?
    }

    fn record(store: &BrainMemoryCacheStore, user_id: &UserId, outcome: FetchOutcome, ms: f64) {
        if let Err(e) = store.record_outcome(user_id, outcome, ms) {
            warn!("Failed to record {} for {}: {}", outcome.as_str(), user_id, e);
        }
    }
}

/// One shared upstream flight: fetch, write through on success, fall back to
/// the last known row (possibly expired) on a rate limit, and report the
/// outcome to the stats counters exactly once.
async fn run_flight(
    store: Arc<Mutex<BrainMemoryCacheStore>>,
    fetcher: Arc<dyn UpstreamFetcher>,
    user_id: &UserId,
    data_type: &DataType,
) -> FlightResult {
    let started = Instant::now();
    let period = data_type.as_str().to_string();

    let fetched = tokio::time::timeout(
        Duration::from_secs(UPSTREAM_TIMEOUT_SECS),
        fetcher.fetch(user_id, data_type),
    )
    .await
    .unwrap_or(Err(UpstreamError::Failed("upstream fetch timed out".into())));

    let elapsed = started.elapsed().as_secs_f64() * 1000.0;

    match fetched {
        Ok(data) => {
            let store = store.lock().await;
            // Write-through with the fixed 21-day TTL. A failed write still
            // serves the fetched data; the next refresh retries the write.
            if let Err(e) = store.set(user_id, data_type, &period, &data, Utc::now()) {
                warn!("Write-through failed for {}/{}: {}", user_id, data_type, e);
            }
            DeltaSyncCoordinator::record(&store, user_id, FetchOutcome::FreshFetch, elapsed);
            info!("Fresh fetch for {}/{}", user_id, data_type);
            Ok(RefreshResponse {
                data,
                outcome: FetchOutcome::FreshFetch,
                stale: false,
            })
        }
        Err(upstream_err) => {
            let rate_limited = matches!(upstream_err, UpstreamError::RateLimited);
            let store = store.lock().await;
            let stale_row = store
                .get(user_id, data_type, &period, true, Utc::now())
                .unwrap_or_else(|e: CacheError| {
                    warn!("Stale lookup failed for {}/{}: {}", user_id, data_type, e);
                    None
                });

            match stale_row {
                Some(entry) => {
                    warn!(
                        "Serving stale {}/{} after upstream failure",
                        user_id, data_type
                    );
                    DeltaSyncCoordinator::record(
                        &store,
                        user_id,
                        FetchOutcome::StaleFallback,
                        elapsed,
                    );
                    Ok(RefreshResponse {
                        data: entry.cache_data,
                        outcome: FetchOutcome::StaleFallback,
                        stale: true,
                    })
                }
                None if rate_limited => {
                    // Rate limited with nothing cached: a recoverable empty
                    // result, never an error to the caller.
                    warn!("Rate limited with no cache for {}/{}", user_id, data_type);
                    DeltaSyncCoordinator::record(&store, user_id, FetchOutcome::CacheMiss, elapsed);
                    Ok(RefreshResponse {
                        data: serde_json::Value::Array(Vec::new()),
                        outcome: FetchOutcome::CacheMiss,
                        stale: false,
                    })
                }
                None => {
                    let reason = match upstream_err {
                        UpstreamError::Failed(reason) => reason,
                        UpstreamError::RateLimited => unreachable!(),
                    };
                    DeltaSyncCoordinator::record(&store, user_id, FetchOutcome::CacheMiss, elapsed);
                    Err(SyncError::Upstream {
                        data_type: data_type.as_str().to_string(),
                        reason,
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    struct MockUpstream {
        calls: AtomicUsize,
        response: Mutex<Result<serde_json::Value, UpstreamError>>,
        gate: Option<Arc<Notify>>,
    }

    impl MockUpstream {
        fn ok(value: serde_json::Value) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Ok(value)),
                gate: None,
            }
        }

        fn rate_limited() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Err(UpstreamError::RateLimited)),
                gate: None,
            }
        }

        fn gated(value: serde_json::Value, gate: Arc<Notify>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                response: Mutex::new(Ok(value)),
                gate: Some(gate),
            }
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamFetcher for MockUpstream {
        async fn fetch(
            &self,
            _user_id: &UserId,
            _data_type: &DataType,
        ) -> Result<serde_json::Value, UpstreamError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            self.response.lock().await.clone()
        }
    }

    fn coordinator(
        fetcher: Arc<MockUpstream>,
    ) -> (DeltaSyncCoordinator, Arc<Mutex<BrainMemoryCacheStore>>) {
        let store = Arc::new(Mutex::new(BrainMemoryCacheStore::in_memory().unwrap()));
        (
            DeltaSyncCoordinator::new(Arc::clone(&store), fetcher),
            store,
        )
    }

    fn user() -> UserId {
        UserId("user_a".into())
    }

    #[tokio::test]
    async fn test_miss_then_fetch_writes_through() {
        let upstream = Arc::new(MockUpstream::ok(json!([{ "id": "t1" }])));
        let (coordinator, store) = coordinator(Arc::clone(&upstream));

        let response = coordinator.refresh(&user(), &DataType::Tasks).await.unwrap();
        assert_eq!(response.outcome, FetchOutcome::FreshFetch);
        assert!(!response.stale);
        assert_eq!(upstream.call_count(), 1);

        // Row landed in the durable store with the 21-day TTL.
        let store = store.lock().await;
        let entry = store
            .get(&user(), &DataType::Tasks, "tasks", false, Utc::now())
            .unwrap()
            .unwrap();
        assert_eq!(
            (entry.expires_at - entry.created_at).num_days(),
            brain_memory_schemas::CACHE_TTL_DAYS
        );
    }

    #[tokio::test]
    async fn test_second_refresh_is_a_cache_hit() {
        let upstream = Arc::new(MockUpstream::ok(json!([1, 2, 3])));
        let (coordinator, store) = coordinator(Arc::clone(&upstream));

        coordinator.refresh(&user(), &DataType::Contacts).await.unwrap();
        let second = coordinator.refresh(&user(), &DataType::Contacts).await.unwrap();

        assert_eq!(second.outcome, FetchOutcome::CacheHit);
        assert_eq!(second.data, json!([1, 2, 3]));
        assert_eq!(upstream.call_count(), 1);

        let stats = store.lock().await.stats(&user()).unwrap();
        assert_eq!(stats.cache_hits, 1);
        assert_eq!(stats.cache_misses, 1);
        assert_eq!(stats.api_calls_saved, 1);
    }

    #[tokio::test]
    async fn test_single_flight_coalesces_concurrent_refreshes() {
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(MockUpstream::gated(json!({ "items": 4 }), Arc::clone(&gate)));
        let (coordinator, _store) = coordinator(Arc::clone(&upstream));
        let coordinator = Arc::new(coordinator);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let coordinator = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                coordinator.refresh(&user(), &DataType::Tasks).await
            }));
        }

        // Let every caller reach the flight table before releasing upstream.
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.notify_waiters();

        let mut outcomes = Vec::new();
        for handle in handles {
            let response = handle.await.unwrap().unwrap();
            outcomes.push((response.outcome, response.data));
        }

        assert_eq!(upstream.call_count(), 1);
        for (outcome, data) in &outcomes {
            assert_eq!(*outcome, FetchOutcome::FreshFetch);
            assert_eq!(*data, json!({ "items": 4 }));
        }
    }

    #[tokio::test]
    async fn test_rate_limit_serves_stale_row() {
        let upstream = Arc::new(MockUpstream::rate_limited());
        let (coordinator, store) = coordinator(Arc::clone(&upstream));

        // Seed an already-expired row.
        {
            let store = store.lock().await;
            let created = Utc::now() - chrono::Duration::days(30);
            store
                .set(&user(), &DataType::Tasks, "tasks", &json!([{ "id": "old" }]), created)
                .unwrap();
        }

        let response = coordinator.refresh(&user(), &DataType::Tasks).await.unwrap();
        assert_eq!(response.outcome, FetchOutcome::StaleFallback);
        assert!(response.stale);
        assert_eq!(response.data, json!([{ "id": "old" }]));
    }

    #[tokio::test]
    async fn test_rate_limit_without_cache_returns_empty() {
        let upstream = Arc::new(MockUpstream::rate_limited());
        let (coordinator, _store) = coordinator(upstream);

        let response = coordinator.refresh(&user(), &DataType::Emails).await.unwrap();
        assert_eq!(response.outcome, FetchOutcome::CacheMiss);
        assert!(!response.stale);
        assert_eq!(response.data, json!([]));
    }

    #[tokio::test]
    async fn test_upstream_failure_without_cache_is_an_error() {
        let upstream = Arc::new(MockUpstream {
            calls: AtomicUsize::new(0),
            response: Mutex::new(Err(UpstreamError::Failed("boom".into()))),
            gate: None,
        });
        let (coordinator, _store) = coordinator(upstream);

        let result = coordinator.refresh(&user(), &DataType::Tasks).await;
        assert!(matches!(result, Err(SyncError::Upstream { .. })));
    }

    #[tokio::test]
    async fn test_caller_timeout_does_not_cancel_the_flight() {
        let gate = Arc::new(Notify::new());
        let upstream = Arc::new(MockUpstream::gated(json!([7]), Arc::clone(&gate)));
        let (coordinator, store) = coordinator(Arc::clone(&upstream));
        let coordinator = Arc::new(coordinator);

        let waiter = {
            let coordinator = Arc::clone(&coordinator);
            tokio::spawn(async move {
                tokio::time::timeout(
                    Duration::from_millis(20),
                    coordinator.refresh(&user(), &DataType::Tasks),
                )
                .await
            })
        };

        // The impatient caller gives up...
        assert!(waiter.await.unwrap().is_err());

        // ...but the shared flight completes and writes through.
        gate.notify_waiters();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let store = store.lock().await;
        let entry = store
            .get(&user(), &DataType::Tasks, "tasks", false, Utc::now())
            .unwrap();
        assert!(entry.is_some());
        assert_eq!(upstream.call_count(), 1);
    }

    #[tokio::test]
    async fn test_flights_are_keyed_per_user_and_data_type() {
        let upstream = Arc::new(MockUpstream::ok(json!([])));
        let (coordinator, _store) = coordinator(Arc::clone(&upstream));

        coordinator.refresh(&user(), &DataType::Tasks).await.unwrap();
        coordinator.refresh(&user(), &DataType::Contacts).await.unwrap();
        coordinator
            .refresh(&UserId("user_b".into()), &DataType::Tasks)
            .await
            .unwrap();

        // Distinct keys never coalesce.
        assert_eq!(upstream.call_count(), 3);
    }
}
