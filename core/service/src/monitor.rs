use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::Mutex;

use brain_memory_cache::{BrainMemoryCacheStore, ResultCache};

/// Aggregate service health. The durable store carries the memory graph, so
/// the service is only "down" when both it and the result cache are
/// unreachable; losing just the cache degrades to direct fetches.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: &'static str,
    pub store_ok: bool,
    pub cache_ok: bool,
}

impl HealthReport {
    /// Wire shape for the health endpoint: dependency states nested under
    /// `dependencies`, keyed by tier.
    pub fn body(&self) -> serde_json::Value {
        json!({
            "service": "brain-memory",
            "version": env!("CARGO_PKG_VERSION"),
            "status": self.status,
            "dependencies": {
                "graph": self.store_ok,
                "cache": self.cache_ok,
            },
        })
    }
}

pub struct HealthMonitor {
    store: Arc<Mutex<BrainMemoryCacheStore>>,
    result_cache: ResultCache,
}

impl HealthMonitor {
    pub fn new(store: Arc<Mutex<BrainMemoryCacheStore>>, result_cache: ResultCache) -> Self {
        Self {
            store,
            result_cache,
        }
    }

    pub async fn health(&self) -> HealthReport {
        let store_ok = self.store.lock().await.healthy();
        let cache_ok = self.result_cache.ping().await;

        let status = match (store_ok, cache_ok) {
            (true, true) => "healthy",
            (false, false) => "down",
            _ => "degraded",
        };

        HealthReport {
            status,
            store_ok,
            cache_ok,
        }
    }
}
