use async_trait::async_trait;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::CacheError;

/// Minimal key/value surface the ResultCache needs from its backend.
#[async_trait]
pub trait KvBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError>;
    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError>;
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
    async fn ping(&self) -> bool;
}

/// Redis-backed implementation. The connection manager reconnects on its own,
/// so a Redis outage shows up as per-operation errors rather than a wedged
/// client.
pub struct RedisBackend {
    manager: redis::aio::ConnectionManager,
}

impl RedisBackend {
    pub async fn connect(url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url)
            .map_err(|e| CacheError::DependencyUnavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| CacheError::DependencyUnavailable(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut conn = self.manager.clone();
        let value: Option<String> = conn
            .get(key)
            .await
            .map_err(|e| CacheError::DependencyUnavailable(e.to_string()))?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .set_ex(key, value, ttl_secs)
            .await
            .map_err(|e| CacheError::DependencyUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        let mut conn = self.manager.clone();
        let _: () = conn
            .del(key)
            .await
            .map_err(|e| CacheError::DependencyUnavailable(e.to_string()))?;
        Ok(())
    }

    async fn ping(&self) -> bool {
        let mut conn = self.manager.clone();
        redis::cmd("PING")
            .query_async::<String>(&mut conn)
            .await
            .is_ok()
    }
}

/// In-process backend used in tests and when no REDIS_URL is configured.
#[derive(Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((value, deadline)) if Instant::now() < *deadline => Ok(Some(value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> Result<(), CacheError> {
        let deadline = Instant::now() + Duration::from_secs(ttl_secs);
        self.entries
            .lock()
            .await
            .insert(key.to_string(), (value.to_string(), deadline));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().await.remove(key);
        Ok(())
    }

    async fn ping(&self) -> bool {
        true
    }
}

/// Typed get/set over a key/value backend. Tolerant by construction: an
/// unreachable backend reads as a miss and writes as a dropped write, with a
/// warning, so the conversation path keeps serving.
#[derive(Clone)]
pub struct ResultCache {
    backend: Arc<dyn KvBackend>,
}

impl ResultCache {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.backend.get(key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!("Result cache read degraded for {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                // Schema mismatch is a miss, never a crash on the read path.
                warn!("Discarding malformed cached value at {}: {}", key, e);
                None
            }
        }
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T, ttl_secs: u64) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!("Failed to serialize cache value for {}: {}", key, e);
                return;
            }
        };

        if let Err(e) = self.backend.set_ex(key, &raw, ttl_secs).await {
            warn!("Result cache write dropped for {}: {}", key, e);
        } else {
            debug!("Cached {} (ttl {}s)", key, ttl_secs);
        }
    }

    pub async fn delete(&self, key: &str) {
        if let Err(e) = self.backend.delete(key).await {
            warn!("Result cache delete dropped for {}: {}", key, e);
        }
    }

    pub async fn ping(&self) -> bool {
        self.backend.ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Payload {
        name: String,
        count: u32,
    }

    #[tokio::test]
    async fn test_typed_round_trip() {
        let cache = ResultCache::new(Arc::new(MemoryBackend::new()));
        let payload = Payload {
            name: "tasks".into(),
            count: 3,
        };

        cache.set("user_1:tasks", &payload, 60).await;
        let restored: Option<Payload> = cache.get("user_1:tasks").await;
        assert_eq!(restored, Some(payload));
    }

    #[tokio::test]
    async fn test_miss_on_absent_key() {
        let cache = ResultCache::new(Arc::new(MemoryBackend::new()));
        let value: Option<Payload> = cache.get("nothing-here").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_malformed_value_reads_as_miss() {
        let backend = Arc::new(MemoryBackend::new());
        backend.set_ex("bad", "{not json", 60).await.unwrap();

        let cache = ResultCache::new(backend);
        let value: Option<Payload> = cache.get("bad").await;
        assert!(value.is_none());
    }

    #[tokio::test]
    async fn test_unreachable_backend_degrades_to_miss() {
        struct DownBackend;

        #[async_trait]
        impl KvBackend for DownBackend {
            async fn get(&self, _key: &str) -> Result<Option<String>, CacheError> {
                Err(CacheError::DependencyUnavailable("connection refused".into()))
            }
            async fn set_ex(&self, _: &str, _: &str, _: u64) -> Result<(), CacheError> {
                Err(CacheError::DependencyUnavailable("connection refused".into()))
            }
            async fn delete(&self, _: &str) -> Result<(), CacheError> {
                Err(CacheError::DependencyUnavailable("connection refused".into()))
            }
            async fn ping(&self) -> bool {
                false
            }
        }

        let cache = ResultCache::new(Arc::new(DownBackend));
        let value: Option<Payload> = cache.get("anything").await;
        assert!(value.is_none());

        // Writes are dropped silently; no panic, no error to the caller.
        cache.set("anything", &Payload { name: "x".into(), count: 1 }, 60).await;
        assert!(!cache.ping().await);
    }

    #[tokio::test]
    async fn test_memory_backend_expires() {
        let backend = MemoryBackend::new();
        backend.set_ex("ephemeral", "\"v\"", 0).await.unwrap();
        // Zero TTL expires immediately.
        assert_eq!(backend.get("ephemeral").await.unwrap(), None);
    }
}
