use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::result_cache::ResultCache;
use brain_memory_schemas::ENTITY_CACHE_TTL_SECS;

/// Short-lived, schema-validated cache for entity-resolution lookups
/// ("Dana" -> contact record, "dentist" -> calendar event). Entries live in a
/// dedicated namespace so a reset never touches synced data, and the 15-minute
/// TTL keeps resolutions from outliving the conversation that produced them.
#[derive(Clone)]
pub struct TypedEntityCache {
    cache: ResultCache,
}

impl TypedEntityCache {
    pub fn new(cache: ResultCache) -> Self {
        Self { cache }
    }

    fn key(kind: &str, lookup: &str) -> String {
        format!("entity:{}:{}", kind, lookup.trim().to_lowercase())
    }

    /// Typed lookup. A value that no longer matches the expected schema reads
    /// as a miss (the ResultCache logs and discards it).
    pub async fn lookup<T: DeserializeOwned>(&self, kind: &str, lookup: &str) -> Option<T> {
        self.cache.get(&Self::key(kind, lookup)).await
    }

    pub async fn store<T: Serialize>(&self, kind: &str, lookup: &str, value: &T) {
        let key = Self::key(kind, lookup);
        debug!("Caching entity resolution {}", key);
        self.cache.set(&key, value, ENTITY_CACHE_TTL_SECS).await;
    }

    pub async fn invalidate(&self, kind: &str, lookup: &str) {
        self.cache.delete(&Self::key(kind, lookup)).await;
    }
}
