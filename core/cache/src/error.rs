use thiserror::Error;

/// Errors raised by the cache tiers. Cloneable so a single flight result can
/// be broadcast to every coalesced waiter.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The backing service (Redis or the durable store) cannot be reached.
    /// Callers degrade to a miss rather than surfacing this to adapters.
    #[error("cache backend unavailable: {0}")]
    DependencyUnavailable(String),

    /// A stored row failed schema validation. Treated as a miss on read.
    #[error("malformed cache row at {key}: {reason}")]
    Validation { key: String, reason: String },

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for CacheError {
    fn from(e: rusqlite::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(e: serde_json::Error) -> Self {
        CacheError::Storage(e.to_string())
    }
}

/// Errors surfaced by the delta-sync coordinator.
#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// Upstream failed and no cached row (stale or otherwise) was available.
    #[error("upstream fetch failed for {data_type}: {reason}")]
    Upstream { data_type: String, reason: String },

    /// The in-process flight machinery broke down (sender dropped).
    #[error("refresh coordination failed: {0}")]
    Coordination(String),

    #[error(transparent)]
    Cache(#[from] CacheError),
}
