pub mod entity_cache;
pub mod error;
pub mod result_cache;
pub mod store;
pub mod sync;

pub use entity_cache::TypedEntityCache;
pub use error::{CacheError, SyncError};
pub use result_cache::{KvBackend, MemoryBackend, RedisBackend, ResultCache};
pub use store::BrainMemoryCacheStore;
pub use sync::{DeltaSyncCoordinator, HttpUpstreamFetcher, UpstreamError, UpstreamFetcher};
