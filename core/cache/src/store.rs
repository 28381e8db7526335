use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use tracing::{info, warn};

use crate::error::CacheError;
use brain_memory_schemas::{CacheEntry, CacheStats, DataType, FetchOutcome, UserId, CACHE_TTL_DAYS};

/// Durable TTL cache for externally-synced records, one logical row per
/// (user_id, data_type, memory_period). Expired rows stay physically present
/// and report a miss unless the caller opts into stale reads, which is the
/// rate-limit fallback path.
pub struct BrainMemoryCacheStore {
    conn: Connection,
}

impl BrainMemoryCacheStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, CacheError> {
        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        info!("Brain memory cache store initialized");
        Ok(store)
    }

    /// In-memory store for tests and ephemeral deployments.
    pub fn in_memory() -> Result<Self, CacheError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), CacheError> {
        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_entries (
                user_id TEXT NOT NULL,
                data_type TEXT NOT NULL,
                memory_period TEXT NOT NULL,
                cache_data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (user_id, data_type, memory_period)
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE TABLE IF NOT EXISTS cache_stats (
                user_id TEXT PRIMARY KEY,
                cache_hits INTEGER NOT NULL DEFAULT 0,
                cache_misses INTEGER NOT NULL DEFAULT 0,
                total_response_time_ms REAL NOT NULL DEFAULT 0,
                response_samples INTEGER NOT NULL DEFAULT 0,
                api_calls_saved INTEGER NOT NULL DEFAULT 0
            )",
            [],
        )?;

        self.conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_cache_entries_expiry
             ON cache_entries(expires_at)",
            [],
        )?;

        Ok(())
    }

    /// Fetch a row. Returns None for absent rows, expired rows (unless
    /// `allow_stale`), and rows that fail validation; the read path never
    /// propagates a malformed row.
    pub fn get(
        &self,
        user_id: &UserId,
        data_type: &DataType,
        memory_period: &str,
        allow_stale: bool,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>, CacheError> {
        let row: Option<(String, String, String)> = self
            .conn
            .query_row(
                "SELECT cache_data, created_at, expires_at
                 FROM cache_entries
                 WHERE user_id = ?1 AND data_type = ?2 AND memory_period = ?3",
                params![user_id.0, data_type.as_str(), memory_period],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let (raw_data, raw_created, raw_expires) = match row {
            Some(row) => row,
            None => return Ok(None),
        };

        let key = format!("{}/{}/{}", user_id, data_type, memory_period);
        let entry = match Self::parse_row(
            user_id, data_type, memory_period, &raw_data, &raw_created, &raw_expires,
        ) {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Treating cache row {} as a miss: {}", key, e);
                return Ok(None);
            }
        };

        if entry.is_expired(now) && !allow_stale {
            return Ok(None);
        }

        Ok(Some(entry))
    }

    fn parse_row(
        user_id: &UserId,
        data_type: &DataType,
        memory_period: &str,
        raw_data: &str,
        raw_created: &str,
        raw_expires: &str,
    ) -> Result<CacheEntry, CacheError> {
        let validation = |reason: String| CacheError::Validation {
            key: format!("{}/{}/{}", user_id, data_type, memory_period),
            reason,
        };

        let cache_data =
            serde_json::from_str(raw_data).map_err(|e| validation(e.to_string()))?;
        let created_at = DateTime::parse_from_rfc3339(raw_created)
            .map_err(|e| validation(e.to_string()))?
            .with_timezone(&Utc);
        let expires_at = DateTime::parse_from_rfc3339(raw_expires)
            .map_err(|e| validation(e.to_string()))?
            .with_timezone(&Utc);

        Ok(CacheEntry {
            user_id: user_id.clone(),
            data_type: data_type.clone(),
            memory_period: memory_period.to_string(),
            cache_data,
            created_at,
            expires_at,
        })
    }

    /// Insert or overwrite the row for this key with the fixed 21-day TTL.
    pub fn set(
        &self,
        user_id: &UserId,
        data_type: &DataType,
        memory_period: &str,
        cache_data: &serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<CacheEntry, CacheError> {
        self.set_with_ttl(
            user_id,
            data_type,
            memory_period,
            cache_data,
            now,
            Duration::days(CACHE_TTL_DAYS),
        )
    }

    pub fn set_with_ttl(
        &self,
        user_id: &UserId,
        data_type: &DataType,
        memory_period: &str,
        cache_data: &serde_json::Value,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<CacheEntry, CacheError> {
        let expires_at = now + ttl;
        self.conn.execute(
            "INSERT OR REPLACE INTO cache_entries
             (user_id, data_type, memory_period, cache_data, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                user_id.0,
                data_type.as_str(),
                memory_period,
                serde_json::to_string(cache_data)?,
                now.to_rfc3339(),
                expires_at.to_rfc3339(),
            ],
        )?;

        Ok(CacheEntry {
            user_id: user_id.clone(),
            data_type: data_type.clone(),
            memory_period: memory_period.to_string(),
            cache_data: cache_data.clone(),
            created_at: now,
            expires_at,
        })
    }

    /// Remove every row and the stats counters for one user (logout/reset).
    pub fn delete_user(&self, user_id: &UserId) -> Result<usize, CacheError> {
        let removed = self.conn.execute(
            "DELETE FROM cache_entries WHERE user_id = ?1",
            params![user_id.0],
        )?;
        self.conn.execute(
            "DELETE FROM cache_stats WHERE user_id = ?1",
            params![user_id.0],
        )?;
        info!("Cleared {} cache rows for {}", removed, user_id);
        Ok(removed)
    }

    /// Fold one refresh outcome into the user's counters. Counters only grow.
    pub fn record_outcome(
        &self,
        user_id: &UserId,
        outcome: FetchOutcome,
        response_time_ms: f64,
    ) -> Result<(), CacheError> {
        let (hit, miss) = match outcome {
            FetchOutcome::CacheHit | FetchOutcome::StaleFallback => (1, 0),
            FetchOutcome::CacheMiss | FetchOutcome::FreshFetch => (0, 1),
        };

        self.conn.execute(
            "INSERT INTO cache_stats
             (user_id, cache_hits, cache_misses, total_response_time_ms, response_samples, api_calls_saved)
             VALUES (?1, ?2, ?3, ?4, 1, 0)
             ON CONFLICT(user_id) DO UPDATE SET
                cache_hits = cache_hits + ?2,
                cache_misses = cache_misses + ?3,
                total_response_time_ms = total_response_time_ms + ?4,
                response_samples = response_samples + 1",
            params![user_id.0, hit, miss, response_time_ms],
        )?;
        Ok(())
    }

    /// A coalesced waiter or a served cache hit spared one upstream call.
    pub fn record_api_call_saved(&self, user_id: &UserId) -> Result<(), CacheError> {
        self.conn.execute(
            "INSERT INTO cache_stats (user_id, api_calls_saved) VALUES (?1, 1)
             ON CONFLICT(user_id) DO UPDATE SET api_calls_saved = api_calls_saved + 1",
            params![user_id.0],
        )?;
        Ok(())
    }

    pub fn stats(&self, user_id: &UserId) -> Result<CacheStats, CacheError> {
        let row: Option<(u64, u64, f64, u64, u64)> = self
            .conn
            .query_row(
                "SELECT cache_hits, cache_misses, total_response_time_ms,
                        response_samples, api_calls_saved
                 FROM cache_stats WHERE user_id = ?1",
                params![user_id.0],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                    ))
                },
            )
            .optional()?;

        Ok(match row {
            Some((hits, misses, total_ms, samples, saved)) => CacheStats {
                cache_hits: hits,
                cache_misses: misses,
                avg_response_time_ms: if samples > 0 {
                    total_ms / samples as f64
                } else {
                    0.0
                },
                api_calls_saved: saved,
            },
            None => CacheStats::default(),
        })
    }

    pub fn entry_count(&self) -> Result<u64, CacheError> {
        let count: u64 =
            self.conn
                .query_row("SELECT COUNT(*) FROM cache_entries", [], |row| row.get(0))?;
        Ok(count)
    }

    /// Cheap liveness probe for the health surface.
    pub fn healthy(&self) -> bool {
        self.conn
            .query_row("SELECT 1", [], |row| row.get::<_, i64>(0))
            .is_ok()
    }
}
