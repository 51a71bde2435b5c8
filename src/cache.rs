//! Two-tier embedding cache
//!
//! Content-addressed: `blake2b(nfc(text))` truncated to 256 bits keys both
//! tiers. The front is an in-process LRU behind a short-held mutex; behind it
//! sits a persistent `embed_cache` table in its own SQLite file with its own
//! single writer. Disk hits are promoted to the LRU. Entries are only ever
//! removed from the persistent tier by an explicit `clear()`.
//!
//! Insertion is last-writer-wins: embeddings are deterministic, so concurrent
//! writers agree on the value.

use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use blake2::{Blake2b512, Digest};
use lru::LruCache;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use thiserror::Error;
use tokio::runtime::Runtime;
use unicode_normalization::UnicodeNormalization;

use crate::EMBEDDING_DIM;

/// 256-bit content key.
pub type CacheKey = [u8; 32];

/// Default LRU capacity.
pub const DEFAULT_LRU_SIZE: usize = 1000;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(String),
}

/// Hit/miss counters for the cache.
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub lru_hits: u64,
    pub disk_hits: u64,
    pub hit_rate: f64,
    pub backend_name: &'static str,
}

/// Content-addressed two-tier embedding cache.
pub struct EmbedCache {
    pool: SqlitePool,
    rt: Runtime,
    lru: Mutex<LruCache<CacheKey, Vec<f32>>>,
    hits: AtomicU64,
    misses: AtomicU64,
    lru_hits: AtomicU64,
    disk_hits: AtomicU64,
}

impl EmbedCache {
    /// Open (creating if necessary) a cache database at `path`.
    pub fn open(path: &Path, lru_size: usize) -> Result<Self, CacheError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let path_str = path.to_string_lossy().replace('\\', "/");
        Self::connect(&format!("sqlite://{}?mode=rwc", path_str), lru_size)
    }

    /// Memory-backed cache: the persistent tier lives only as long as the
    /// process. Used by tests and by embedders configured without a data dir.
    pub fn in_memory(lru_size: usize) -> Result<Self, CacheError> {
        Self::connect("sqlite::memory:", lru_size)
    }

    fn connect(db_url: &str, lru_size: usize) -> Result<Self, CacheError> {
        let rt = Runtime::new().map_err(|e| CacheError::Runtime(e.to_string()))?;
        let pool = rt.block_on(async {
            let pool = SqlitePoolOptions::new()
                // A single connection keeps the writer unique and, for the
                // in-memory URL, keeps every handle on the same database.
                .max_connections(1)
                .after_connect(|conn, _meta| {
                    Box::pin(async move {
                        sqlx::query("PRAGMA journal_mode = WAL")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("PRAGMA busy_timeout = 5000")
                            .execute(&mut *conn)
                            .await?;
                        sqlx::query("PRAGMA synchronous = NORMAL")
                            .execute(&mut *conn)
                            .await?;
                        Ok(())
                    })
                })
                .connect(db_url)
                .await?;
            sqlx::query(
                "CREATE TABLE IF NOT EXISTS embed_cache (
                    h BLOB PRIMARY KEY,
                    vec BLOB NOT NULL,
                    ts INTEGER NOT NULL
                )",
            )
            .execute(&pool)
            .await?;
            Ok::<_, CacheError>(pool)
        })?;

        let capacity = NonZeroUsize::new(lru_size.max(1)).expect("max(1) is non-zero");
        Ok(Self {
            pool,
            rt,
            lru: Mutex::new(LruCache::new(capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            lru_hits: AtomicU64::new(0),
            disk_hits: AtomicU64::new(0),
        })
    }

    /// Content key for a text: `blake2b(nfc(text))` truncated to 256 bits.
    pub fn key(text: &str) -> CacheKey {
        let normalized: String = text.nfc().collect();
        let digest = Blake2b512::digest(normalized.as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest[..32]);
        key
    }

    /// Look up a text. `bypass` disables the lookup for this call.
    pub fn get(&self, text: &str, bypass: bool) -> Option<Vec<f32>> {
        if bypass {
            return None;
        }
        self.get_by_key(&Self::key(text))
    }

    /// Look up by precomputed key (avoids re-hashing in the embedder).
    pub fn get_by_key(&self, key: &CacheKey) -> Option<Vec<f32>> {
        {
            let mut lru = self.lru.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(vector) = lru.get(key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.lru_hits.fetch_add(1, Ordering::Relaxed);
                return Some(vector.clone());
            }
        }

        let row: Option<(Vec<u8>,)> = self
            .rt
            .block_on(async {
                sqlx::query_as("SELECT vec FROM embed_cache WHERE h = ?1")
                    .bind(key.as_slice())
                    .fetch_optional(&self.pool)
                    .await
            })
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Cache read failed, treating as miss");
                None
            });

        match row.and_then(|(bytes,)| decode_vector(&bytes)) {
            Some(vector) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                self.disk_hits.fetch_add(1, Ordering::Relaxed);
                // Promote to the front tier
                let mut lru = self.lru.lock().unwrap_or_else(|p| p.into_inner());
                lru.put(*key, vector.clone());
                Some(vector)
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store a vector in both tiers. `bypass` disables the write.
    pub fn put(&self, text: &str, vector: &[f32], bypass: bool) -> Result<(), CacheError> {
        if bypass {
            return Ok(());
        }
        self.put_by_key(&Self::key(text), vector)
    }

    /// Store by precomputed key. Upsert: last writer wins.
    pub fn put_by_key(&self, key: &CacheKey, vector: &[f32]) -> Result<(), CacheError> {
        debug_assert_eq!(vector.len(), EMBEDDING_DIM);
        {
            let mut lru = self.lru.lock().unwrap_or_else(|p| p.into_inner());
            lru.put(*key, vector.to_vec());
        }

        let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
        let ts = chrono::Utc::now().timestamp();
        self.rt.block_on(async {
            sqlx::query("INSERT OR REPLACE INTO embed_cache (h, vec, ts) VALUES (?1, ?2, ?3)")
                .bind(key.as_slice())
                .bind(&bytes)
                .bind(ts)
                .execute(&self.pool)
                .await
        })?;
        Ok(())
    }

    /// Drop every entry from both tiers.
    pub fn clear(&self) -> Result<(), CacheError> {
        {
            let mut lru = self.lru.lock().unwrap_or_else(|p| p.into_inner());
            lru.clear();
        }
        self.rt.block_on(async {
            sqlx::query("DELETE FROM embed_cache")
                .execute(&self.pool)
                .await
        })?;
        tracing::info!("Embed cache cleared");
        Ok(())
    }

    /// Rows in the persistent tier.
    pub fn persistent_len(&self) -> Result<u64, CacheError> {
        let row: (i64,) = self.rt.block_on(async {
            sqlx::query_as("SELECT COUNT(*) FROM embed_cache")
                .fetch_one(&self.pool)
                .await
        })?;
        Ok(row.0.max(0) as u64)
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        CacheStats {
            hits,
            misses,
            lru_hits: self.lru_hits.load(Ordering::Relaxed),
            disk_hits: self.disk_hits.load(Ordering::Relaxed),
            hit_rate: if total == 0 {
                0.0
            } else {
                hits as f64 / total as f64
            },
            backend_name: "sqlite",
        }
    }
}

fn decode_vector(bytes: &[u8]) -> Option<Vec<f32>> {
    if bytes.len() != EMBEDDING_DIM * 4 {
        tracing::warn!(
            expected = EMBEDDING_DIM * 4,
            actual = bytes.len(),
            "Malformed cache row, ignoring"
        );
        return None;
    }
    Some(
        bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_vector(seed: f32) -> Vec<f32> {
        (0..EMBEDDING_DIM).map(|i| seed + i as f32 * 0.001).collect()
    }

    #[test]
    fn test_key_is_nfc_invariant() {
        // Decomposed and precomposed forms must hash identically
        assert_eq!(EmbedCache::key("cafe\u{0301}"), EmbedCache::key("caf\u{00e9}"));
        assert_ne!(EmbedCache::key("cafe"), EmbedCache::key("caff"));
    }

    #[test]
    fn test_put_get_round_trip() {
        let cache = EmbedCache::in_memory(10).unwrap();
        let v = sample_vector(0.5);
        cache.put("hello", &v, false).unwrap();
        assert_eq!(cache.get("hello", false), Some(v));
        assert_eq!(cache.get("other", false), None);
    }

    #[test]
    fn test_disk_hit_after_lru_eviction() {
        let cache = EmbedCache::in_memory(1).unwrap();
        let v1 = sample_vector(0.1);
        let v2 = sample_vector(0.2);
        cache.put("one", &v1, false).unwrap();
        cache.put("two", &v2, false).unwrap(); // evicts "one" from the LRU

        // "one" is gone from the front tier but persists on disk
        assert_eq!(cache.get("one", false), Some(v1));
        let stats = cache.stats();
        assert_eq!(stats.disk_hits, 1);
        assert_eq!(stats.hits, 1);
    }

    #[test]
    fn test_bypass_skips_both_directions() {
        let cache = EmbedCache::in_memory(10).unwrap();
        let v = sample_vector(0.3);
        cache.put("x", &v, true).unwrap();
        assert_eq!(cache.get("x", false), None);
        cache.put("x", &v, false).unwrap();
        assert_eq!(cache.get("x", true), None);
        // Bypass reads do not touch the counters
        let stats = cache.stats();
        assert_eq!(stats.hits, 0);
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = EmbedCache::in_memory(10).unwrap();
        cache.put("k", &sample_vector(0.1), false).unwrap();
        let newer = sample_vector(0.9);
        cache.put("k", &newer, false).unwrap();
        assert_eq!(cache.get("k", false), Some(newer));
        assert_eq!(cache.persistent_len().unwrap(), 1);
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let cache = EmbedCache::in_memory(10).unwrap();
        cache.put("k", &sample_vector(0.1), false).unwrap();
        cache.clear().unwrap();
        assert_eq!(cache.get("k", false), None);
        assert_eq!(cache.persistent_len().unwrap(), 0);
    }

    #[test]
    fn test_hit_rate() {
        let cache = EmbedCache::in_memory(10).unwrap();
        cache.put("k", &sample_vector(0.1), false).unwrap();
        let _ = cache.get("k", false);
        let _ = cache.get("missing", false);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.5).abs() < f64::EPSILON);
        assert_eq!(stats.backend_name, "sqlite");
    }
}
