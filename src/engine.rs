//! Top-level engine: Store + Embedder + query pipeline behind one handle
//!
//! The engine is an owned instance, injected where needed - there is no
//! module-level global. One engine means one writer for its database file;
//! opening two engines on the same file is the caller's foot-gun to avoid.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::cache::{CacheError, CacheStats, EmbedCache};
use crate::config::Config;
use crate::deadline::DeadlineExceeded;
use crate::embedder::{Embedder, EmbedderError, EmbedderOptions};
use crate::math::l2_norm;
use crate::query::{self, RecallOptions, RecallResult};
use crate::store::{
    validate_draft, Memory, MemoryId, RememberOptions, Store, StoreError, StoreOptions, StoreStats,
    DEFAULT_COLLECTION,
};

/// How recent a backup must be for automatic recovery to trust it.
const RECOVERY_HORIZON_DAYS: i64 = 7;

/// Tolerance for the unit-norm invariant.
const NORM_EPSILON: f32 = 1e-5;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Storage error: {0}")]
    Storage(StoreError),
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
    #[error("Embedding error: {0}")]
    Embedding(#[from] EmbedderError),
    #[error("Operation exceeded its deadline after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },
    #[error("Internal invariant violated: {0}")]
    Internal(String),
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Validation(msg) => EngineError::Validation(msg),
            other => EngineError::Storage(other),
        }
    }
}

impl From<DeadlineExceeded> for EngineError {
    fn from(e: DeadlineExceeded) -> Self {
        EngineError::Timeout {
            elapsed_ms: e.elapsed_ms,
        }
    }
}

/// Construction-time switches that are API-level decisions, not config-file
/// keys (the recognised config key set is closed).
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    /// Opt in to deterministic hash-expansion embeddings when the encoder is
    /// permanently unavailable.
    pub allow_fallback: bool,
    /// Store tuning (rate limit, graph threshold).
    pub store: StoreOptions,
}

/// Combined statistics for the engine.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub store: StoreStats,
    pub cache: CacheStats,
    pub encoder_calls: u64,
    pub encoder_ready: bool,
}

/// The embedded semantic memory engine.
///
/// # Example
///
/// ```no_run
/// use memento::{Config, Engine, RecallOptions, RememberOptions};
///
/// let engine = Engine::open(Config::load(None))?;
/// engine.remember("Deploy the new model", RememberOptions::default())?;
/// let hits = engine.recall("deployment", &RecallOptions::default())?;
/// for hit in &hits {
///     println!("{:.3}  {}", hit.score, hit.memory.text);
/// }
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Engine {
    store: Store,
    embedder: Embedder,
    config: Config,
}

impl Engine {
    /// Open the engine described by `config`.
    pub fn open(config: Config) -> Result<Self, EngineError> {
        Self::open_with(config, EngineOptions::default())
    }

    /// Open with explicit engine options.
    pub fn open_with(config: Config, opts: EngineOptions) -> Result<Self, EngineError> {
        let data_dir = config.data_dir();
        let store = Store::open_with(&config.db_path(), opts.store)?;

        let cache = EmbedCache::open(&data_dir.join("cache.db"), config.cache.lru_size)?;
        let embedder = Embedder::new(
            EmbedderOptions {
                model_dir: config.embedding.model_path.clone(),
                warmup_timeout: Duration::from_millis(config.embedding.warmup_timeout_ms),
                idle_timeout: Duration::from_millis(config.embedding.idle_timeout_ms),
                allow_fallback: opts.allow_fallback,
                cache_bypass: config.cache.bypass,
            },
            cache,
        );

        let engine = Self {
            store,
            embedder,
            config,
        };
        engine.backup_on_open();
        Ok(engine)
    }

    /// Assemble an engine from pre-built parts (tests, embedders with custom
    /// caches).
    pub fn with_parts(store: Store, embedder: Embedder, config: Config) -> Self {
        Self {
            store,
            embedder,
            config,
        }
    }

    /// Daily snapshot when backups are enabled; failure is logged, not fatal.
    fn backup_on_open(&self) {
        if !self.config.storage.backup.enabled || self.store.is_read_only() {
            return;
        }
        if self.store.latest_backup(chrono::Duration::hours(24)).is_some() {
            return;
        }
        if let Err(e) = self.store.backup(None, self.config.storage.backup.retain) {
            tracing::warn!(error = %e, "Automatic backup on open failed");
        }
    }

    // ============ Write path ============

    /// Validate, embed, and store a memory. Idempotent for identical
    /// `(text, source, session, timestamp)`.
    pub fn remember(&self, text: &str, opts: RememberOptions) -> Result<MemoryId, EngineError> {
        let draft = validate_draft(text, &opts)?;
        let embedding = self.embedder.embed(&draft.text)?;

        let norm = l2_norm(embedding.as_slice());
        if (norm - 1.0).abs() > NORM_EPSILON {
            tracing::error!(norm, "Embedder returned a non-unit vector");
            let _ = self.store.check_integrity();
            return Err(EngineError::Internal(format!(
                "embedding norm {} violates the unit-norm invariant",
                norm
            )));
        }

        let (id, _inserted) = self.store.insert_memory(&draft, embedding.as_slice())?;
        Ok(id)
    }

    /// Delete a memory. `false` when the id was not present.
    pub fn delete(&self, id: &MemoryId) -> Result<bool, EngineError> {
        Ok(self.store.delete(id)?)
    }

    // ============ Read path ============

    /// Similarity + filter query. Returns ranked results or exactly one
    /// error; partial result sets are never returned.
    pub fn recall(
        &self,
        query_text: &str,
        opts: &RecallOptions,
    ) -> Result<Vec<RecallResult>, EngineError> {
        query::recall(
            &self.store,
            &self.embedder,
            query_text,
            opts,
            self.config.filter_expansion(),
            self.config.query.default_timeout_ms,
        )
    }

    /// Batched recall: one embedding batch, per-query result lists in input
    /// order.
    pub fn batch_recall(
        &self,
        queries: &[String],
        opts: &RecallOptions,
    ) -> Result<Vec<Vec<RecallResult>>, EngineError> {
        query::batch_recall(
            &self.store,
            &self.embedder,
            queries,
            opts,
            self.config.filter_expansion(),
            self.config.query.default_timeout_ms,
        )
    }

    /// Most recent memories, newest first.
    pub fn get_recent(
        &self,
        collection: Option<&str>,
        n: usize,
    ) -> Result<Vec<Memory>, EngineError> {
        Ok(self
            .store
            .get_recent(collection.unwrap_or(DEFAULT_COLLECTION), n)?)
    }

    /// Fetch one memory by id.
    pub fn get(&self, id: &MemoryId) -> Result<Option<Memory>, EngineError> {
        Ok(self.store.get(id)?)
    }

    /// BM25 full-text lookup over the lexical index.
    pub fn search_text(
        &self,
        query_text: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryId, f32)>, EngineError> {
        Ok(self.store.search_text(query_text, limit)?)
    }

    /// Combined store/cache/encoder statistics.
    pub fn stats(&self) -> Result<EngineStats, EngineError> {
        Ok(EngineStats {
            store: self.store.stats()?,
            cache: self.embedder.cache_stats(),
            encoder_calls: self.embedder.encoder_calls(),
            encoder_ready: self.embedder.ready(),
        })
    }

    // ============ Maintenance ============

    /// Snapshot the database. `None` writes a rotated backup next to it.
    pub fn backup(&self, target: Option<&Path>) -> Result<PathBuf, EngineError> {
        Ok(self
            .store
            .backup(target, self.config.storage.backup.retain)?)
    }

    /// Export every memory (with embeddings) as JSON. `None` writes a
    /// timestamped file into the data directory.
    pub fn export_json(&self, target: Option<&Path>) -> Result<PathBuf, EngineError> {
        let path = match target {
            Some(p) => p.to_path_buf(),
            None => {
                let name = chrono::Utc::now().format("export-%Y%m%d-%H%M%S.json");
                self.config.data_dir().join(name.to_string())
            }
        };
        Ok(self.store.export_json(&path)?)
    }

    /// Import a previous export. Returns the number of rows inserted.
    pub fn import_json(&self, path: &Path) -> Result<usize, EngineError> {
        Ok(self.store.import_json(path)?)
    }

    /// Restore from the newest backup within the recovery horizon.
    ///
    /// Only meaningful after `Storage(Corrupt)`; the explicit call keeps an
    /// operator in the loop before data is rolled back.
    pub fn recover(&mut self) -> Result<PathBuf, EngineError> {
        let backup = self
            .store
            .latest_backup(chrono::Duration::days(RECOVERY_HORIZON_DAYS))
            .ok_or(EngineError::Storage(StoreError::NoBackup))?;
        self.store.recover_from(&backup)?;
        Ok(backup)
    }

    /// Drop every cached embedding (both tiers).
    pub fn clear_cache(&self) -> Result<(), EngineError> {
        Ok(self.embedder.clear_cache()?)
    }

    /// Whether the encoder is loaded.
    pub fn ready(&self) -> bool {
        self.embedder.ready()
    }

    /// Block until the encoder is ready or the timeout elapses.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        self.embedder.wait_until_ready(timeout)
    }

    /// Whether the store refuses writes after a failed integrity check.
    pub fn is_read_only(&self) -> bool {
        self.store.is_read_only()
    }

    /// Encoder invocation count (cache hits and fallbacks don't increment).
    pub fn encoder_calls(&self) -> u64 {
        self.embedder.encoder_calls()
    }
}
