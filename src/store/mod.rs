//! SQLite storage for memories and embeddings (sqlx async with sync wrappers)
//!
//! Provides sync methods that internally use a tokio runtime to execute async
//! sqlx operations, so callers use the Store synchronously while benefiting
//! from sqlx's pooling.
//!
//! ## Module Structure
//!
//! - `helpers` - Types, validation, id derivation, embedding conversion
//! - `memories` - Memory CRUD, FTS, export/import, stats
//! - `migrations` - Versioned schema upgrades
//!
//! ## Writer discipline
//!
//! Exactly one logical writer at a time per database file. Every write holds
//! the in-memory index write lock across the SQL transaction commit, so
//! post-commit readers always observe index contents that cover the committed
//! rows. Readers run concurrently under WAL.

mod memories;
mod migrations;

pub(crate) mod helpers;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Mutex, RwLock};

use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tokio::runtime::Runtime;

use crate::deadline::{Deadline, DeadlineExceeded};
use crate::hnsw::GraphIndex;
use crate::index::{BruteForceIndex, IndexResult, VectorIndex};
use rand::RngExt;
use crate::{EMBEDDING_DIM, MODEL_NAME};

// Re-export public types

/// One exported row: record plus embedding.
pub use helpers::ExportRecord;

/// An atomic memory record.
pub use helpers::Memory;

/// A fully validated record ready for insertion.
pub use helpers::MemoryDraft;

/// 128-bit blake2b-derived memory identifier.
pub use helpers::MemoryId;

/// Token-bucket configuration for the per-store write throttle.
pub use helpers::RateLimit;

/// Options for `remember`.
pub use helpers::RememberOptions;

/// Store operation errors.
pub use helpers::StoreError;

/// Store statistics.
pub use helpers::StoreStats;

/// Current database schema version.
pub use helpers::CURRENT_SCHEMA_VERSION;

/// Validation entry points, shared with the query pipeline.
pub use helpers::{normalize_text, validate_draft, validate_query};

/// Default partition / identifier values.
pub use helpers::{DEFAULT_COLLECTION, DEFAULT_SESSION, DEFAULT_SOURCE};

use helpers::TokenBucket;

/// Total back-off budget for `Locked` retries before surfacing the error.
const LOCKED_RETRY_BUDGET_MS: u64 = 250;

/// Tuning knobs for a store instance.
///
/// The rate limiter is per-store, not process-global, so tests can
/// instantiate independent stores.
#[derive(Debug, Clone, Copy)]
pub struct StoreOptions {
    /// Write throttle; `None` (the default) means no throttle.
    pub rate_limit: Option<RateLimit>,
    /// Row count at which the HNSW graph backend activates.
    pub graph_threshold: usize,
    /// Writes accumulated since the last graph build before a rebuild.
    pub graph_rebuild_pending: usize,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            rate_limit: None,
            graph_threshold: 10_000,
            graph_rebuild_pending: 1_024,
        }
    }
}

/// Lazily built graph backend plus the writes it has not yet absorbed.
struct GraphState {
    index: Option<GraphIndex>,
    /// Ids inserted since the graph was built; scanned exactly and merged
    /// into graph results until the next rebuild.
    pending: Vec<MemoryId>,
    /// Set when a built graph failed recall validation; brute force stays
    /// authoritative for the lifetime of this store.
    disabled: bool,
}

/// Thread-safe SQLite store for memories and embeddings
///
/// Uses sqlx connection pooling for concurrent reads and WAL mode for crash
/// safety. All methods are synchronous but internally use an async runtime.
///
/// # Example
///
/// ```no_run
/// use memento::Store;
/// use std::path::Path;
///
/// let store = Store::open(Path::new("memory.db"))?;
/// let stats = store.stats()?;
/// println!("{} memories", stats.total_memories);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Store {
    pub(crate) pool: SqlitePool,
    pub(crate) rt: Runtime,
    path: PathBuf,
    opts: StoreOptions,
    /// Whether close() has already been called (skip WAL checkpoint in Drop)
    closed: AtomicBool,
    /// Set after a failed integrity check; writes refuse with `ReadOnly`
    read_only: AtomicBool,
    /// Last issued write timestamp (monotonic per writer)
    last_ts: AtomicI64,
    bucket: Option<TokenBucket>,
    /// In-memory embedding buffer, authoritative for vector search
    pub(crate) index: RwLock<BruteForceIndex>,
    graph: Mutex<GraphState>,
}

impl Store {
    /// Open (creating if necessary) a memory database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with(path, StoreOptions::default())
    }

    /// Open with explicit tuning options.
    pub fn open_with(path: &Path, opts: StoreOptions) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let rt = Runtime::new().map_err(|e| StoreError::Runtime(e.to_string()))?;

        // A corrupt file (e.g. zeroed header) fails at connect time because
        // the open pragmas cannot run. Fall back to a placeholder pool so the
        // caller still gets a handle it can recover() with.
        let (pool, connect_failure) = match rt.block_on(connect_pool(path)) {
            Ok(pool) => (pool, None),
            Err(e) if is_corruption_error(&e) => {
                let placeholder = rt.block_on(
                    SqlitePoolOptions::new()
                        .max_connections(1)
                        .connect("sqlite::memory:"),
                )?;
                (placeholder, Some(e.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        restrict_permissions(path);

        let store = Self {
            pool,
            rt,
            path: path.to_path_buf(),
            opts,
            closed: AtomicBool::new(false),
            read_only: AtomicBool::new(false),
            last_ts: AtomicI64::new(0),
            bucket: opts.rate_limit.map(TokenBucket::new),
            index: RwLock::new(BruteForceIndex::new()),
            graph: Mutex::new(GraphState {
                index: None,
                pending: Vec::new(),
                disabled: false,
            }),
        };

        tracing::info!(path = %path.display(), "Database connected");

        if let Some(reason) = connect_failure {
            store.read_only.store(true, Ordering::SeqCst);
            tracing::error!(
                path = %path.display(),
                reason = %reason,
                "Database file is not readable; store is read-only until recovered"
            );
            return Ok(store);
        }

        match store.integrity_check() {
            Ok(()) => {
                store.ensure_schema()?;
                store.load_index()?;
                store.init_last_ts()?;
            }
            Err(reason) => {
                // Keep the handle alive so the caller can recover() from a
                // backup; everything that writes refuses until then.
                store.read_only.store(true, Ordering::SeqCst);
                tracing::error!(
                    path = %path.display(),
                    reason = %reason,
                    "Integrity check failed; store is read-only until recovered"
                );
            }
        }

        Ok(store)
    }

    /// Database file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the store refuses writes after a failed integrity check.
    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_writable(&self) -> Result<(), StoreError> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Re-run the database integrity check on demand. On failure the store
    /// flips to read-only mode and returns `Corrupt`.
    ///
    /// Used when an invariant violation is observed at a higher layer (e.g. a
    /// non-unit embedding): the violation must trigger an integrity check and
    /// a load-bearing log line, never be silenced.
    pub fn check_integrity(&self) -> Result<(), StoreError> {
        match self.integrity_check() {
            Ok(()) => Ok(()),
            Err(reason) => {
                self.read_only.store(true, Ordering::SeqCst);
                tracing::error!(reason = %reason, "Integrity check failed; store is read-only");
                Err(StoreError::Corrupt(reason))
            }
        }
    }

    /// Run `PRAGMA integrity_check`. Returns the failure description on any
    /// corruption indication (including "file is not a database").
    fn integrity_check(&self) -> Result<(), String> {
        let result: Result<Vec<(String,)>, sqlx::Error> = self.rt.block_on(async {
            sqlx::query_as("PRAGMA integrity_check")
                .fetch_all(&self.pool)
                .await
        });
        match result {
            Ok(rows) => {
                if rows.len() == 1 && rows[0].0 == "ok" {
                    Ok(())
                } else {
                    let detail: Vec<String> = rows.into_iter().map(|(s,)| s).collect();
                    Err(detail.join("; "))
                }
            }
            Err(e) if is_corruption_error(&e) => Err(e.to_string()),
            Err(e) => {
                // Connection-level failures are not corruption, but the store
                // is unusable either way; report and stay read-only.
                Err(format!("integrity check could not run: {}", e))
            }
        }
    }

    /// Create tables on first open; migrate or reject on version mismatch.
    fn ensure_schema(&self) -> Result<(), StoreError> {
        let version = self.rt.block_on(async {
            let row: Option<(String,)> =
                match sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                    .fetch_optional(&self.pool)
                    .await
                {
                    Ok(r) => r,
                    Err(sqlx::Error::Database(e)) if e.message().contains("no such table") => None,
                    Err(e) => return Err(StoreError::from(e)),
                };
            Ok(row.and_then(|(s,)| s.parse::<i32>().ok()).unwrap_or(0))
        })?;

        if version == 0 {
            return self.init_schema();
        }
        if version > CURRENT_SCHEMA_VERSION {
            return Err(StoreError::SchemaNewerThanBuild(version));
        }
        if version < CURRENT_SCHEMA_VERSION {
            self.rt.block_on(migrations::migrate(
                &self.pool,
                version,
                CURRENT_SCHEMA_VERSION,
            ))?;
        }
        self.check_model_metadata()
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.rt.block_on(async {
            // Create tables - execute each statement separately
            let schema = include_str!("../schema.sql");
            for statement in schema.split(';') {
                let stmt: String = statement
                    .lines()
                    .filter(|line| !line.trim().starts_with("--"))
                    .collect::<Vec<_>>()
                    .join("\n");
                let stmt = stmt.trim();
                if stmt.is_empty() {
                    continue;
                }
                sqlx::query(stmt).execute(&self.pool).await?;
            }

            let now = chrono::Utc::now().to_rfc3339();
            for (key, value) in [
                ("schema_version", CURRENT_SCHEMA_VERSION.to_string()),
                ("model_name", MODEL_NAME.to_string()),
                ("dimensions", EMBEDDING_DIM.to_string()),
                ("created_at", now),
                ("memento_version", env!("CARGO_PKG_VERSION").to_string()),
            ] {
                sqlx::query("INSERT INTO metadata (key, value) VALUES (?1, ?2)")
                    .bind(key)
                    .bind(value)
                    .execute(&self.pool)
                    .await?;
            }

            tracing::info!(
                schema_version = CURRENT_SCHEMA_VERSION,
                "Schema initialized"
            );
            Ok(())
        })
    }

    /// Stored embeddings must match the model this build embeds with,
    /// otherwise similarity scores are meaningless.
    fn check_model_metadata(&self) -> Result<(), StoreError> {
        self.rt.block_on(async {
            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'model_name'")
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((stored,)) = row {
                if !stored.is_empty() && stored != MODEL_NAME {
                    return Err(StoreError::Runtime(format!(
                        "database embeddings were produced by '{}', this build uses '{}'",
                        stored, MODEL_NAME
                    )));
                }
            }

            let row: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'dimensions'")
                    .fetch_optional(&self.pool)
                    .await?;
            if let Some((dims,)) = row {
                if let Ok(stored) = dims.parse::<usize>() {
                    if stored != EMBEDDING_DIM {
                        return Err(StoreError::Runtime(format!(
                            "database has {}-dim embeddings, this build expects {}",
                            stored, EMBEDDING_DIM
                        )));
                    }
                }
            }
            Ok(())
        })
    }

    /// Populate the in-memory vector buffer from the memories table.
    fn load_index(&self) -> Result<(), StoreError> {
        let rows: Vec<(Vec<u8>, Vec<u8>)> = self.rt.block_on(async {
            sqlx::query_as("SELECT id, embedding FROM memories")
                .fetch_all(&self.pool)
                .await
        })?;

        let mut buffer = BruteForceIndex::with_capacity(rows.len());
        let mut skipped = 0usize;
        for (id_bytes, emb_bytes) in &rows {
            match (
                MemoryId::from_bytes(id_bytes),
                helpers::embedding_slice(emb_bytes),
            ) {
                (Some(id), Some(vector)) => buffer.insert(id, vector),
                _ => skipped += 1,
            }
        }
        if skipped > 0 {
            tracing::warn!(skipped, "Skipped malformed embedding rows while loading index");
        }
        tracing::debug!(vectors = buffer.len(), "Vector buffer loaded");

        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());
        *index = buffer;
        Ok(())
    }

    fn init_last_ts(&self) -> Result<(), StoreError> {
        let row: Option<(Option<i64>,)> = self.rt.block_on(async {
            sqlx::query_as("SELECT MAX(ts) FROM memories")
                .fetch_optional(&self.pool)
                .await
        })?;
        if let Some((Some(max_ts),)) = row {
            self.last_ts.store(max_ts, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Next write timestamp: wall-clock seconds, never moving backwards.
    /// Ties within one second are broken by insertion order.
    pub(crate) fn next_ts(&self) -> i64 {
        let now = chrono::Utc::now().timestamp();
        let mut current = self.last_ts.load(Ordering::SeqCst);
        loop {
            let next = now.max(current);
            match self.last_ts.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }

    pub(crate) fn throttle(&self) {
        if let Some(bucket) = &self.bucket {
            bucket.acquire();
        }
    }

    /// Retry a write on `SQLITE_BUSY`/`SQLITE_LOCKED` with jittered back-off,
    /// up to ~250 ms total, then surface `Locked`.
    pub(crate) fn with_write_retry<T>(
        &self,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut spent_ms = 0u64;
        let mut attempt = 0u32;
        loop {
            match f() {
                Err(StoreError::Database(e)) if is_locked_error(&e) => {
                    if spent_ms >= LOCKED_RETRY_BUDGET_MS {
                        tracing::warn!("Write retries exhausted, database still locked");
                        return Err(StoreError::Locked);
                    }
                    attempt += 1;
                    let base = 10u64 << attempt.min(4);
                    let jitter = rand::rng().random_range(0..=base / 2);
                    let sleep_ms = (base + jitter).min(LOCKED_RETRY_BUDGET_MS - spent_ms);
                    tracing::debug!(attempt, sleep_ms, "Database locked, backing off");
                    std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
                    spent_ms += sleep_ms;
                }
                Err(StoreError::Database(e)) if is_corruption_error(&e) => {
                    self.read_only.store(true, Ordering::SeqCst);
                    tracing::error!(error = %e, "Corruption detected; store is now read-only");
                    return Err(StoreError::Corrupt(e.to_string()));
                }
                other => return other,
            }
        }
    }

    // ============ Vector search ============

    /// Top-k nearest neighbours over the committed embeddings.
    ///
    /// Uses the brute-force buffer by default; above `graph_threshold` rows an
    /// HNSW graph is built lazily and answers instead, with writes since the
    /// last build scanned exactly and merged so results stay fresh.
    pub fn vector_search(
        &self,
        query: &[f32],
        k: usize,
        deadline: &Deadline,
    ) -> Result<Vec<IndexResult>, DeadlineExceeded> {
        if k == 0 {
            return Ok(Vec::new());
        }
        let brute = self.index.read().unwrap_or_else(|p| p.into_inner());

        if brute.len() >= self.opts.graph_threshold {
            let mut graph = self.graph.lock().unwrap_or_else(|p| p.into_inner());
            if !graph.disabled {
                if graph.index.is_none() || graph.pending.len() > self.opts.graph_rebuild_pending {
                    deadline.check()?;
                    match GraphIndex::build_validated(&brute) {
                        Some(built) => {
                            graph.index = Some(built);
                            graph.pending.clear();
                        }
                        None => {
                            graph.disabled = true;
                        }
                    }
                }
                if let Some(g) = &graph.index {
                    let mut results = g.search(query, k, deadline)?;

                    // Writes newer than the graph: exact scores, merged in
                    for id in &graph.pending {
                        if let Some(score) = brute
                            .vector(id)
                            .and_then(|vector| crate::math::cosine_similarity(query, vector))
                        {
                            results.push(IndexResult { id: *id, score });
                        }
                    }

                    // Rows deleted since the build must not surface
                    results.retain(|r| brute.contains(&r.id));
                    results.sort_by(|a, b| {
                        b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id))
                    });
                    results.dedup_by_key(|r| r.id);
                    results.truncate(k);
                    return Ok(results);
                }
            }
        }

        brute.search(query, k, deadline)
    }

    /// Number of vectors in the in-memory index.
    pub fn vector_count(&self) -> usize {
        let index = self.index.read().unwrap_or_else(|p| p.into_inner());
        index.len()
    }

    /// Name of the backend that would answer a search right now.
    pub fn index_backend(&self) -> &'static str {
        let brute = self.index.read().unwrap_or_else(|p| p.into_inner());
        if brute.len() >= self.opts.graph_threshold {
            let graph = self.graph.lock().unwrap_or_else(|p| p.into_inner());
            if !graph.disabled {
                return "hnsw";
            }
        }
        "brute-force"
    }

    /// Record a freshly indexed id so graph searches merge it until rebuild.
    pub(crate) fn note_pending_write(&self, id: MemoryId) {
        let mut graph = self.graph.lock().unwrap_or_else(|p| p.into_inner());
        if graph.index.is_some() {
            graph.pending.push(id);
        }
    }

    // ============ Backup / recovery ============

    /// Snapshot the database via SQLite's online `VACUUM INTO`.
    ///
    /// With no explicit target, writes `backups/<YYYYMMDD-HHMMSS>.db` next to
    /// the database and prunes old snapshots down to `retain`.
    pub fn backup(&self, target: Option<&Path>, retain: usize) -> Result<PathBuf, StoreError> {
        // A snapshot of a corrupt store would be garbage, and a rotated one
        // could shadow the very backup recovery needs
        self.ensure_writable()?;

        let (dest, rotate_dir) = match target {
            Some(p) => (p.to_path_buf(), None),
            None => {
                let dir = self.backup_dir();
                std::fs::create_dir_all(&dir)?;
                let name = chrono::Utc::now().format("%Y%m%d-%H%M%S").to_string();
                (dir.join(format!("{}.db", name)), Some(dir))
            }
        };

        if dest.exists() {
            return Err(StoreError::Validation(format!(
                "backup target {} already exists",
                dest.display()
            )));
        }

        let dest_sql = dest.to_string_lossy().replace('\'', "''");
        self.rt.block_on(async {
            sqlx::query(&format!("VACUUM INTO '{}'", dest_sql))
                .execute(&self.pool)
                .await
        })?;
        tracing::info!(path = %dest.display(), "Backup written");

        if let Some(dir) = rotate_dir {
            if let Err(e) = prune_backups(&dir, retain) {
                tracing::warn!(error = %e, "Backup rotation failed");
            }
        }

        Ok(dest)
    }

    fn backup_dir(&self) -> PathBuf {
        self.path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."))
            .join("backups")
    }

    /// Newest rotated backup younger than `max_age`, if any.
    pub fn latest_backup(&self, max_age: chrono::Duration) -> Option<PathBuf> {
        let dir = self.backup_dir();
        let mut candidates: Vec<PathBuf> = std::fs::read_dir(&dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
            .collect();
        candidates.sort();
        let newest = candidates.pop()?;

        let age = newest
            .metadata()
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())?;
        if age > max_age.to_std().unwrap_or_default() {
            tracing::warn!(
                path = %newest.display(),
                age_secs = age.as_secs(),
                "Newest backup is older than the recovery horizon"
            );
            return None;
        }
        Some(newest)
    }

    /// Replace a corrupt database with the given backup and reopen.
    ///
    /// Only meaningful after a failed integrity check; the WAL/SHM sidecars
    /// of the corrupt file are discarded with it.
    pub fn recover_from(&mut self, backup: &Path) -> Result<(), StoreError> {
        if !backup.exists() {
            return Err(StoreError::NoBackup);
        }
        tracing::info!(backup = %backup.display(), "Recovering from backup");

        self.rt.block_on(self.pool.close());

        std::fs::copy(backup, &self.path)?;
        for ext in ["db-wal", "db-shm"] {
            let sidecar = self.path.with_extension(ext);
            if sidecar.exists() {
                let _ = std::fs::remove_file(&sidecar);
            }
        }

        self.pool = self.rt.block_on(connect_pool(&self.path))?;
        restrict_permissions(&self.path);

        match self.integrity_check() {
            Ok(()) => {
                self.read_only.store(false, Ordering::SeqCst);
                self.ensure_schema()?;
                self.load_index()?;
                self.init_last_ts()?;
                {
                    let mut graph = self.graph.lock().unwrap_or_else(|p| p.into_inner());
                    graph.index = None;
                    graph.pending.clear();
                }
                tracing::info!("Recovery complete");
                Ok(())
            }
            Err(reason) => {
                self.read_only.store(true, Ordering::SeqCst);
                Err(StoreError::Corrupt(format!(
                    "backup failed integrity check: {}",
                    reason
                )))
            }
        }
    }

    /// Checkpoint the WAL and close the pool. Called automatically on Drop,
    /// but an explicit close surfaces errors instead of logging them.
    pub fn close(&self) -> Result<(), StoreError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.rt.block_on(async {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&self.pool)
                .await
            {
                tracing::debug!(error = %e, "WAL checkpoint on close failed");
            }
            self.pool.close().await;
            Ok(())
        })
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        if !self.closed.load(Ordering::SeqCst) {
            if let Err(e) = self.close() {
                tracing::debug!(error = %e, "Store close during drop failed");
            }
        }
    }
}

async fn connect_pool(path: &Path) -> Result<SqlitePool, sqlx::Error> {
    // Forward slashes for URL compatibility (Windows backslashes don't work)
    let path_str = path.to_string_lossy().replace('\\', "/");
    let db_url = format!("sqlite://{}?mode=rwc", path_str);

    SqlitePoolOptions::new()
        .max_connections(4)
        .idle_timeout(std::time::Duration::from_secs(300))
        .after_connect(|conn, _meta| {
            Box::pin(async move {
                // WAL mode: concurrent reads, single writer
                sqlx::query("PRAGMA journal_mode = WAL")
                    .execute(&mut *conn)
                    .await?;
                // 5000ms busy timeout before SQLITE_BUSY
                sqlx::query("PRAGMA busy_timeout = 5000")
                    .execute(&mut *conn)
                    .await?;
                // NORMAL sync: fsync on WAL checkpoint only (safe with WAL)
                sqlx::query("PRAGMA synchronous = NORMAL")
                    .execute(&mut *conn)
                    .await?;
                // 16MB page cache per connection (negative = KB)
                sqlx::query("PRAGMA cache_size = -16384")
                    .execute(&mut *conn)
                    .await?;
                // Keep temp tables in memory
                sqlx::query("PRAGMA temp_store = MEMORY")
                    .execute(&mut *conn)
                    .await?;
                Ok(())
            })
        })
        .connect(&db_url)
        .await
}

/// Restrictive permissions on database files (Unix only). Memories are not
/// secrets, but there is no reason to leave them world-readable either.
fn restrict_permissions(path: &Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let restrictive = std::fs::Permissions::from_mode(0o600);
        let _ = std::fs::set_permissions(path, restrictive.clone());
        for ext in ["db-wal", "db-shm"] {
            let _ = std::fs::set_permissions(path.with_extension(ext), restrictive.clone());
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

fn prune_backups(dir: &Path, retain: usize) -> std::io::Result<()> {
    let mut backups: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "db"))
        .collect();
    // Timestamp-named files sort chronologically
    backups.sort();
    while backups.len() > retain {
        let victim = backups.remove(0);
        tracing::debug!(path = %victim.display(), "Pruning old backup");
        std::fs::remove_file(&victim)?;
    }
    Ok(())
}

/// SQLITE_BUSY (5) / SQLITE_LOCKED (6) and their extended codes.
fn is_locked_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(
                db.code().as_deref(),
                Some("5") | Some("6") | Some("261") | Some("517")
            ) || db.message().contains("database is locked")
        }
        _ => false,
    }
}

/// SQLITE_CORRUPT (11) / SQLITE_NOTADB (26) and their extended codes.
fn is_corruption_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("11") | Some("26") | Some("523"))
                || db.message().contains("file is not a database")
                || db.message().contains("database disk image is malformed")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_and_reopens() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = Store::open(&path).unwrap();
            assert!(!store.is_read_only());
            store.close().unwrap();
        }
        let store = Store::open(&path).unwrap();
        assert!(!store.is_read_only());
    }

    #[test]
    fn test_corrupt_header_forces_read_only() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("memory.db");
        {
            let store = Store::open(&path).unwrap();
            store.close().unwrap();
        }
        // Zero the first 100 bytes (the SQLite header)
        let mut contents = std::fs::read(&path).unwrap();
        for b in contents.iter_mut().take(100) {
            *b = 0;
        }
        std::fs::write(&path, &contents).unwrap();

        let store = Store::open(&path).unwrap();
        assert!(store.is_read_only());
        assert!(matches!(
            store.ensure_writable(),
            Err(StoreError::ReadOnly)
        ));
    }

    #[test]
    fn test_next_ts_monotonic() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("memory.db")).unwrap();
        let a = store.next_ts();
        let b = store.next_ts();
        assert!(b >= a);
    }

    #[test]
    fn test_backup_and_prune() {
        let dir = TempDir::new().unwrap();
        let store = Store::open(&dir.path().join("memory.db")).unwrap();

        let explicit = dir.path().join("snapshot.db");
        let written = store.backup(Some(&explicit), 7).unwrap();
        assert_eq!(written, explicit);
        assert!(explicit.exists());

        // Existing target is refused
        assert!(store.backup(Some(&explicit), 7).is_err());
    }

    #[test]
    fn test_prune_backups_keeps_newest() {
        let dir = TempDir::new().unwrap();
        for name in ["20250101-000000.db", "20250102-000000.db", "20250103-000000.db"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        prune_backups(dir.path(), 2).unwrap();
        let mut left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        left.sort();
        assert_eq!(left, vec!["20250102-000000.db", "20250103-000000.db"]);
    }
}
