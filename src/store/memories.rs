//! Memory CRUD, full-text lookup, export/import, and statistics

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use super::helpers::{
    embedding_slice, embedding_to_bytes, ExportRecord, Memory, MemoryDraft, MemoryId, StoreError,
    StoreStats, CURRENT_SCHEMA_VERSION,
};
use super::Store;
use crate::index::VectorIndex;
use crate::math::{l2_norm, l2_normalize};

/// Tolerance for the unit-norm invariant on stored embeddings.
const NORM_EPSILON: f32 = 1e-5;

/// Cap on MATCH tokens so a pathological query cannot explode the FTS parse.
const MAX_FTS_TOKENS: usize = 32;

const MEMORY_COLUMNS: &str =
    "id, text, ts, source, session_id, importance, tags, collection";

fn row_to_memory(row: &SqliteRow) -> Option<Memory> {
    let id_bytes: Vec<u8> = row.get(0);
    let id = match MemoryId::from_bytes(&id_bytes) {
        Some(id) => id,
        None => {
            tracing::warn!(len = id_bytes.len(), "Malformed id blob, skipping row");
            return None;
        }
    };
    let tags_json: String = row.get(6);
    let tags: Vec<String> = serde_json::from_str(&tags_json).unwrap_or_else(|e| {
        tracing::warn!(id = %id, error = %e, "Malformed tags JSON, treating as empty");
        Vec::new()
    });
    Some(Memory {
        id,
        text: row.get(1),
        ts: row.get(2),
        source: row.get(3),
        session_id: row.get(4),
        importance: row.get::<f64, _>(5) as f32,
        tags,
        collection: row.get(7),
    })
}

impl Store {
    /// Insert a validated record with its embedding.
    ///
    /// The memory row, its FTS entry, and the vector index entry are updated
    /// inside one transaction, keyed by the same explicit id. Re-inserting an
    /// identical `(text, source, session, ts)` is idempotent: the existing id
    /// is returned and nothing is written.
    ///
    /// Returns `(id, inserted)` where `inserted` is false for the no-op case.
    pub fn insert_memory(
        &self,
        draft: &MemoryDraft,
        embedding: &[f32],
    ) -> Result<(MemoryId, bool), StoreError> {
        self.ensure_writable()?;

        let norm = l2_norm(embedding);
        if (norm - 1.0).abs() > NORM_EPSILON {
            tracing::error!(norm, "Refusing non-unit embedding");
            return Err(StoreError::Validation(format!(
                "embedding norm {} is outside [1-eps, 1+eps]",
                norm
            )));
        }
        let embedding_bytes = embedding_to_bytes(embedding)?;

        self.throttle();

        let ts = match draft.timestamp {
            Some(explicit) => explicit,
            None => self.next_ts(),
        };
        let id = MemoryId::derive(&draft.text, &draft.source, &draft.session_id, ts);
        let tags_json = serde_json::to_string(&draft.tags)
            .map_err(|e| StoreError::Runtime(e.to_string()))?;
        let created_at = chrono::Utc::now().to_rfc3339();

        // The buffer write lock is held across the commit so that post-commit
        // readers always observe index contents covering the committed row.
        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());

        let inserted = self.with_write_retry(|| {
            self.rt.block_on(async {
                let mut tx = self.pool.begin().await?;

                let result = sqlx::query(
                    "INSERT OR IGNORE INTO memories \
                     (id, text, ts, source, session_id, importance, tags, collection, embedding, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                )
                .bind(id.as_bytes().as_slice())
                .bind(&draft.text)
                .bind(ts)
                .bind(&draft.source)
                .bind(&draft.session_id)
                .bind(draft.importance as f64)
                .bind(&tags_json)
                .bind(&draft.collection)
                .bind(&embedding_bytes)
                .bind(&created_at)
                .execute(&mut *tx)
                .await?;

                if result.rows_affected() == 0 {
                    // Duplicate (text, source, session, ts): idempotent no-op
                    tx.rollback().await?;
                    return Ok(false);
                }

                // Same explicit id into FTS, inside the same transaction
                sqlx::query("INSERT INTO memories_fts (id, text) VALUES (?1, ?2)")
                    .bind(id.to_hex())
                    .bind(&draft.text)
                    .execute(&mut *tx)
                    .await?;

                tx.commit().await?;
                Ok(true)
            })
        })?;

        if inserted {
            index.insert(id, embedding);
            drop(index);
            self.note_pending_write(id);
            tracing::debug!(id = %id, collection = %draft.collection, "Memory stored");
        } else {
            tracing::debug!(id = %id, "Duplicate remember, returning existing id");
        }

        Ok((id, inserted))
    }

    /// Delete a memory. Cascades to the FTS table and the vector index in the
    /// same transaction; a missing id returns `false`, not an error.
    pub fn delete(&self, id: &MemoryId) -> Result<bool, StoreError> {
        self.ensure_writable()?;
        self.throttle();

        let mut index = self.index.write().unwrap_or_else(|p| p.into_inner());

        let deleted = self.with_write_retry(|| {
            self.rt.block_on(async {
                let mut tx = self.pool.begin().await?;
                sqlx::query("DELETE FROM memories_fts WHERE id = ?1")
                    .bind(id.to_hex())
                    .execute(&mut *tx)
                    .await?;
                let result = sqlx::query("DELETE FROM memories WHERE id = ?1")
                    .bind(id.as_bytes().as_slice())
                    .execute(&mut *tx)
                    .await?;
                tx.commit().await?;
                Ok(result.rows_affected() > 0)
            })
        })?;

        if deleted {
            index.remove(id);
            tracing::debug!(id = %id, "Memory deleted");
        }
        Ok(deleted)
    }

    /// Fetch a single memory by id.
    pub fn get(&self, id: &MemoryId) -> Result<Option<Memory>, StoreError> {
        let row: Option<SqliteRow> = self.rt.block_on(async {
            sqlx::query(&format!(
                "SELECT {} FROM memories WHERE id = ?1",
                MEMORY_COLUMNS
            ))
            .bind(id.as_bytes().as_slice())
            .fetch_optional(&self.pool)
            .await
        })?;
        Ok(row.as_ref().and_then(row_to_memory))
    }

    /// Most recent memories in a collection, newest first (ties by id).
    pub fn get_recent(&self, collection: &str, n: usize) -> Result<Vec<Memory>, StoreError> {
        let rows: Vec<SqliteRow> = self.rt.block_on(async {
            sqlx::query(&format!(
                "SELECT {} FROM memories WHERE collection = ?1 ORDER BY ts DESC, id ASC LIMIT ?2",
                MEMORY_COLUMNS
            ))
            .bind(collection)
            .bind(n as i64)
            .fetch_all(&self.pool)
            .await
        })?;
        Ok(rows.iter().filter_map(row_to_memory).collect())
    }

    /// Fetch full rows for a candidate id set (hydration).
    ///
    /// Chunked to stay under SQLite's bound-parameter limit for large
    /// candidate sets.
    pub fn hydrate(&self, ids: &[MemoryId]) -> Result<HashMap<MemoryId, Memory>, StoreError> {
        const CHUNK: usize = 500;

        let mut out = HashMap::with_capacity(ids.len());
        for chunk in ids.chunks(CHUNK) {
            let placeholders: Vec<String> = (1..=chunk.len()).map(|i| format!("?{}", i)).collect();
            let sql = format!(
                "SELECT {} FROM memories WHERE id IN ({})",
                MEMORY_COLUMNS,
                placeholders.join(", ")
            );

            let rows: Vec<SqliteRow> = self.rt.block_on(async {
                let mut query = sqlx::query(&sql);
                for id in chunk {
                    query = query.bind(id.as_bytes().as_slice());
                }
                query.fetch_all(&self.pool).await
            })?;

            out.extend(rows.iter().filter_map(row_to_memory).map(|m| (m.id, m)));
        }
        Ok(out)
    }

    /// BM25-ranked full-text lookup. Returns `(id, score)` pairs with higher
    /// scores better (bm25 is negated so ordering matches vector scores).
    pub fn search_text(
        &self,
        query: &str,
        limit: usize,
    ) -> Result<Vec<(MemoryId, f32)>, StoreError> {
        let Some(match_expr) = sanitize_match_query(query) else {
            tracing::debug!(query, "Query produced no FTS tokens");
            return Ok(Vec::new());
        };

        let rows: Vec<(String, f64)> = self.rt.block_on(async {
            sqlx::query_as(
                "SELECT id, bm25(memories_fts) FROM memories_fts \
                 WHERE memories_fts MATCH ?1 ORDER BY bm25(memories_fts) LIMIT ?2",
            )
            .bind(&match_expr)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await
        })?;

        Ok(rows
            .into_iter()
            .filter_map(|(hex, bm25)| {
                hex.parse::<MemoryId>()
                    .ok()
                    .map(|id| (id, -(bm25 as f32)))
            })
            .collect())
    }

    /// Store statistics.
    pub fn stats(&self) -> Result<StoreStats, StoreError> {
        let (total, by_collection, created_at, schema_version) = self.rt.block_on(async {
            let total: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM memories")
                .fetch_one(&self.pool)
                .await?;

            let rows: Vec<(String, i64)> =
                sqlx::query_as("SELECT collection, COUNT(*) FROM memories GROUP BY collection")
                    .fetch_all(&self.pool)
                    .await?;
            let by_collection: HashMap<String, u64> = rows
                .into_iter()
                .map(|(c, n)| (c, n.max(0) as u64))
                .collect();

            let created_at: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'created_at'")
                    .fetch_optional(&self.pool)
                    .await?;

            let version: Option<(String,)> =
                sqlx::query_as("SELECT value FROM metadata WHERE key = 'schema_version'")
                    .fetch_optional(&self.pool)
                    .await?;

            Ok::<_, StoreError>((
                total.0.max(0) as u64,
                by_collection,
                created_at.map(|(s,)| s).unwrap_or_default(),
                version
                    .and_then(|(s,)| s.parse().ok())
                    .unwrap_or(CURRENT_SCHEMA_VERSION),
            ))
        })?;

        let db_size_bytes = std::fs::metadata(self.path())
            .map(|m| m.len())
            .unwrap_or(0);
        let total_vectors = {
            let index = self.index.read().unwrap_or_else(|p| p.into_inner());
            index.len() as u64
        };

        Ok(StoreStats {
            total_memories: total,
            by_collection,
            total_vectors,
            index_backend: self.index_backend(),
            db_size_bytes,
            created_at,
            schema_version,
        })
    }

    /// Export every memory (with its embedding) as a JSON array.
    ///
    /// Rows stream to a staging file which is atomically renamed into place,
    /// so a crash mid-export never leaves a truncated file at `path`.
    pub fn export_json(&self, path: &Path) -> Result<PathBuf, StoreError> {
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        std::fs::create_dir_all(&parent)?;

        let staging = tempfile::NamedTempFile::new_in(&parent)?;
        let mut writer = std::io::BufWriter::new(staging);

        let rows: Vec<SqliteRow> = self.rt.block_on(async {
            sqlx::query(&format!(
                "SELECT {}, embedding FROM memories ORDER BY ts ASC, id ASC",
                MEMORY_COLUMNS
            ))
            .fetch_all(&self.pool)
            .await
        })?;

        writer.write_all(b"[")?;
        let mut first = true;
        let mut exported = 0usize;
        for row in &rows {
            let Some(memory) = row_to_memory(row) else {
                continue;
            };
            let embedding_bytes: Vec<u8> = row.get(8);
            let Some(embedding) = embedding_slice(&embedding_bytes) else {
                tracing::warn!(id = %memory.id, "Skipping row with malformed embedding");
                continue;
            };
            if !first {
                writer.write_all(b",")?;
            }
            first = false;
            writer.write_all(b"\n")?;
            let record = ExportRecord {
                memory,
                embedding: embedding.to_vec(),
            };
            serde_json::to_writer(&mut writer, &record)
                .map_err(|e| StoreError::Runtime(e.to_string()))?;
            exported += 1;
        }
        writer.write_all(b"\n]\n")?;

        let staging = writer
            .into_inner()
            .map_err(|e| StoreError::Runtime(e.to_string()))?;
        staging
            .persist(path)
            .map_err(|e| StoreError::Io(e.error))?;

        tracing::info!(path = %path.display(), rows = exported, "Export complete");
        Ok(path.to_path_buf())
    }

    /// Import records previously written by `export_json`.
    ///
    /// Ids are re-derived from `(text, source, session, ts)` - identical to
    /// the exported ids by construction - so importing into a non-empty store
    /// deduplicates rather than duplicating. Returns the number of rows
    /// actually inserted.
    pub fn import_json(&self, path: &Path) -> Result<usize, StoreError> {
        self.ensure_writable()?;

        let file = std::fs::File::open(path)?;
        let records: Vec<ExportRecord> = serde_json::from_reader(std::io::BufReader::new(file))
            .map_err(|e| StoreError::Validation(format!("malformed export file: {}", e)))?;

        let mut inserted = 0usize;
        for record in records {
            let mut embedding = record.embedding;
            let norm = l2_norm(&embedding);
            if (norm - 1.0).abs() > NORM_EPSILON {
                // Exported vectors are unit-normalised; tolerate drift from
                // JSON float round-tripping but refuse zero vectors.
                if !l2_normalize(&mut embedding) {
                    tracing::warn!(id = %record.memory.id, "Skipping zero-embedding record");
                    continue;
                }
            }

            let draft = MemoryDraft {
                text: record.memory.text,
                source: record.memory.source,
                session_id: record.memory.session_id,
                importance: record.memory.importance.clamp(0.0, 1.0),
                tags: record.memory.tags,
                collection: record.memory.collection,
                timestamp: Some(record.memory.ts),
            };
            let (id, was_new) = self.insert_memory(&draft, &embedding)?;
            if id != record.memory.id {
                tracing::warn!(
                    exported = %record.memory.id,
                    derived = %id,
                    "Imported record re-derived a different id (fields were edited?)"
                );
            }
            if was_new {
                inserted += 1;
            }
        }

        tracing::info!(path = %path.display(), inserted, "Import complete");
        Ok(inserted)
    }
}

/// Reduce free text to a safe FTS5 MATCH expression: alphanumeric tokens,
/// quoted, OR-joined. Returns `None` when nothing tokenizable remains.
fn sanitize_match_query(query: &str) -> Option<String> {
    let tokens: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .take(MAX_FTS_TOKENS)
        .map(|t| format!("\"{}\"", t.to_lowercase()))
        .collect();
    if tokens.is_empty() {
        None
    } else {
        Some(tokens.join(" OR "))
    }
}
