//! Store helper types, validation, and embedding serialization

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, Instant};

use blake2::{Blake2b512, Digest};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::EMBEDDING_DIM;

/// Schema version for database migrations
///
/// Increment this when changing the database schema. `Store::open()` checks it
/// against the stored version and migrates or fails.
///
/// History:
/// - v1: initial (memories + memories_fts)
/// - v2: collection/ts covering index, created_at column
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Maximum text size in bytes after NFC normalisation
pub const MAX_TEXT_BYTES: usize = 100_000;
/// Maximum query size in bytes
pub const MAX_QUERY_BYTES: usize = 1_000;
/// Maximum tags per memory
pub const MAX_TAGS: usize = 50;
/// Maximum bytes per tag
pub const MAX_TAG_BYTES: usize = 64;
/// Maximum bytes for source / session_id identifiers
pub const MAX_IDENT_BYTES: usize = 128;

pub const DEFAULT_SOURCE: &str = "unknown";
pub const DEFAULT_SESSION: &str = "default";
pub const DEFAULT_COLLECTION: &str = "knowledge";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Runtime error: {0}")]
    Runtime(String),
    #[error("Invalid input: {0}")]
    Validation(String),
    #[error("Database is corrupt: {0}. Writes are disabled; call recover() or replace the file.")]
    Corrupt(String),
    #[error("Database is locked (retries exhausted)")]
    Locked,
    #[error("Database is in read-only mode after a failed integrity check")]
    ReadOnly,
    #[error("Schema version mismatch: database is v{0}, this build expects v{1}")]
    SchemaMismatch(i32, i32),
    #[error("Database created by a newer memento version (schema v{0}). Please upgrade.")]
    SchemaNewerThanBuild(i32),
    #[error("No migration path from schema v{0} to v{1}")]
    MigrationNotSupported(i32, i32),
    #[error("No backup available to recover from")]
    NoBackup,
}

/// 128-bit memory identifier.
///
/// Derived as `blake2b(text \x00 source \x00 session \x00 ts_le)` truncated to
/// 16 bytes, so the same record inserted twice yields the same id and
/// `remember` can be idempotent.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MemoryId(pub [u8; 16]);

impl MemoryId {
    /// Derive the id from the normalised record fields.
    ///
    /// `text` must already be NFC-normalised (see [`normalize_text`]).
    pub fn derive(text: &str, source: &str, session_id: &str, ts: i64) -> Self {
        let mut hasher = Blake2b512::new();
        hasher.update(text.as_bytes());
        hasher.update([0u8]);
        hasher.update(source.as_bytes());
        hasher.update([0u8]);
        hasher.update(session_id.as_bytes());
        hasher.update([0u8]);
        hasher.update(ts.to_le_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        MemoryId(id)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() != 16 {
            return None;
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(bytes);
        Some(MemoryId(id))
    }

    pub fn to_hex(&self) -> String {
        let mut s = String::with_capacity(32);
        for b in &self.0 {
            use fmt::Write;
            let _ = write!(s, "{:02x}", b);
        }
        s
    }
}

impl fmt::Display for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for MemoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MemoryId({})", self.to_hex())
    }
}

impl FromStr for MemoryId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != 32 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(format!("invalid memory id '{}': expected 32 hex chars", s));
        }
        let mut id = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks_exact(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(|e| e.to_string())?;
            id[i] = u8::from_str_radix(hex, 16).map_err(|e| e.to_string())?;
        }
        Ok(MemoryId(id))
    }
}

impl Serialize for MemoryId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for MemoryId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// An atomic memory record (metadata + text, embedding stored separately).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    /// Stable 128-bit identifier
    pub id: MemoryId,
    /// NFC-normalised text
    pub text: String,
    /// Seconds since epoch, monotonic per writer
    pub ts: i64,
    /// Origin identifier (e.g. "cli", "agent-7")
    pub source: String,
    /// Conversation / session identifier
    pub session_id: String,
    /// Relevance weight in [0, 1]
    pub importance: f32,
    /// Canonicalised tag set (sorted, deduplicated)
    pub tags: Vec<String>,
    /// Partition key
    pub collection: String,
}

/// Options for `remember`. Unset fields take the §3 defaults.
#[derive(Debug, Clone, Default)]
pub struct RememberOptions {
    pub collection: Option<String>,
    pub importance: Option<f32>,
    pub source: Option<String>,
    pub session_id: Option<String>,
    pub tags: Vec<String>,
    /// Explicit timestamp (seconds since epoch). Used by import; normal
    /// writes take the store clock.
    pub timestamp: Option<i64>,
}

/// A fully validated record ready for insertion.
///
/// Produced by [`validate_draft`]; the id is derived from the normalised
/// fields so validation and id derivation cannot drift apart.
#[derive(Debug, Clone)]
pub struct MemoryDraft {
    pub text: String,
    pub source: String,
    pub session_id: String,
    pub importance: f32,
    pub tags: Vec<String>,
    pub collection: String,
    pub timestamp: Option<i64>,
}

/// One exported row: the record plus its embedding, round-trippable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExportRecord {
    #[serde(flatten)]
    pub memory: Memory,
    /// 384 floats, unit-normalised
    pub embedding: Vec<f32>,
}

/// Store statistics
#[derive(Debug, Clone)]
pub struct StoreStats {
    /// Total memory rows
    pub total_memories: u64,
    /// Row count per collection
    pub by_collection: HashMap<String, u64>,
    /// Vectors held by the in-memory index
    pub total_vectors: u64,
    /// Index backend currently answering queries ("brute-force" or "hnsw")
    pub index_backend: &'static str,
    /// Database file size in bytes
    pub db_size_bytes: u64,
    /// ISO 8601 timestamp when the database was created
    pub created_at: String,
    /// Database schema version
    pub schema_version: i32,
}

// ============ Text Normalisation & Validation ============

/// NFC-normalise text. Applied before hashing and storage so that
/// canonically-equivalent Unicode sequences map to the same record.
pub fn normalize_text(text: &str) -> String {
    text.nfc().collect()
}

/// Validate and canonicalise a remember request.
///
/// - text: NFC-normalised; rejected if empty after whitespace trim or over
///   100 000 bytes
/// - importance: clamped to [0, 1] rather than rejected
/// - tags: at most 50, each at most 64 bytes of ASCII `[A-Za-z0-9_-]`;
///   duplicates collapsed, order-insensitive (stored sorted)
/// - source / session_id: at most 128 bytes each
pub fn validate_draft(text: &str, opts: &RememberOptions) -> Result<MemoryDraft, StoreError> {
    let text = normalize_text(text);
    if text.trim().is_empty() {
        return Err(StoreError::Validation(
            "text is empty after whitespace trim".into(),
        ));
    }
    if text.len() > MAX_TEXT_BYTES {
        return Err(StoreError::Validation(format!(
            "text is {} bytes, maximum is {}",
            text.len(),
            MAX_TEXT_BYTES
        )));
    }

    let source = opts.source.clone().unwrap_or_else(|| DEFAULT_SOURCE.into());
    if source.len() > MAX_IDENT_BYTES {
        return Err(StoreError::Validation(format!(
            "source is {} bytes, maximum is {}",
            source.len(),
            MAX_IDENT_BYTES
        )));
    }
    let session_id = opts
        .session_id
        .clone()
        .unwrap_or_else(|| DEFAULT_SESSION.into());
    if session_id.len() > MAX_IDENT_BYTES {
        return Err(StoreError::Validation(format!(
            "session_id is {} bytes, maximum is {}",
            session_id.len(),
            MAX_IDENT_BYTES
        )));
    }

    let tags = canonicalize_tags(&opts.tags)?;

    // Out-of-range importance is clamped, not rejected
    let importance = opts.importance.unwrap_or(0.5);
    let importance = if importance.is_finite() {
        importance.clamp(0.0, 1.0)
    } else {
        0.5
    };

    Ok(MemoryDraft {
        text,
        source,
        session_id,
        importance,
        tags,
        collection: opts
            .collection
            .clone()
            .unwrap_or_else(|| DEFAULT_COLLECTION.into()),
        timestamp: opts.timestamp,
    })
}

/// Validate a query string (recall input).
pub fn validate_query(query: &str) -> Result<String, StoreError> {
    let query = normalize_text(query);
    if query.trim().is_empty() {
        return Err(StoreError::Validation("query is empty".into()));
    }
    if query.len() > MAX_QUERY_BYTES {
        return Err(StoreError::Validation(format!(
            "query is {} bytes, maximum is {}",
            query.len(),
            MAX_QUERY_BYTES
        )));
    }
    Ok(query)
}

static TAG_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new("^[A-Za-z0-9_-]+$").expect("tag pattern is valid"));

/// Validate tags and collapse to a sorted, deduplicated set.
pub fn canonicalize_tags(tags: &[String]) -> Result<Vec<String>, StoreError> {
    if tags.len() > MAX_TAGS {
        return Err(StoreError::Validation(format!(
            "{} tags given, maximum is {}",
            tags.len(),
            MAX_TAGS
        )));
    }
    let mut canonical: Vec<String> = Vec::with_capacity(tags.len());
    for tag in tags {
        if tag.is_empty() {
            return Err(StoreError::Validation("empty tag".into()));
        }
        if tag.len() > MAX_TAG_BYTES {
            return Err(StoreError::Validation(format!(
                "tag '{}' is {} bytes, maximum is {}",
                tag,
                tag.len(),
                MAX_TAG_BYTES
            )));
        }
        if !TAG_RE.is_match(tag) {
            return Err(StoreError::Validation(format!(
                "tag '{}' contains characters outside [A-Za-z0-9_-]",
                tag
            )));
        }
        if !canonical.iter().any(|t| t == tag) {
            canonical.push(tag.clone());
        }
    }
    canonical.sort();
    Ok(canonical)
}

// ============ Embedding Serialization ============

/// Convert an embedding to little-endian bytes for storage (1536 bytes).
///
/// Returns a Validation error on dimension mismatch - storing a wrong-sized
/// embedding would corrupt the index.
pub fn embedding_to_bytes(embedding: &[f32]) -> Result<Vec<u8>, StoreError> {
    if embedding.len() != EMBEDDING_DIM {
        return Err(StoreError::Validation(format!(
            "embedding has {} dimensions, expected {}",
            embedding.len(),
            EMBEDDING_DIM
        )));
    }
    Ok(embedding.iter().flat_map(|f| f.to_le_bytes()).collect())
}

/// Zero-copy view of embedding bytes as an f32 slice (for hot paths).
///
/// Returns None if byte length doesn't match the expected embedding size.
/// Uses trace level logging to avoid impacting search performance.
pub fn embedding_slice(bytes: &[u8]) -> Option<&[f32]> {
    const EXPECTED_BYTES: usize = EMBEDDING_DIM * 4;
    if bytes.len() != EXPECTED_BYTES {
        tracing::trace!(
            expected = EXPECTED_BYTES,
            actual = bytes.len(),
            "Embedding byte length mismatch, skipping"
        );
        return None;
    }
    bytemuck::try_cast_slice(bytes).ok()
}

/// Convert embedding bytes to an owned Vec (when ownership is needed).
pub fn bytes_to_embedding(bytes: &[u8]) -> Option<Vec<f32>> {
    embedding_slice(bytes).map(|s| s.to_vec())
}

// ============ Rate Limiting ============

/// Per-store write throttle. Default configuration is "no throttle";
/// tests can instantiate independent stores with independent buckets.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    /// Bucket capacity (burst size)
    pub capacity: u32,
    /// Tokens added per second
    pub refill_per_sec: f64,
}

/// Token bucket guarding the write path.
pub(crate) struct TokenBucket {
    limit: RateLimit,
    state: std::sync::Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(limit: RateLimit) -> Self {
        Self {
            limit,
            state: std::sync::Mutex::new(BucketState {
                tokens: limit.capacity as f64,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token, sleeping until one is available.
    pub fn acquire(&self) {
        loop {
            let wait = {
                let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
                let elapsed = state.last_refill.elapsed().as_secs_f64();
                state.tokens = (state.tokens + elapsed * self.limit.refill_per_sec)
                    .min(self.limit.capacity as f64);
                state.last_refill = Instant::now();
                if state.tokens >= 1.0 {
                    state.tokens -= 1.0;
                    return;
                }
                let deficit = 1.0 - state.tokens;
                Duration::from_secs_f64(deficit / self.limit.refill_per_sec.max(f64::MIN_POSITIVE))
            };
            tracing::debug!(wait_ms = wait.as_millis() as u64, "Write rate limited");
            std::thread::sleep(wait);
        }
    }
}
