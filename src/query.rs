//! Recall pipeline: filters, time windows, candidate expansion, ranking
//!
//! The pipeline embeds the query, asks the vector index for an expanded
//! candidate set, hydrates rows, applies the metadata predicate in memory,
//! and ranks. Scoring stays dense-vector-driven; `text_like` and friends are
//! post-filters, corrected for by fetching `k x F` candidates (with one
//! retry at a larger F when the filtered set comes up short).
//!
//! A wall-clock [`Deadline`] is threaded through every stage.

use std::collections::HashMap;

use serde_json::Value;

use crate::deadline::Deadline;
use crate::embedder::Embedder;
use crate::engine::EngineError;
use crate::store::{validate_query, Memory, Store};

/// Default result count.
pub const DEFAULT_TOPK: usize = 5;
/// Default recall deadline in milliseconds (0 = unbounded).
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
/// Default candidate expansion factor under active filters.
pub const DEFAULT_FILTER_EXPANSION: u32 = 3;
/// Hard cap on the expansion factor.
const MAX_FILTER_EXPANSION: u32 = 20;
/// Expansion factor for the single retry when filtering starves the result.
const RETRY_FILTER_EXPANSION: u32 = 10;

/// Options for `recall` / `batch_recall`.
#[derive(Debug, Clone)]
pub struct RecallOptions {
    /// Collection to search (default "knowledge").
    pub collection: Option<String>,
    /// Number of results to return.
    pub topk: usize,
    /// Metadata filters; recognised keys only (see [`Filters`]).
    pub filters: Option<HashMap<String, Value>>,
    /// Lower bound on importance.
    pub min_importance: Option<f32>,
    /// Inclusive lower time bound: ISO-8601 or relative ("7d", "24h", "30m").
    pub since: Option<String>,
    /// Exclusive upper time bound, same formats.
    pub before: Option<String>,
    /// Wall-clock deadline in milliseconds. `None` takes the configured
    /// default; `Some(0)` disables the deadline.
    pub timeout_ms: Option<u64>,
}

impl Default for RecallOptions {
    fn default() -> Self {
        Self {
            collection: None,
            topk: DEFAULT_TOPK,
            filters: None,
            min_importance: None,
            since: None,
            before: None,
            timeout_ms: None,
        }
    }
}

/// A scored recall hit.
///
/// All score components are explicit fields; nothing is grafted on after the
/// fact. `score` is the ranking key. `bm25_score` and `hybrid_score` are
/// populated only on paths where lexical search contributed.
#[derive(Debug, Clone)]
pub struct RecallResult {
    pub memory: Memory,
    /// Final ranking score in [-1, 1]
    pub score: f32,
    /// Dense cosine similarity component
    pub vector_score: f32,
    /// BM25 component, when lexical search ran
    pub bm25_score: Option<f32>,
    /// Combined score, when both components ran
    pub hybrid_score: Option<f32>,
}

/// Compiled, validated metadata predicate.
#[derive(Debug, Clone, Default)]
pub(crate) struct Filters {
    collection: String,
    tags: Option<Vec<String>>,
    source: Option<String>,
    session_id: Option<String>,
    text_like: Option<String>,
    min_importance: Option<f32>,
    since_ts: Option<i64>,
    before_ts: Option<i64>,
}

impl Filters {
    /// Parse and validate recall options into a predicate.
    ///
    /// The filter key set is closed; any unrecognised key is a validation
    /// error rather than a silently ignored no-op.
    pub fn compile(opts: &RecallOptions) -> Result<Self, EngineError> {
        let now = chrono::Utc::now();
        let mut filters = Filters {
            collection: opts
                .collection
                .clone()
                .unwrap_or_else(|| crate::store::DEFAULT_COLLECTION.to_string()),
            min_importance: opts.min_importance,
            since_ts: opts
                .since
                .as_deref()
                .map(|s| parse_time_bound(s, now))
                .transpose()?,
            before_ts: opts
                .before
                .as_deref()
                .map(|s| parse_time_bound(s, now))
                .transpose()?,
            ..Default::default()
        };

        let Some(raw) = &opts.filters else {
            return Ok(filters);
        };

        for (key, value) in raw {
            match key.as_str() {
                "tags" => {
                    let tags = match value {
                        Value::Array(items) => items
                            .iter()
                            .map(|v| {
                                v.as_str().map(str::to_string).ok_or_else(|| {
                                    EngineError::Validation(
                                        "filter 'tags' must be an array of strings".into(),
                                    )
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                        Value::String(s) => vec![s.clone()],
                        _ => {
                            return Err(EngineError::Validation(
                                "filter 'tags' must be an array of strings".into(),
                            ))
                        }
                    };
                    filters.tags = Some(tags);
                }
                "source" => filters.source = Some(expect_string(key, value)?),
                "session_id" => filters.session_id = Some(expect_string(key, value)?),
                "text_like" => {
                    filters.text_like = Some(expect_string(key, value)?.to_lowercase())
                }
                "min_importance" => {
                    let v = value.as_f64().ok_or_else(|| {
                        EngineError::Validation("filter 'min_importance' must be a number".into())
                    })?;
                    // The more restrictive of the option and the filter wins
                    let v = v as f32;
                    filters.min_importance =
                        Some(filters.min_importance.map_or(v, |prev| prev.max(v)));
                }
                "since" => {
                    let ts = parse_time_bound(&expect_string(key, value)?, now)?;
                    filters.since_ts = Some(filters.since_ts.map_or(ts, |prev| prev.max(ts)));
                }
                "before" => {
                    let ts = parse_time_bound(&expect_string(key, value)?, now)?;
                    filters.before_ts = Some(filters.before_ts.map_or(ts, |prev| prev.min(ts)));
                }
                other => {
                    return Err(EngineError::Validation(format!(
                        "unrecognised filter key '{}'",
                        other
                    )))
                }
            }
        }

        Ok(filters)
    }

    /// Whether anything beyond the collection scope is active (drives
    /// candidate expansion).
    fn is_selective(&self) -> bool {
        self.tags.is_some()
            || self.source.is_some()
            || self.session_id.is_some()
            || self.text_like.is_some()
            || self.min_importance.is_some()
            || self.since_ts.is_some()
            || self.before_ts.is_some()
    }

    /// The composed predicate: collection AND time window AND filters.
    pub fn matches(&self, memory: &Memory) -> bool {
        if memory.collection != self.collection {
            return false;
        }
        if let Some(since) = self.since_ts {
            if memory.ts < since {
                return false;
            }
        }
        if let Some(before) = self.before_ts {
            if memory.ts >= before {
                return false;
            }
        }
        if let Some(min) = self.min_importance {
            if memory.importance < min {
                return false;
            }
        }
        if let Some(source) = &self.source {
            if &memory.source != source {
                return false;
            }
        }
        if let Some(session) = &self.session_id {
            if &memory.session_id != session {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            // Match-any semantics
            if !tags.iter().any(|t| memory.tags.iter().any(|m| m == t)) {
                return false;
            }
        }
        if let Some(needle) = &self.text_like {
            if !memory.text.to_lowercase().contains(needle) {
                return false;
            }
        }
        true
    }
}

fn expect_string(key: &str, value: &Value) -> Result<String, EngineError> {
    value.as_str().map(str::to_string).ok_or_else(|| {
        EngineError::Validation(format!("filter '{}' must be a string", key))
    })
}

/// Parse a time bound: RFC 3339, `YYYY-MM-DD[THH:MM:SS]`, or a relative
/// duration like "7d" / "24h" / "30m" subtracted from now.
pub(crate) fn parse_time_bound(
    s: &str,
    now: chrono::DateTime<chrono::Utc>,
) -> Result<i64, EngineError> {
    let s = s.trim();
    if s.is_empty() {
        return Err(EngineError::Validation("empty time bound".into()));
    }

    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt.and_utc().timestamp());
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        if let Some(dt) = date.and_hms_opt(0, 0, 0) {
            return Ok(dt.and_utc().timestamp());
        }
    }

    let duration = parse_duration(s)?;
    Ok((now - duration).timestamp())
}

/// Parse a relative duration: digits followed by `d`, `h`, `m`, or `s`,
/// combinable ("1d12h"). A bare number means minutes.
pub(crate) fn parse_duration(s: &str) -> Result<chrono::Duration, EngineError> {
    let s = s.trim().to_lowercase();
    let mut total_secs: i64 = 0;
    let mut current_num = String::new();

    let push_unit = |num: &str, secs_per_unit: i64| -> Result<i64, EngineError> {
        let n: i64 = num.parse().map_err(|_| {
            EngineError::Validation(format!(
                "invalid duration '{}': '{}' is not a valid number",
                s, num
            ))
        })?;
        n.checked_mul(secs_per_unit)
            .ok_or_else(|| EngineError::Validation(format!("duration overflow in '{}'", s)))
    };

    for c in s.chars() {
        if c.is_ascii_digit() {
            current_num.push(c);
        } else if let Some(secs_per_unit) = match c {
            'd' => Some(86_400),
            'h' => Some(3_600),
            'm' => Some(60),
            's' => Some(1),
            _ => None,
        } {
            if current_num.is_empty() {
                return Err(EngineError::Validation(format!(
                    "invalid duration '{}': missing number before '{}'",
                    s, c
                )));
            }
            total_secs = total_secs
                .checked_add(push_unit(&current_num, secs_per_unit)?)
                .ok_or_else(|| {
                    EngineError::Validation(format!("duration overflow in '{}'", s))
                })?;
            current_num.clear();
        } else if !c.is_whitespace() {
            return Err(EngineError::Validation(format!(
                "invalid duration '{}': unexpected character '{}'. Use formats like '30m', '24h', '7d'",
                s, c
            )));
        }
    }

    // Bare number: minutes
    if !current_num.is_empty() {
        total_secs = total_secs
            .checked_add(push_unit(&current_num, 60)?)
            .ok_or_else(|| EngineError::Validation(format!("duration overflow in '{}'", s)))?;
    }

    if total_secs <= 0 {
        return Err(EngineError::Validation(format!(
            "invalid duration '{}': must be positive",
            s
        )));
    }
    Ok(chrono::Duration::seconds(total_secs))
}

// ============ Pipeline ============

/// One recall: embed, search, hydrate, filter, rank.
pub(crate) fn recall(
    store: &Store,
    embedder: &Embedder,
    query: &str,
    opts: &RecallOptions,
    expansion: u32,
    default_timeout_ms: u64,
) -> Result<Vec<RecallResult>, EngineError> {
    let query = validate_query(query)?;
    let filters = Filters::compile(opts)?;
    let deadline = Deadline::after_ms(opts.timeout_ms.unwrap_or(default_timeout_ms));

    // An empty store answers immediately, embedder state notwithstanding
    if store.vector_count() == 0 {
        return Ok(Vec::new());
    }

    deadline.check()?;
    let embedding = embedder.embed(&query)?;
    deadline.check()?;

    rank_for_embedding(store, embedding.as_slice(), &filters, opts, expansion, &deadline)
}

/// Order-preserving batched recall; queries are embedded as one batch so the
/// encoder cost amortises.
pub(crate) fn batch_recall(
    store: &Store,
    embedder: &Embedder,
    queries: &[String],
    opts: &RecallOptions,
    expansion: u32,
    default_timeout_ms: u64,
) -> Result<Vec<Vec<RecallResult>>, EngineError> {
    if queries.is_empty() {
        return Ok(Vec::new());
    }
    let normalized: Vec<String> = queries
        .iter()
        .map(|q| validate_query(q))
        .collect::<Result<_, _>>()?;
    let filters = Filters::compile(opts)?;
    let deadline = Deadline::after_ms(opts.timeout_ms.unwrap_or(default_timeout_ms));

    if store.vector_count() == 0 {
        return Ok(vec![Vec::new(); queries.len()]);
    }

    deadline.check()?;
    let embeddings = embedder.embed_batch(&normalized)?;
    deadline.check()?;

    embeddings
        .iter()
        .map(|embedding| {
            rank_for_embedding(store, embedding.as_slice(), &filters, opts, expansion, &deadline)
        })
        .collect()
}

fn rank_for_embedding(
    store: &Store,
    query_vector: &[f32],
    filters: &Filters,
    opts: &RecallOptions,
    expansion: u32,
    deadline: &Deadline,
) -> Result<Vec<RecallResult>, EngineError> {
    if opts.topk == 0 {
        return Ok(Vec::new());
    }

    let factor = if filters.is_selective() {
        expansion.clamp(1, MAX_FILTER_EXPANSION)
    } else {
        // Collection scoping alone still discards candidates
        expansion.clamp(1, MAX_FILTER_EXPANSION).min(3)
    };

    let mut results = candidates_pass(store, query_vector, filters, opts.topk, factor, deadline)?;

    // Filtered set came up short: one retry with a wider net
    if results.len() < opts.topk && filters.is_selective() && factor < RETRY_FILTER_EXPANSION {
        tracing::debug!(
            got = results.len(),
            want = opts.topk,
            "Filter starved the candidate set, retrying with wider expansion"
        );
        results = candidates_pass(
            store,
            query_vector,
            filters,
            opts.topk,
            RETRY_FILTER_EXPANSION,
            deadline,
        )?;
    }

    // Rank: score desc, ts desc, id asc
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.memory.ts.cmp(&a.memory.ts))
            .then_with(|| a.memory.id.cmp(&b.memory.id))
    });
    results.truncate(opts.topk);
    Ok(results)
}

fn candidates_pass(
    store: &Store,
    query_vector: &[f32],
    filters: &Filters,
    topk: usize,
    factor: u32,
    deadline: &Deadline,
) -> Result<Vec<RecallResult>, EngineError> {
    let fetch = topk.saturating_mul(factor as usize);
    let candidates = store.vector_search(query_vector, fetch, deadline)?;
    deadline.check()?;

    let ids: Vec<_> = candidates.iter().map(|c| c.id).collect();
    let mut rows = store.hydrate(&ids)?;
    deadline.check()?;

    let mut results = Vec::with_capacity(candidates.len().min(topk * 2));
    for candidate in candidates {
        let Some(memory) = rows.remove(&candidate.id) else {
            // Index ahead of a just-deleted row; hydration is the filter
            continue;
        };
        if !filters.matches(&memory) {
            continue;
        }
        debug_assert!(
            candidate.score.abs() <= 1.0 + 1e-4,
            "score outside [-1, 1]: stored vector lost unit norm"
        );
        results.push(RecallResult {
            memory,
            score: candidate.score,
            vector_score: candidate.score,
            bm25_score: None,
            hybrid_score: None,
        });
    }
    Ok(results)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryId;

    fn memory(collection: &str, ts: i64) -> Memory {
        Memory {
            id: MemoryId::derive("t", "s", "sess", ts),
            text: "Deploy the new model".into(),
            ts,
            source: "cli".into(),
            session_id: "default".into(),
            importance: 0.5,
            tags: vec!["deploy".into(), "todo".into()],
            collection: collection.into(),
        }
    }

    fn compile(opts: &RecallOptions) -> Filters {
        Filters::compile(opts).unwrap()
    }

    #[test]
    fn test_unknown_filter_key_rejected() {
        let mut raw = HashMap::new();
        raw.insert("sourc".to_string(), Value::String("cli".into()));
        let opts = RecallOptions {
            filters: Some(raw),
            ..Default::default()
        };
        assert!(matches!(
            Filters::compile(&opts),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn test_collection_scoping() {
        let filters = compile(&RecallOptions::default());
        assert!(filters.matches(&memory("knowledge", 100)));
        assert!(!filters.matches(&memory("scratch", 100)));
    }

    #[test]
    fn test_tags_match_any() {
        let mut raw = HashMap::new();
        raw.insert(
            "tags".to_string(),
            serde_json::json!(["missing", "deploy"]),
        );
        let filters = compile(&RecallOptions {
            filters: Some(raw),
            ..Default::default()
        });
        assert!(filters.matches(&memory("knowledge", 100)));

        let mut raw = HashMap::new();
        raw.insert("tags".to_string(), serde_json::json!(["absent"]));
        let filters = compile(&RecallOptions {
            filters: Some(raw),
            ..Default::default()
        });
        assert!(!filters.matches(&memory("knowledge", 100)));
    }

    #[test]
    fn test_text_like_case_insensitive() {
        let mut raw = HashMap::new();
        raw.insert("text_like".to_string(), Value::String("DEPLOY".into()));
        let filters = compile(&RecallOptions {
            filters: Some(raw),
            ..Default::default()
        });
        assert!(filters.matches(&memory("knowledge", 100)));
    }

    #[test]
    fn test_source_equality_case_sensitive() {
        let mut raw = HashMap::new();
        raw.insert("source".to_string(), Value::String("CLI".into()));
        let filters = compile(&RecallOptions {
            filters: Some(raw),
            ..Default::default()
        });
        assert!(!filters.matches(&memory("knowledge", 100)));
    }

    #[test]
    fn test_time_window() {
        let filters = compile(&RecallOptions {
            since: Some("2020-01-01".into()),
            before: Some("2030-01-01".into()),
            ..Default::default()
        });
        let early = chrono::NaiveDate::from_ymd_opt(2019, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        let inside = chrono::NaiveDate::from_ymd_opt(2025, 6, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
            .timestamp();
        assert!(!filters.matches(&memory("knowledge", early)));
        assert!(filters.matches(&memory("knowledge", inside)));
    }

    #[test]
    fn test_min_importance_takes_more_restrictive() {
        let mut raw = HashMap::new();
        raw.insert("min_importance".to_string(), serde_json::json!(0.8));
        let filters = compile(&RecallOptions {
            min_importance: Some(0.3),
            filters: Some(raw),
            ..Default::default()
        });
        assert_eq!(filters.min_importance, Some(0.8));
        assert!(!filters.matches(&memory("knowledge", 100))); // importance 0.5
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(
            parse_duration("30m").unwrap(),
            chrono::Duration::minutes(30)
        );
        assert_eq!(parse_duration("24h").unwrap(), chrono::Duration::hours(24));
        assert_eq!(parse_duration("7d").unwrap(), chrono::Duration::days(7));
        assert_eq!(parse_duration("90s").unwrap(), chrono::Duration::seconds(90));
        assert_eq!(
            parse_duration("1d12h").unwrap(),
            chrono::Duration::hours(36)
        );
        // Bare number means minutes
        assert_eq!(parse_duration("15").unwrap(), chrono::Duration::minutes(15));
    }

    #[test]
    fn test_parse_duration_rejects_garbage() {
        assert!(parse_duration("h").is_err());
        assert!(parse_duration("1w").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("-5m").is_err());
    }

    #[test]
    fn test_parse_time_bound_absolute() {
        let now = chrono::Utc::now();
        let ts = parse_time_bound("2024-03-01T12:00:00Z", now).unwrap();
        assert_eq!(ts, 1_709_294_400);
        let ts_date = parse_time_bound("2024-03-01", now).unwrap();
        assert_eq!(ts_date, 1_709_251_200);
    }

    #[test]
    fn test_parse_time_bound_relative() {
        let now = chrono::Utc::now();
        let ts = parse_time_bound("24h", now).unwrap();
        let expected = (now - chrono::Duration::hours(24)).timestamp();
        assert!((ts - expected).abs() <= 1);
    }
}
