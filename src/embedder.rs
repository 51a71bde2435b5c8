//! Embedding service: encoder lifecycle + two-tier cache glue
//!
//! The embedder owns the encoder session and the cache. The encoder is
//! loaded by a background warm-up worker spawned at construction; `embed`
//! blocks on readiness with a bounded wait. An idle timer drops the encoder
//! after a quiet period and the next call re-warms it.
//!
//! ## Lifecycle
//!
//! States: `Cold -> Loading -> Ready -> Unloading -> Cold`.
//! - `Cold -construct/embed-> Loading` (a loader thread is spawned)
//! - `Loading -load_ok-> Ready`, `Loading -load_err-> Cold` (error surfaced
//!   to waiters)
//! - `Ready -idle_timeout-> Unloading -> Cold`; calls arriving during
//!   `Unloading` wait, observe `Cold`, and trigger the next `Loading`.
//!
//! Concurrent misses for the same content key are deduplicated: N callers
//! embedding the same text cause exactly one encoder call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use blake2::{Blake2b512, Digest};
use thiserror::Error;
use unicode_normalization::UnicodeNormalization;

use crate::cache::{CacheKey, CacheStats, EmbedCache};
use crate::encoder::{EncoderError, OnnxEncoder};
use crate::math::l2_normalize;
use crate::EMBEDDING_DIM;

/// Default bounded wait for encoder readiness.
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_secs(30);
/// Default idle period before the encoder is dropped.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Error, Debug, Clone)]
pub enum EmbedderError {
    #[error("Encoder error: {0}")]
    Encoder(String),
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
    #[error("Encoder unavailable: {0}")]
    Unavailable(String),
    #[error("Text cannot be empty")]
    EmptyText,
}

impl From<EncoderError> for EmbedderError {
    fn from(e: EncoderError) -> Self {
        match e {
            EncoderError::Tokenizer(msg) => EmbedderError::Tokenizer(msg),
            other => EmbedderError::Encoder(other.to_string()),
        }
    }
}

/// A 384-dimensional L2-normalized embedding vector.
///
/// Vectors produced by the deterministic fallback path (encoder permanently
/// unavailable, caller opted in) are tagged and never written to the
/// persistent cache.
#[derive(Debug, Clone)]
pub struct Embedding {
    data: Vec<f32>,
    fallback: bool,
}

impl Embedding {
    pub(crate) fn encoded(data: Vec<f32>) -> Self {
        Self {
            data,
            fallback: false,
        }
    }

    pub(crate) fn from_fallback(data: Vec<f32>) -> Self {
        Self {
            data,
            fallback: true,
        }
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// True when this vector came from the hash-expansion fallback rather
    /// than the encoder.
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

/// Embedder configuration.
#[derive(Debug, Clone)]
pub struct EmbedderOptions {
    /// Directory holding `model.onnx` (or `onnx/model.onnx`) and
    /// `tokenizer.json`. `None` fetches from HuggingFace Hub.
    pub model_dir: Option<PathBuf>,
    /// Bounded wait for encoder readiness.
    pub warmup_timeout: Duration,
    /// Idle period after which the encoder is unloaded.
    pub idle_timeout: Duration,
    /// Produce deterministic hash-expansion vectors when the encoder cannot
    /// be loaded, instead of surfacing `Unavailable`.
    pub allow_fallback: bool,
    /// Default cache-bypass flag for `embed` (per-call override available).
    pub cache_bypass: bool,
}

impl Default for EmbedderOptions {
    fn default() -> Self {
        Self {
            model_dir: None,
            warmup_timeout: DEFAULT_WARMUP_TIMEOUT,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            allow_fallback: false,
            cache_bypass: false,
        }
    }
}

enum EncoderState {
    Cold,
    Loading,
    Ready(Arc<OnnxEncoder>),
    Unloading,
}

impl EncoderState {
    fn name(&self) -> &'static str {
        match self {
            EncoderState::Cold => "cold",
            EncoderState::Loading => "loading",
            EncoderState::Ready(_) => "ready",
            EncoderState::Unloading => "unloading",
        }
    }
}

struct StateCell {
    state: EncoderState,
    /// Last load failure, surfaced to waiters while state is `Cold`.
    last_error: Option<String>,
    last_used: Instant,
}

struct Shared {
    cell: Mutex<StateCell>,
    cond: Condvar,
}

/// Result slot for deduplicated in-flight encodes.
struct Inflight {
    result: Mutex<Option<Result<Vec<f32>, EmbedderError>>>,
    cond: Condvar,
    /// True when the vector came from the fallback path (not cacheable).
    fallback: Mutex<bool>,
}

impl Inflight {
    fn new() -> Self {
        Self {
            result: Mutex::new(None),
            cond: Condvar::new(),
            fallback: Mutex::new(false),
        }
    }

    fn publish(&self, result: Result<Vec<f32>, EmbedderError>, fallback: bool) {
        {
            let mut f = self.fallback.lock().unwrap_or_else(|p| p.into_inner());
            *f = fallback;
        }
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        *slot = Some(result);
        self.cond.notify_all();
    }

    fn wait(&self) -> (Result<Vec<f32>, EmbedderError>, bool) {
        let mut slot = self.result.lock().unwrap_or_else(|p| p.into_inner());
        while slot.is_none() {
            slot = self
                .cond
                .wait(slot)
                .unwrap_or_else(|p| p.into_inner());
        }
        let result = slot.clone().expect("checked above");
        let fallback = *self.fallback.lock().unwrap_or_else(|p| p.into_inner());
        (result, fallback)
    }
}

/// Text embedding service with background warm-up and idle unload.
///
/// # Example
///
/// ```no_run
/// use memento::{EmbedCache, Embedder, EmbedderOptions};
///
/// let cache = EmbedCache::in_memory(1000)?;
/// let embedder = Embedder::new(EmbedderOptions::default(), cache);
/// let embedding = embedder.embed("parse configuration file")?;
/// assert_eq!(embedding.len(), 384);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct Embedder {
    shared: Arc<Shared>,
    opts: EmbedderOptions,
    cache: EmbedCache,
    inflight: Mutex<HashMap<CacheKey, Arc<Inflight>>>,
    encoder_calls: AtomicU64,
    /// Dropping the sender stops the idle-timer thread.
    _idle_stop: crossbeam_channel::Sender<()>,
}

impl Embedder {
    /// Construct the embedder and start warming the encoder in the
    /// background.
    pub fn new(opts: EmbedderOptions, cache: EmbedCache) -> Self {
        let shared = Arc::new(Shared {
            cell: Mutex::new(StateCell {
                state: EncoderState::Cold,
                last_error: None,
                last_used: Instant::now(),
            }),
            cond: Condvar::new(),
        });

        let (stop_tx, stop_rx) = crossbeam_channel::bounded::<()>(1);
        spawn_idle_worker(Arc::clone(&shared), stop_rx, opts.idle_timeout);

        let embedder = Self {
            shared,
            opts,
            cache,
            inflight: Mutex::new(HashMap::new()),
            encoder_calls: AtomicU64::new(0),
            _idle_stop: stop_tx,
        };

        // Background warm-up: don't make construction block on model load
        {
            let mut cell = embedder
                .shared
                .cell
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            embedder.start_loading(&mut cell);
        }

        embedder
    }

    /// Whether the encoder is loaded and ready.
    pub fn ready(&self) -> bool {
        let cell = self.shared.cell.lock().unwrap_or_else(|p| p.into_inner());
        matches!(cell.state, EncoderState::Ready(_))
    }

    /// Block until the encoder is ready, a load fails, or the timeout
    /// elapses. Returns readiness. Kicks a load if the encoder is cold.
    pub fn wait_until_ready(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut cell = self.shared.cell.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match &cell.state {
                EncoderState::Ready(_) => return true,
                EncoderState::Cold => {
                    if cell.last_error.is_some() {
                        return false;
                    }
                    self.start_loading(&mut cell);
                }
                EncoderState::Loading | EncoderState::Unloading => {}
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return false;
            };
            let (next, timed_out) = self
                .shared
                .cond
                .wait_timeout(cell, remaining)
                .unwrap_or_else(|p| p.into_inner());
            cell = next;
            if timed_out.timed_out() && !matches!(cell.state, EncoderState::Ready(_)) {
                return false;
            }
        }
    }

    /// Embed a text with the configured cache policy.
    pub fn embed(&self, text: &str) -> Result<Embedding, EmbedderError> {
        self.embed_with(text, self.opts.cache_bypass)
    }

    /// Embed a text with an explicit cache-bypass flag for this call.
    pub fn embed_with(&self, text: &str, bypass_cache: bool) -> Result<Embedding, EmbedderError> {
        if text.trim().is_empty() {
            return Err(EmbedderError::EmptyText);
        }

        let key = EmbedCache::key(text);
        if !bypass_cache {
            if let Some(vector) = self.cache.get_by_key(&key) {
                return Ok(Embedding::encoded(vector));
            }
        }

        // In-flight dedup: exactly one encoder call per key under concurrency
        let (slot, leader) = {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            match inflight.get(&key) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let slot = Arc::new(Inflight::new());
                    inflight.insert(key, Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            let (result, fallback) = slot.wait();
            return result.map(|v| {
                if fallback {
                    Embedding::from_fallback(v)
                } else {
                    Embedding::encoded(v)
                }
            });
        }

        let outcome = self.encode_one(text);
        // Publish before any cache write so followers are never blocked on IO
        match &outcome {
            Ok(embedding) => slot.publish(Ok(embedding.as_slice().to_vec()), embedding.is_fallback()),
            Err(e) => slot.publish(Err(e.clone()), false),
        }
        {
            let mut inflight = self.inflight.lock().unwrap_or_else(|p| p.into_inner());
            inflight.remove(&key);
        }

        if let Ok(embedding) = &outcome {
            // Fallback vectors are never persisted: a recovered encoder must
            // not observe them through the cache
            if !embedding.is_fallback() && !bypass_cache {
                if let Err(e) = self.cache.put_by_key(&key, embedding.as_slice()) {
                    tracing::warn!(error = %e, "Cache write failed");
                }
            }
        }

        outcome
    }

    /// Embed many texts, preserving input order. Cache hits are served
    /// directly; distinct misses go to the encoder as one chunked batch.
    pub fn embed_batch(&self, texts: &[String]) -> Result<Vec<Embedding>, EmbedderError> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let bypass = self.opts.cache_bypass;

        let mut results: Vec<Option<Embedding>> = vec![None; texts.len()];
        // key -> positions needing that vector (dedupes within the batch)
        let mut misses: Vec<(CacheKey, String, Vec<usize>)> = Vec::new();

        for (i, text) in texts.iter().enumerate() {
            if text.trim().is_empty() {
                return Err(EmbedderError::EmptyText);
            }
            let key = EmbedCache::key(text);
            if !bypass {
                if let Some(vector) = self.cache.get_by_key(&key) {
                    results[i] = Some(Embedding::encoded(vector));
                    continue;
                }
            }
            match misses.iter_mut().find(|(k, _, _)| *k == key) {
                Some((_, _, positions)) => positions.push(i),
                None => misses.push((key, text.clone(), vec![i])),
            }
        }

        if !misses.is_empty() {
            let miss_texts: Vec<String> = misses.iter().map(|(_, t, _)| t.clone()).collect();
            let (vectors, fallback) = self.encode_many(&miss_texts)?;

            for ((key, _, positions), vector) in misses.iter().zip(vectors) {
                if !fallback && !bypass {
                    if let Err(e) = self.cache.put_by_key(key, &vector) {
                        tracing::warn!(error = %e, "Cache write failed");
                    }
                }
                for &i in positions {
                    results[i] = Some(if fallback {
                        Embedding::from_fallback(vector.clone())
                    } else {
                        Embedding::encoded(vector.clone())
                    });
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.expect("every position filled by hit or miss path"))
            .collect())
    }

    /// Encoder invocations so far (cache hits and fallbacks don't count).
    pub fn encoder_calls(&self) -> u64 {
        self.encoder_calls.load(Ordering::Relaxed)
    }

    /// Cache statistics.
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Drop every cached embedding (both tiers).
    pub fn clear_cache(&self) -> Result<(), crate::cache::CacheError> {
        self.cache.clear()
    }

    // ============ internals ============

    fn encode_one(&self, text: &str) -> Result<Embedding, EmbedderError> {
        match self.acquire_encoder() {
            Ok(encoder) => {
                self.encoder_calls.fetch_add(1, Ordering::Relaxed);
                let mut vectors = encoder.encode_batch(&[text.to_string()])?;
                let vector = vectors
                    .pop()
                    .ok_or_else(|| EmbedderError::Encoder("empty encoder output".into()))?;
                Ok(Embedding::encoded(vector))
            }
            Err(unavailable) if self.opts.allow_fallback => {
                tracing::warn!(error = %unavailable, "Using deterministic fallback embedding");
                Ok(Embedding::from_fallback(fallback_vector(text)))
            }
            Err(unavailable) => Err(unavailable),
        }
    }

    fn encode_many(&self, texts: &[String]) -> Result<(Vec<Vec<f32>>, bool), EmbedderError> {
        match self.acquire_encoder() {
            Ok(encoder) => {
                self.encoder_calls.fetch_add(1, Ordering::Relaxed);
                let vectors = encoder.encode_batch(texts)?;
                Ok((vectors, false))
            }
            Err(unavailable) if self.opts.allow_fallback => {
                tracing::warn!(error = %unavailable, "Using deterministic fallback embeddings");
                Ok((texts.iter().map(|t| fallback_vector(t)).collect(), true))
            }
            Err(unavailable) => Err(unavailable),
        }
    }

    /// Get the loaded encoder, blocking on readiness up to `warmup_timeout`.
    fn acquire_encoder(&self) -> Result<Arc<OnnxEncoder>, EmbedderError> {
        let deadline = Instant::now() + self.opts.warmup_timeout;
        let mut started_load = false;
        let mut cell = self.shared.cell.lock().unwrap_or_else(|p| p.into_inner());
        loop {
            match &cell.state {
                EncoderState::Ready(encoder) => {
                    let encoder = Arc::clone(encoder);
                    cell.last_used = Instant::now();
                    return Ok(encoder);
                }
                EncoderState::Cold => {
                    if started_load {
                        // Our own load attempt came back Cold: it failed
                        let reason = cell
                            .last_error
                            .clone()
                            .unwrap_or_else(|| "encoder load failed".into());
                        return Err(EmbedderError::Unavailable(reason));
                    }
                    self.start_loading(&mut cell);
                    started_load = true;
                }
                EncoderState::Loading | EncoderState::Unloading => {}
            }

            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(EmbedderError::Unavailable(format!(
                    "encoder not ready after {:?} (state: {})",
                    self.opts.warmup_timeout,
                    cell.state.name()
                )));
            };
            let (next, _) = self
                .shared
                .cond
                .wait_timeout(cell, remaining)
                .unwrap_or_else(|p| p.into_inner());
            cell = next;
        }
    }

    /// Transition `Cold -> Loading` and spawn the loader thread.
    fn start_loading(&self, cell: &mut StateCell) {
        if !matches!(cell.state, EncoderState::Cold) {
            return;
        }
        cell.state = EncoderState::Loading;
        cell.last_error = None;

        let shared = Arc::clone(&self.shared);
        let model_dir = self.opts.model_dir.clone();
        std::thread::Builder::new()
            .name("memento-encoder-load".into())
            .spawn(move || {
                tracing::debug!("Encoder warm-up started");
                let loaded = OnnxEncoder::load(model_dir.as_deref());
                let mut cell = shared.cell.lock().unwrap_or_else(|p| p.into_inner());
                if matches!(cell.state, EncoderState::Loading) {
                    match loaded {
                        Ok(encoder) => {
                            cell.state = EncoderState::Ready(Arc::new(encoder));
                            cell.last_used = Instant::now();
                            tracing::info!("Encoder ready");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Encoder load failed");
                            cell.state = EncoderState::Cold;
                            cell.last_error = Some(e.to_string());
                        }
                    }
                }
                shared.cond.notify_all();
            })
            .map_err(|e| tracing::error!(error = %e, "Failed to spawn loader thread"))
            .ok();
    }
}

/// Idle-timeout worker: drops the encoder after a quiet period.
///
/// Exits when the embedder is dropped (the stop channel disconnects).
fn spawn_idle_worker(
    shared: Arc<Shared>,
    stop: crossbeam_channel::Receiver<()>,
    idle_timeout: Duration,
) {
    let check_interval = (idle_timeout / 4)
        .max(Duration::from_millis(100))
        .min(Duration::from_secs(60));

    std::thread::Builder::new()
        .name("memento-encoder-idle".into())
        .spawn(move || loop {
            match stop.recv_timeout(check_interval) {
                Ok(()) | Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            }

            let mut cell = shared.cell.lock().unwrap_or_else(|p| p.into_inner());
            let idle = matches!(cell.state, EncoderState::Ready(_))
                && cell.last_used.elapsed() >= idle_timeout;
            if !idle {
                continue;
            }

            // Reset the idle timer before dropping, then release the lock so
            // the session teardown never blocks embed calls
            cell.last_used = Instant::now();
            let encoder = match std::mem::replace(&mut cell.state, EncoderState::Unloading) {
                EncoderState::Ready(encoder) => encoder,
                other => {
                    cell.state = other;
                    continue;
                }
            };
            drop(cell);

            drop(encoder);

            let mut cell = shared.cell.lock().unwrap_or_else(|p| p.into_inner());
            if matches!(cell.state, EncoderState::Unloading) {
                cell.state = EncoderState::Cold;
            }
            shared.cond.notify_all();
            tracing::info!("Encoder unloaded after idle timeout");
        })
        .map_err(|e| tracing::error!(error = %e, "Failed to spawn idle worker"))
        .ok();
}

/// Deterministic 384-dim unit vector from `blake2b(nfc(text))`, expanded with
/// a block counter. Stable across processes and platforms.
pub(crate) fn fallback_vector(text: &str) -> Vec<f32> {
    let normalized: String = text.nfc().collect();
    let base = Blake2b512::digest(normalized.as_bytes());

    let mut vector = Vec::with_capacity(EMBEDDING_DIM);
    let mut counter = 0u32;
    while vector.len() < EMBEDDING_DIM {
        let mut hasher = Blake2b512::new();
        hasher.update(base);
        hasher.update(counter.to_le_bytes());
        let block = hasher.finalize();
        for chunk in block.chunks_exact(4) {
            if vector.len() >= EMBEDDING_DIM {
                break;
            }
            let raw = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            // Map to [-1, 1]
            vector.push((raw as f64 / u32::MAX as f64 * 2.0 - 1.0) as f32);
        }
        counter += 1;
    }

    if !l2_normalize(&mut vector) {
        // 384 hash-derived floats summing to zero is not a reachable case,
        // but a unit vector must come out regardless
        vector[0] = 1.0;
    }
    vector
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::l2_norm;

    fn fallback_embedder() -> Embedder {
        // Point at an empty dir so the load fails fast and deterministically
        let dir = tempfile::TempDir::new().unwrap();
        let opts = EmbedderOptions {
            model_dir: Some(dir.path().to_path_buf()),
            warmup_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
            allow_fallback: true,
            cache_bypass: false,
        };
        Embedder::new(opts, EmbedCache::in_memory(100).unwrap())
    }

    #[test]
    fn test_fallback_vector_deterministic_and_unit() {
        let a = fallback_vector("hello world");
        let b = fallback_vector("hello world");
        assert_eq!(a, b);
        assert_eq!(a.len(), EMBEDDING_DIM);
        assert!((l2_norm(&a) - 1.0).abs() < 1e-5);
        assert_ne!(fallback_vector("hello"), fallback_vector("world"));
    }

    #[test]
    fn test_fallback_vector_nfc_invariant() {
        assert_eq!(fallback_vector("cafe\u{0301}"), fallback_vector("caf\u{00e9}"));
    }

    #[test]
    fn test_embed_empty_text_rejected() {
        let embedder = fallback_embedder();
        assert!(matches!(
            embedder.embed("   "),
            Err(EmbedderError::EmptyText)
        ));
    }

    #[test]
    fn test_fallback_embed_is_tagged_and_not_persisted() {
        let embedder = fallback_embedder();
        let embedding = embedder.embed("some text").unwrap();
        assert!(embedding.is_fallback());
        assert_eq!(embedding.len(), EMBEDDING_DIM);
        // Not written to the persistent tier
        assert_eq!(embedder.cache.persistent_len().unwrap(), 0);
        // No encoder call happened
        assert_eq!(embedder.encoder_calls(), 0);
    }

    #[test]
    fn test_unavailable_without_fallback_opt_in() {
        let dir = tempfile::TempDir::new().unwrap();
        let opts = EmbedderOptions {
            model_dir: Some(dir.path().to_path_buf()),
            warmup_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(3600),
            allow_fallback: false,
            cache_bypass: false,
        };
        let embedder = Embedder::new(opts, EmbedCache::in_memory(100).unwrap());
        assert!(matches!(
            embedder.embed("text"),
            Err(EmbedderError::Unavailable(_))
        ));
    }

    #[test]
    fn test_embed_batch_preserves_order_and_dedupes() {
        let embedder = fallback_embedder();
        let texts = vec![
            "alpha".to_string(),
            "beta".to_string(),
            "alpha".to_string(),
        ];
        let embeddings = embedder.embed_batch(&texts).unwrap();
        assert_eq!(embeddings.len(), 3);
        assert_eq!(embeddings[0].as_slice(), embeddings[2].as_slice());
        assert_ne!(embeddings[0].as_slice(), embeddings[1].as_slice());
    }

    #[test]
    fn test_wait_until_ready_reports_failure() {
        let embedder = fallback_embedder();
        // Load fails fast (empty model dir); readiness can never be reached
        assert!(!embedder.wait_until_ready(Duration::from_secs(5)));
        assert!(!embedder.ready());
    }

    #[test]
    fn test_concurrent_same_text_agree() {
        let embedder = std::sync::Arc::new(fallback_embedder());
        let mut handles = Vec::new();
        for _ in 0..4 {
            let embedder = std::sync::Arc::clone(&embedder);
            handles.push(std::thread::spawn(move || {
                embedder.embed("shared text").unwrap().into_vec()
            }));
        }
        let vectors: Vec<Vec<f32>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for v in &vectors[1..] {
            assert_eq!(v, &vectors[0]);
        }
    }
}
