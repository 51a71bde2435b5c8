//! Common test fixtures and helpers
//!
//! Usage in test files:
//! ```ignore
//! mod common;
//! use common::TestEngine;
//! ```
//!
//! Engines here run with the deterministic fallback embedder (pointed at an
//! empty model directory) so the suite needs no ONNX model on disk. Fallback
//! vectors carry no semantics - identical texts agree bit-for-bit, different
//! texts are near-orthogonal - which is exactly what storage, filter, and
//! ordering tests need.

use std::path::PathBuf;
use std::time::Duration;

use memento::{
    Config, EmbedCache, Embedder, EmbedderOptions, Engine, Store, StoreOptions, EMBEDDING_DIM,
};
use tempfile::TempDir;

/// Test engine with automatic cleanup
///
/// Wraps an `Engine` with its backing `TempDir`, ensuring the directory
/// lives as long as the engine is in use.
pub struct TestEngine {
    pub engine: Engine,
    pub dir: TempDir,
}

/// Route tracing output through the test harness; honours RUST_LOG.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

impl TestEngine {
    /// Engine on a fresh temp directory, fallback embedder, default store.
    pub fn new() -> Self {
        Self::with_store_options(StoreOptions::default())
    }

    /// Engine with custom store tuning (e.g. a low HNSW threshold).
    pub fn with_store_options(store_opts: StoreOptions) -> Self {
        init_tracing();
        let dir = TempDir::new().expect("Failed to create temp dir");
        let store = Store::open_with(&dir.path().join("memory.db"), store_opts)
            .expect("Failed to open store");
        let embedder = fallback_embedder(&dir.path().join("cache.db"));

        let mut config = Config::default();
        config.storage.db_path = Some(dir.path().join("memory.db"));
        config.storage.backup.enabled = false;

        Self {
            engine: Engine::with_parts(store, embedder, config),
            dir,
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("memory.db")
    }
}

impl std::ops::Deref for TestEngine {
    type Target = Engine;

    fn deref(&self) -> &Self::Target {
        &self.engine
    }
}

impl std::ops::DerefMut for TestEngine {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.engine
    }
}

/// Embedder that fails model load instantly and falls back to deterministic
/// hash-expansion vectors.
pub fn fallback_embedder(cache_path: &std::path::Path) -> Embedder {
    let opts = EmbedderOptions {
        // A path with no model behind it fails the load instantly
        model_dir: Some(cache_path.with_extension("no-model")),
        warmup_timeout: Duration::from_secs(5),
        idle_timeout: Duration::from_secs(3600),
        allow_fallback: true,
        cache_bypass: false,
    };
    let cache = EmbedCache::open(cache_path, 100).expect("Failed to open cache");
    Embedder::new(opts, cache)
}

/// Deterministic unit vector for direct Store-level tests.
pub fn mock_embedding(seed: u32) -> Vec<f32> {
    let mut v: Vec<f32> = (0..EMBEDDING_DIM)
        .map(|i| ((seed as f32 * 0.7) + (i as f32 * 0.013)).sin())
        .collect();
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    for x in &mut v {
        *x /= norm;
    }
    v
}
