//! End-to-end encoder tests (need the ONNX model; downloads on first run)
//!
//! Run with: `cargo test --features model-tests -- --ignored`

#![cfg(feature = "model-tests")]

use std::time::{Duration, Instant};

use memento::{
    Config, EmbedCache, Embedder, EmbedderOptions, Engine, RecallOptions, RememberOptions, Store,
    EMBEDDING_DIM,
};
use tempfile::TempDir;

fn real_engine(dir: &TempDir) -> Engine {
    let store = Store::open(&dir.path().join("memory.db")).unwrap();
    let cache = EmbedCache::open(&dir.path().join("cache.db"), 1000).unwrap();
    let embedder = Embedder::new(
        EmbedderOptions {
            warmup_timeout: Duration::from_secs(120),
            ..Default::default()
        },
        cache,
    );
    let mut config = Config::default();
    config.storage.db_path = Some(dir.path().join("memory.db"));
    config.storage.backup.enabled = false;
    Engine::with_parts(store, embedder, config)
}

#[test]
#[ignore = "downloads the model and runs inference"]
fn test_encoder_output_shape_and_norm() {
    let dir = TempDir::new().unwrap();
    let embedder = {
        let cache = EmbedCache::open(&dir.path().join("cache.db"), 10).unwrap();
        Embedder::new(
            EmbedderOptions {
                warmup_timeout: Duration::from_secs(120),
                ..Default::default()
            },
            cache,
        )
    };

    let embedding = embedder.embed("hello world").unwrap();
    assert_eq!(embedding.len(), EMBEDDING_DIM);
    let norm: f32 = embedding.as_slice().iter().map(|x| x * x).sum::<f32>().sqrt();
    assert!((norm - 1.0).abs() < 1e-5);
    assert!(!embedding.is_fallback());
}

#[test]
#[ignore = "downloads the model and runs inference"]
fn test_batch_matches_singleton_path() {
    // One tokenize-pad-run path: batch results must equal singleton results
    let dir = TempDir::new().unwrap();
    let cache = EmbedCache::open(&dir.path().join("cache.db"), 10).unwrap();
    let embedder = Embedder::new(
        EmbedderOptions {
            warmup_timeout: Duration::from_secs(120),
            cache_bypass: true, // force real encodes on both paths
            ..Default::default()
        },
        cache,
    );

    let texts = vec![
        "short".to_string(),
        "a noticeably longer sentence that pads the batch".to_string(),
        "third".to_string(),
    ];
    let batch = embedder.embed_batch(&texts).unwrap();
    assert_eq!(batch.len(), 3);
    for (text, from_batch) in texts.iter().zip(&batch) {
        let single = embedder.embed_with(text, true).unwrap();
        let dot: f32 = single
            .as_slice()
            .iter()
            .zip(from_batch.as_slice())
            .map(|(a, b)| a * b)
            .sum();
        assert!(dot > 0.999, "batch and single diverged: {}", dot);
    }
}

#[test]
#[ignore = "downloads the model and runs inference"]
fn test_semantic_recall_scenario() {
    let dir = TempDir::new().unwrap();
    let engine = real_engine(&dir);
    engine
        .remember(
            "Deploy new model",
            RememberOptions {
                tags: vec!["todo".into(), "deploy".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .remember(
            "Team meeting at 3pm",
            RememberOptions {
                tags: vec!["work".into()],
                ..Default::default()
            },
        )
        .unwrap();
    engine
        .remember(
            "Fix wifi driver",
            RememberOptions {
                tags: vec!["todo".into(), "bug".into()],
                ..Default::default()
            },
        )
        .unwrap();

    let hits = engine
        .recall(
            "deployment",
            &RecallOptions {
                topk: 2,
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(hits[0].memory.text, "Deploy new model");
    assert!(hits[0].score >= 0.4, "score {} below floor", hits[0].score);

    let mut filter = std::collections::HashMap::new();
    filter.insert("tags".to_string(), serde_json::json!(["work"]));
    let hits = engine
        .recall(
            "meeting",
            &RecallOptions {
                filters: Some(filter),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].memory.text, "Team meeting at 3pm");
}

#[test]
#[ignore = "downloads the model and runs inference"]
fn test_persistent_cache_skips_encoder_across_restart() {
    let dir = TempDir::new().unwrap();
    let cache_path = dir.path().join("cache.db");

    {
        let cache = EmbedCache::open(&cache_path, 10).unwrap();
        let embedder = Embedder::new(
            EmbedderOptions {
                warmup_timeout: Duration::from_secs(120),
                ..Default::default()
            },
            cache,
        );
        embedder.embed("hello").unwrap();
        assert_eq!(embedder.encoder_calls(), 1);
    }

    // "Restart": fresh embedder over the same cache file
    let cache = EmbedCache::open(&cache_path, 10).unwrap();
    let embedder = Embedder::new(
        EmbedderOptions {
            warmup_timeout: Duration::from_secs(120),
            ..Default::default()
        },
        cache,
    );
    let embedding = embedder.embed("hello").unwrap();
    assert_eq!(embedding.len(), EMBEDDING_DIM);
    assert_eq!(embedder.encoder_calls(), 0, "persistent hit must skip the encoder");
}

#[test]
#[ignore = "downloads the model and runs inference"]
fn test_batch_recall_amortizes_embedding() {
    let dir = TempDir::new().unwrap();
    let engine = real_engine(&dir);
    for i in 0..100 {
        engine
            .remember(&format!("fact number {}", i), RememberOptions::default())
            .unwrap();
    }
    engine.wait_until_ready(Duration::from_secs(120));

    // Baseline: one uncached query through the warm encoder
    let single_start = Instant::now();
    engine
        .recall("unseen baseline question", &RecallOptions::default())
        .unwrap();
    let single = single_start.elapsed();

    let queries: Vec<String> = (0..3).map(|i| format!("unseen question {}", i)).collect();
    let batch_start = Instant::now();
    let all = engine.batch_recall(&queries, &RecallOptions::default()).unwrap();
    let batch = batch_start.elapsed();

    assert_eq!(all.len(), 3);
    for hits in &all {
        assert_eq!(hits.len(), 5);
    }
    assert!(
        batch < single * 3,
        "batch {:?} should beat 3x single {:?}",
        batch,
        single
    );
}
