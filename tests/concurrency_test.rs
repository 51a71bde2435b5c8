//! Concurrent readers and writers: no panics, bounded latency, resolvable ids

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use common::TestEngine;
use memento::{RecallOptions, RememberOptions};

#[test]
fn test_concurrent_recall_and_remember() {
    let fixture = TestEngine::new();
    // Seed so readers have something to rank
    for i in 0..50 {
        fixture
            .remember(&format!("seed memory {}", i), RememberOptions::default())
            .unwrap();
    }

    let engine = Arc::new(fixture);
    let mut handles = Vec::new();

    // 4 reader threads
    for reader in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for i in 0..20 {
                let start = Instant::now();
                let hits = engine
                    .recall(
                        &format!("seed memory {}", (reader * 7 + i) % 50),
                        &RecallOptions {
                            timeout_ms: Some(2000),
                            ..Default::default()
                        },
                    )
                    .expect("recall must not fail under concurrent writes");
                assert!(
                    start.elapsed() < Duration::from_millis(2200),
                    "recall exceeded its deadline plus slack"
                );
                for hit in &hits {
                    // Every returned id resolves to a live row
                    assert!(engine.get(&hit.memory.id).unwrap().is_some());
                }
            }
        }));
    }

    // 2 writer threads
    for writer in 0..2 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            for i in 0..25 {
                engine
                    .remember(
                        &format!("writer {} memory {}", writer, i),
                        RememberOptions::default(),
                    )
                    .expect("remember must not fail under concurrent reads");
            }
        }));
    }

    for handle in handles {
        handle.join().expect("no thread may panic");
    }

    let stats = engine.stats().unwrap();
    assert_eq!(stats.store.total_memories, 50 + 2 * 25);
    assert_eq!(stats.store.total_memories, stats.store.total_vectors);
}

#[test]
fn test_delete_is_atomic_under_concurrent_reads() {
    let fixture = TestEngine::new();
    let mut ids = Vec::new();
    for i in 0..30 {
        ids.push(
            fixture
                .remember(&format!("victim {}", i), RememberOptions::default())
                .unwrap(),
        );
    }

    let engine = Arc::new(fixture);
    let reader = {
        let engine = Arc::clone(&engine);
        let ids = ids.clone();
        std::thread::spawn(move || {
            for _ in 0..50 {
                for id in &ids {
                    // A row is either fully present or fully gone; a deleted
                    // id must not surface from any index
                    if engine.get(id).unwrap().is_none() {
                        let hits = engine
                            .recall("victim", &RecallOptions { topk: 30, ..Default::default() })
                            .unwrap();
                        assert!(hits.iter().all(|h| h.memory.id != *id));
                    }
                }
            }
        })
    };

    for id in &ids {
        assert!(engine.delete(id).unwrap());
    }
    reader.join().expect("reader must not panic");

    let stats = engine.stats().unwrap();
    assert_eq!(stats.store.total_memories, 0);
    assert_eq!(stats.store.total_vectors, 0);
}

#[test]
fn test_concurrent_writers_distinct_rows() {
    let engine = Arc::new(TestEngine::new());
    let mut handles = Vec::new();
    for writer in 0..4 {
        let engine = Arc::clone(&engine);
        handles.push(std::thread::spawn(move || {
            (0..10)
                .map(|i| {
                    engine
                        .remember(
                            &format!("w{} row {}", writer, i),
                            RememberOptions::default(),
                        )
                        .unwrap()
                })
                .collect::<Vec<_>>()
        }));
    }

    let mut all_ids = Vec::new();
    for handle in handles {
        all_ids.extend(handle.join().unwrap());
    }
    all_ids.sort();
    all_ids.dedup();
    assert_eq!(all_ids.len(), 40, "distinct texts must get distinct ids");
}
