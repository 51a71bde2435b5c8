//! # memento - embedded semantic memory for AI agents
//!
//! Stores short text "memories" with 384-dim MiniLM embeddings in a
//! single-file SQLite database and answers similarity + filter queries with
//! bounded latency.
//!
//! ## Features
//!
//! - **Semantic recall**: all-MiniLM-L6-v2 ONNX embeddings, cosine-ranked
//! - **Metadata filters**: tags, source, session, substring, importance,
//!   time windows (absolute or relative like "7d")
//! - **Two-tier embed cache**: in-process LRU over a persistent table,
//!   content-addressed by `blake2b(nfc(text))`
//! - **Crash-safe storage**: WAL journaling, versioned migrations, online
//!   backups with rotation, explicit recovery from snapshots
//! - **Bounded latency**: wall-clock deadlines honoured from any thread
//! - **Scales sideways**: brute-force scan by default, HNSW graph above
//!   10k rows (with recall validation against the exact scan)
//!
//! ## Quick Start
//!
//! ```no_run
//! use memento::{Config, Engine, RecallOptions, RememberOptions};
//!
//! # fn main() -> anyhow::Result<()> {
//! let engine = Engine::open(Config::load(None))?;
//!
//! engine.remember(
//!     "Deploy the new model",
//!     RememberOptions {
//!         tags: vec!["todo".into(), "deploy".into()],
//!         ..Default::default()
//!     },
//! )?;
//!
//! let hits = engine.recall("deployment", &RecallOptions::default())?;
//! for hit in &hits {
//!     println!("{:.3}  {}", hit.score, hit.memory.text);
//! }
//! # Ok(())
//! # }
//! ```

// Public library API modules
pub mod cache;
pub mod config;
pub mod deadline;
pub mod embedder;
pub mod encoder;
pub mod engine;
pub mod hnsw;
pub mod index;
pub mod store;

// Internal modules - specific items are re-exported below
pub(crate) mod math;
pub(crate) mod query;

pub use cache::{CacheError, CacheStats, EmbedCache};
pub use config::Config;
pub use deadline::{Deadline, DeadlineExceeded};
pub use embedder::{Embedder, EmbedderError, EmbedderOptions, Embedding};
pub use encoder::{EncoderError, ExecutionProvider, OnnxEncoder};
pub use engine::{Engine, EngineError, EngineOptions, EngineStats};
pub use hnsw::GraphIndex;
pub use index::{BruteForceIndex, IndexResult, VectorIndex};
pub use query::{RecallOptions, RecallResult};
pub use store::{
    Memory, MemoryId, RateLimit, RememberOptions, Store, StoreError, StoreOptions, StoreStats,
};

/// Embedding dimension produced by the encoder (all-MiniLM-L6-v2).
pub const EMBEDDING_DIM: usize = 384;

/// Embedding model identifier (HuggingFace repo).
pub const MODEL_NAME: &str = "sentence-transformers/all-MiniLM-L6-v2";
