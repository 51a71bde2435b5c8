//! HNSW (Hierarchical Navigable Small World) graph index
//!
//! Approximate nearest-neighbour backend activated when the store grows past
//! a size threshold. Built in memory from the brute-force buffer and rebuilt
//! when enough writes accumulate; it is never persisted, so there is no
//! serialized graph to distrust on load.
//!
//! After every build the graph is validated against the brute-force scan on a
//! sample of stored vectors. If recall@10 falls below the acceptance floor
//! the graph is discarded and brute force stays authoritative.

use hnsw_rs::anndists::dist::distances::DistCosine;
use hnsw_rs::api::AnnT;
use hnsw_rs::hnsw::Hnsw;

use crate::deadline::{Deadline, DeadlineExceeded};
use crate::index::{BruteForceIndex, IndexResult, VectorIndex};
use crate::store::MemoryId;
use crate::EMBEDDING_DIM;

/// HNSW index parameters
const MAX_NB_CONNECTION: usize = 24; // M parameter - connections per node
const MAX_LAYER: usize = 16; // Maximum layers in the graph
const EF_CONSTRUCTION: usize = 200; // Construction-time search width

/// Search width for queries (higher = more accurate but slower)
const EF_SEARCH: usize = 100;

/// Minimum average recall@10 (vs brute force) for the graph to be accepted
pub const RECALL_FLOOR: f64 = 0.95;

/// Sample size for the post-build recall check
const RECALL_SAMPLE: usize = 64;

/// Graph-based approximate index over the stored embeddings.
pub struct GraphIndex {
    hnsw: Hnsw<'static, f32, DistCosine>,
    id_map: Vec<MemoryId>,
}

impl GraphIndex {
    /// Build a graph over the current contents of the brute-force buffer.
    pub fn build(source: &BruteForceIndex) -> Self {
        let nb_elem = source.len();
        if nb_elem == 0 {
            let hnsw = Hnsw::new(MAX_NB_CONNECTION, 1, MAX_LAYER, EF_CONSTRUCTION, DistCosine);
            return Self {
                hnsw,
                id_map: Vec::new(),
            };
        }

        tracing::info!(vectors = nb_elem, "Building HNSW graph");

        let mut hnsw = Hnsw::new(
            MAX_NB_CONNECTION,
            nb_elem,
            MAX_LAYER,
            EF_CONSTRUCTION,
            DistCosine,
        );

        let mut id_map = Vec::with_capacity(nb_elem);
        let vectors: Vec<(MemoryId, Vec<f32>)> =
            source.iter().map(|(id, v)| (id, v.to_vec())).collect();
        let data_for_insert: Vec<(&Vec<f32>, usize)> = vectors
            .iter()
            .enumerate()
            .map(|(idx, (id, v))| {
                id_map.push(*id);
                (v, idx)
            })
            .collect();

        // Parallel insert for performance
        hnsw.parallel_insert_data(&data_for_insert);

        tracing::info!(vectors = nb_elem, "HNSW graph built");

        Self { hnsw, id_map }
    }

    /// Build and validate: returns `None` when the graph fails the recall
    /// check and brute force should stay authoritative.
    pub fn build_validated(source: &BruteForceIndex) -> Option<Self> {
        let graph = Self::build(source);
        let recall = graph.recall_against(source, RECALL_SAMPLE);
        if recall < RECALL_FLOOR {
            tracing::warn!(
                recall,
                floor = RECALL_FLOOR,
                "HNSW graph failed recall validation, falling back to brute force"
            );
            return None;
        }
        tracing::debug!(recall, "HNSW graph passed recall validation");
        Some(graph)
    }

    /// Average recall@10 against the exhaustive scan, over a strided sample
    /// of stored vectors used as queries.
    pub fn recall_against(&self, brute: &BruteForceIndex, sample: usize) -> f64 {
        let n = brute.len();
        if n == 0 || sample == 0 {
            return 1.0;
        }
        let stride = (n / sample.min(n)).max(1);
        let unbounded = Deadline::unbounded();
        let mut total_overlap = 0usize;
        let mut total_expected = 0usize;

        for (_, query) in brute.iter().step_by(stride) {
            let exact = match brute.search(query, 10, &unbounded) {
                Ok(r) => r,
                Err(_) => return 1.0, // unbounded deadline cannot expire
            };
            let approx = self.search_raw(query, 10);
            total_expected += exact.len();
            total_overlap += exact
                .iter()
                .filter(|e| approx.iter().any(|a| a.id == e.id))
                .count();
        }

        if total_expected == 0 {
            1.0
        } else {
            total_overlap as f64 / total_expected as f64
        }
    }

    fn search_raw(&self, query: &[f32], k: usize) -> Vec<IndexResult> {
        if self.id_map.is_empty() {
            return Vec::new();
        }
        if query.len() != EMBEDDING_DIM {
            tracing::warn!(
                expected = EMBEDDING_DIM,
                actual = query.len(),
                "Query dimension mismatch"
            );
            return Vec::new();
        }

        let neighbours = self.hnsw.search_neighbours(query, k, EF_SEARCH);
        neighbours
            .into_iter()
            .filter_map(|n| {
                let idx = n.d_id;
                if idx < self.id_map.len() {
                    // Cosine distance is 1 - cosine similarity
                    Some(IndexResult {
                        id: self.id_map[idx],
                        score: 1.0 - n.distance,
                    })
                } else {
                    tracing::warn!(idx, "Invalid index in HNSW result");
                    None
                }
            })
            .collect()
    }
}

impl VectorIndex for GraphIndex {
    fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: &Deadline,
    ) -> Result<Vec<IndexResult>, DeadlineExceeded> {
        deadline.check()?;
        Ok(self.search_raw(query, k))
    }

    fn len(&self) -> usize {
        self.id_map.len()
    }

    fn name(&self) -> &'static str {
        "hnsw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::l2_normalize;

    fn test_id(n: u32) -> MemoryId {
        let mut bytes = [0u8; 16];
        bytes[..4].copy_from_slice(&n.to_be_bytes());
        MemoryId(bytes)
    }

    fn test_vector(seed: u32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..EMBEDDING_DIM)
            .map(|i| ((seed as f32 * 0.7) + (i as f32 * 0.013)).sin())
            .collect();
        l2_normalize(&mut v);
        v
    }

    fn populated_brute(n: u32) -> BruteForceIndex {
        let mut brute = BruteForceIndex::new();
        for i in 0..n {
            brute.insert(test_id(i), &test_vector(i));
        }
        brute
    }

    #[test]
    fn test_build_and_search() {
        let brute = populated_brute(50);
        let graph = GraphIndex::build(&brute);
        assert_eq!(graph.len(), 50);

        let results = graph
            .search(&test_vector(7), 5, &Deadline::unbounded())
            .unwrap();
        assert!(!results.is_empty());
        assert_eq!(results[0].id, test_id(7));
        assert!(results[0].score > 0.99);
    }

    #[test]
    fn test_empty_graph() {
        let graph = GraphIndex::build(&BruteForceIndex::new());
        assert!(graph.is_empty());
        let results = graph
            .search(&test_vector(1), 5, &Deadline::unbounded())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_recall_validation_accepts_small_graph() {
        let brute = populated_brute(200);
        let graph = GraphIndex::build_validated(&brute);
        // At this scale HNSW recall is effectively exact
        assert!(graph.is_some());
        let recall = graph.unwrap().recall_against(&brute, 32);
        assert!(recall >= RECALL_FLOOR, "recall {} below floor", recall);
    }

    #[test]
    fn test_expired_deadline() {
        let brute = populated_brute(10);
        let graph = GraphIndex::build(&brute);
        let deadline = Deadline::after_ms(1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(graph.search(&test_vector(1), 5, &deadline).is_err());
    }
}
