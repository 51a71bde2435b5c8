//! Vector index abstraction and the brute-force backend
//!
//! The brute-force index is the default: an exhaustive dot-product scan over
//! a contiguous N x 384 f32 buffer, correct by construction. A graph-based
//! approximate backend (see `hnsw.rs`) takes over above a size threshold.

use std::collections::HashMap;

use crate::deadline::{Deadline, DeadlineExceeded};
use crate::math::{cosine_similarity, TopK};
use crate::store::MemoryId;
use crate::EMBEDDING_DIM;

/// How many candidates to score between deadline checks during a scan.
const DEADLINE_CHECK_STRIDE: usize = 4096;

/// Result from a vector index search
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexResult {
    /// Memory id (matches the primary table)
    pub id: MemoryId,
    /// Similarity score (dot product of unit vectors, in [-1, 1])
    pub score: f32,
}

/// Trait for vector similarity search backends
///
/// Implementations must be thread-safe (`Send + Sync`); the store wraps them
/// in a reader-writer lock.
pub trait VectorIndex: Send + Sync {
    /// Search for the `k` nearest neighbours of `query`.
    ///
    /// Results are sorted by descending score, ascending id on ties. The
    /// deadline is checked periodically; on expiry the partial scan is
    /// discarded.
    fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: &Deadline,
    ) -> Result<Vec<IndexResult>, DeadlineExceeded>;

    /// Number of vectors in the index
    fn len(&self) -> usize;

    /// Check if the index is empty
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name (e.g. "brute-force", "hnsw")
    fn name(&self) -> &'static str;
}

/// Exhaustive scan over a contiguous embedding buffer.
///
/// Vectors are stored back-to-back in one `Vec<f32>` for cache-friendly
/// scans. Removal swaps the last vector into the hole so the buffer stays
/// dense; a position map keeps id lookups O(1).
pub struct BruteForceIndex {
    ids: Vec<MemoryId>,
    data: Vec<f32>,
    pos: HashMap<MemoryId, usize>,
}

impl BruteForceIndex {
    pub fn new() -> Self {
        Self {
            ids: Vec::new(),
            data: Vec::new(),
            pos: HashMap::new(),
        }
    }

    pub fn with_capacity(n: usize) -> Self {
        Self {
            ids: Vec::with_capacity(n),
            data: Vec::with_capacity(n * EMBEDDING_DIM),
            pos: HashMap::with_capacity(n),
        }
    }

    /// Insert or replace a vector. Panics in debug builds on a wrong
    /// dimension; release builds skip the row and log.
    pub fn insert(&mut self, id: MemoryId, vector: &[f32]) {
        debug_assert_eq!(vector.len(), EMBEDDING_DIM);
        if vector.len() != EMBEDDING_DIM {
            tracing::error!(
                id = %id,
                dims = vector.len(),
                "Refusing to index wrong-dimension vector"
            );
            return;
        }
        match self.pos.get(&id) {
            Some(&i) => {
                self.data[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM].copy_from_slice(vector);
            }
            None => {
                let i = self.ids.len();
                self.ids.push(id);
                self.data.extend_from_slice(vector);
                self.pos.insert(id, i);
            }
        }
    }

    /// Remove a vector. Returns `false` if the id was not present.
    pub fn remove(&mut self, id: &MemoryId) -> bool {
        let Some(i) = self.pos.remove(id) else {
            return false;
        };
        let last = self.ids.len() - 1;
        if i != last {
            // Move the last vector into the hole
            let moved_id = self.ids[last];
            self.ids.swap(i, last);
            let (head, tail) = self.data.split_at_mut(last * EMBEDDING_DIM);
            head[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM]
                .copy_from_slice(&tail[..EMBEDDING_DIM]);
            self.pos.insert(moved_id, i);
        }
        self.ids.pop();
        self.data.truncate(last * EMBEDDING_DIM);
        true
    }

    pub fn contains(&self, id: &MemoryId) -> bool {
        self.pos.contains_key(id)
    }

    /// Vector slice for a stored id.
    pub fn vector(&self, id: &MemoryId) -> Option<&[f32]> {
        self.pos
            .get(id)
            .map(|&i| &self.data[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM])
    }

    /// Iterate (id, vector) pairs in buffer order.
    pub fn iter(&self) -> impl Iterator<Item = (MemoryId, &[f32])> + '_ {
        self.ids
            .iter()
            .enumerate()
            .map(|(i, id)| (*id, &self.data[i * EMBEDDING_DIM..(i + 1) * EMBEDDING_DIM]))
    }
}

impl Default for BruteForceIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl VectorIndex for BruteForceIndex {
    fn search(
        &self,
        query: &[f32],
        k: usize,
        deadline: &Deadline,
    ) -> Result<Vec<IndexResult>, DeadlineExceeded> {
        if query.len() != EMBEDDING_DIM {
            tracing::warn!(
                expected = EMBEDDING_DIM,
                actual = query.len(),
                "Query dimension mismatch"
            );
            return Ok(Vec::new());
        }

        let mut heap = TopK::new(k);
        for (n, (id, vec)) in self.iter().enumerate() {
            if n % DEADLINE_CHECK_STRIDE == 0 {
                deadline.check()?;
            }
            let Some(score) = cosine_similarity(query, vec) else {
                continue;
            };
            heap.push(id, score);
        }

        Ok(heap
            .into_sorted_vec()
            .into_iter()
            .map(|(id, score)| IndexResult { id, score })
            .collect())
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn name(&self) -> &'static str {
        "brute-force"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::l2_normalize;

    fn test_id(n: u8) -> MemoryId {
        let mut bytes = [0u8; 16];
        bytes[0] = n;
        MemoryId(bytes)
    }

    fn test_vector(seed: u32) -> Vec<f32> {
        let mut v: Vec<f32> = (0..EMBEDDING_DIM)
            .map(|i| ((seed as f32 * 0.1) + (i as f32 * 0.001)).sin())
            .collect();
        l2_normalize(&mut v);
        v
    }

    #[test]
    fn test_insert_and_search() {
        let mut index = BruteForceIndex::new();
        index.insert(test_id(1), &test_vector(1));
        index.insert(test_id(2), &test_vector(2));
        index.insert(test_id(3), &test_vector(3));
        assert_eq!(index.len(), 3);

        let results = index
            .search(&test_vector(1), 3, &Deadline::unbounded())
            .unwrap();
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].id, test_id(1));
        assert!(results[0].score > 0.99);
        // Sorted by descending score
        assert!(results[0].score >= results[1].score);
        assert!(results[1].score >= results[2].score);
    }

    #[test]
    fn test_insert_replaces() {
        let mut index = BruteForceIndex::new();
        index.insert(test_id(1), &test_vector(1));
        index.insert(test_id(1), &test_vector(9));
        assert_eq!(index.len(), 1);
        let stored = index.vector(&test_id(1)).unwrap();
        assert_eq!(stored, test_vector(9).as_slice());
    }

    #[test]
    fn test_remove_swaps_last_into_hole() {
        let mut index = BruteForceIndex::new();
        for n in 1..=4 {
            index.insert(test_id(n), &test_vector(n as u32));
        }
        assert!(index.remove(&test_id(2)));
        assert_eq!(index.len(), 3);
        assert!(!index.contains(&test_id(2)));
        // The other vectors are still retrievable and intact
        for n in [1u8, 3, 4] {
            let v = index.vector(&test_id(n)).expect("still present");
            assert_eq!(v, test_vector(n as u32).as_slice());
        }
        assert!(!index.remove(&test_id(2)));
    }

    #[test]
    fn test_remove_last() {
        let mut index = BruteForceIndex::new();
        index.insert(test_id(1), &test_vector(1));
        assert!(index.remove(&test_id(1)));
        assert!(index.is_empty());
        assert!(index.data.is_empty());
    }

    #[test]
    fn test_empty_search() {
        let index = BruteForceIndex::new();
        let results = index
            .search(&test_vector(1), 5, &Deadline::unbounded())
            .unwrap();
        assert!(results.is_empty());
    }

    #[test]
    fn test_expired_deadline_aborts_scan() {
        let mut index = BruteForceIndex::new();
        index.insert(test_id(1), &test_vector(1));
        let deadline = Deadline::after_ms(1);
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(index.search(&test_vector(1), 5, &deadline).is_err());
    }

    #[test]
    fn test_trait_object_dispatch() {
        let mut index = BruteForceIndex::new();
        index.insert(test_id(1), &test_vector(1));
        let boxed: Box<dyn VectorIndex> = Box::new(index);
        assert_eq!(boxed.len(), 1);
        assert_eq!(boxed.name(), "brute-force");
    }
}
