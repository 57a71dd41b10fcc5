//! HNSW-backed cosine-similarity index mapping expert embeddings to worker ids.

use hnsw_rs::prelude::*;
use mesh_core::{MeshError, Vector, WorkerId};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error(transparent)]
    Core(#[from] MeshError),
}

/// Construction-time HNSW parameters. Defaults mirror a small/medium expert
/// pool; production deployments with thousands of experts should raise
/// `max_elements` and `ef_construction`.
#[derive(Debug, Clone, Copy)]
pub struct IndexParams {
    pub max_nb_connection: usize,
    pub ef_construction: usize,
    pub max_elements: usize,
    pub max_layer: usize,
}

impl Default for IndexParams {
    fn default() -> Self {
        Self {
            max_nb_connection: 16,
            ef_construction: 200,
            max_elements: 10_000,
            max_layer: 16,
        }
    }
}

struct Labels {
    by_label: HashMap<usize, WorkerId>,
    next_label: AtomicUsize,
    /// Insertion order, used to stable-sort exact ties.
    insertion_order: HashMap<usize, usize>,
}

/// Non-owning lookup from expert embedding to worker id. The Orchestrator
/// owns the live worker set; this index only answers nearest-neighbour
/// queries over embeddings it was given.
pub struct ExpertIndex {
    dimension: usize,
    hnsw: RwLock<Hnsw<'static, f32, DistCosine>>,
    labels: RwLock<Labels>,
}

impl ExpertIndex {
    pub fn new(dimension: usize, params: IndexParams) -> Self {
        let hnsw = Hnsw::<f32, DistCosine>::new(
            params.max_nb_connection,
            params.max_elements,
            params.max_layer,
            params.ef_construction,
            DistCosine {},
        );
        Self {
            dimension,
            hnsw: RwLock::new(hnsw),
            labels: RwLock::new(Labels {
                by_label: HashMap::new(),
                next_label: AtomicUsize::new(0),
                insertion_order: HashMap::new(),
            }),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Inserts a new expert. Fails with `DimensionMismatch` if `embedding`'s
    /// length differs from the index dimension. Labels are never reused
    /// within the lifetime of an index.
    pub fn add_expert(&self, worker_id: WorkerId, embedding: &Vector) -> Result<(), IndexError> {
        if embedding.len() != self.dimension {
            return Err(MeshError::DimensionMismatch {
                expected: self.dimension,
                actual: embedding.len(),
            }
            .into());
        }
        let mut labels = self.labels.write();
        let label = labels.next_label.fetch_add(1, Ordering::SeqCst);
        let order = labels.by_label.len();
        labels.by_label.insert(label, worker_id.clone());
        labels.insertion_order.insert(label, order);
        drop(labels);

        let hnsw = self.hnsw.write();
        hnsw.insert((embedding.as_slice(), label));
        debug!(worker_id = %worker_id, label, "expert added to index");
        Ok(())
    }

    pub fn size(&self) -> usize {
        self.labels.read().by_label.len()
    }

    /// Up to `min(k, size())` results, sorted by ascending cosine distance.
    /// Exact ties break by insertion order.
    pub fn find_best_experts(&self, query: &Vector, k: usize) -> Vec<(WorkerId, f32)> {
        if self.size() == 0 || k == 0 {
            return Vec::new();
        }
        let ef_search = k.max(16);
        let hnsw = self.hnsw.read();
        let mut neighbours = hnsw.search(query.as_slice(), k, ef_search);
        drop(hnsw);

        let labels = self.labels.read();
        neighbours.sort_by(|a, b| {
            a.distance
                .partial_cmp(&b.distance)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let oa = labels.insertion_order.get(&a.d_id).copied().unwrap_or(usize::MAX);
                    let ob = labels.insertion_order.get(&b.d_id).copied().unwrap_or(usize::MAX);
                    oa.cmp(&ob)
                })
        });

        neighbours
            .into_iter()
            .take(k)
            .filter_map(|n| labels.by_label.get(&n.d_id).cloned().map(|w| (w, n.distance)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_and_query() {
        let index = ExpertIndex::new(4, IndexParams::default());
        index.add_expert("w0".into(), &vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add_expert("w1".into(), &vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.size(), 2);

        let results = index.find_best_experts(&vec![0.9, 0.1, 0.0, 0.0], 1);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].0, "w0");
    }

    #[test]
    fn dimension_mismatch_rejected() {
        let index = ExpertIndex::new(4, IndexParams::default());
        let err = index.add_expert("w0".into(), &vec![1.0, 0.0]).unwrap_err();
        assert!(matches!(err, IndexError::Core(MeshError::DimensionMismatch { .. })));
    }

    #[test]
    fn find_on_empty_index_returns_nothing() {
        let index = ExpertIndex::new(4, IndexParams::default());
        assert!(index.find_best_experts(&vec![0.0, 0.0, 0.0, 1.0], 3).is_empty());
    }

    #[test]
    fn k_is_capped_by_size() {
        let index = ExpertIndex::new(3, IndexParams::default());
        index.add_expert("a".into(), &vec![1.0, 0.0, 0.0]).unwrap();
        index.add_expert("b".into(), &vec![0.0, 1.0, 0.0]).unwrap();
        let results = index.find_best_experts(&vec![1.0, 1.0, 0.0], 10);
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn fifth_worker_with_orthogonal_mix_is_reachable() {
        let index = ExpertIndex::new(4, IndexParams::default());
        index.add_expert("w0".into(), &vec![1.0, 0.0, 0.0, 0.0]).unwrap();
        index.add_expert("w1".into(), &vec![0.0, 1.0, 0.0, 0.0]).unwrap();
        index.add_expert("w2".into(), &vec![0.0, 0.0, 1.0, 0.0]).unwrap();
        index.add_expert("w3".into(), &vec![0.0, 0.0, 0.0, 1.0]).unwrap();
        index.add_expert("w4".into(), &vec![0.3, 0.3, 0.3, 0.8]).unwrap();
        assert_eq!(index.size(), 5);
        let results = index.find_best_experts(&vec![0.2, 0.2, 0.2, 0.9], 1);
        assert_eq!(results[0].0, "w4");
    }
}
