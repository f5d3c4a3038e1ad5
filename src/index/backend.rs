//! Similarity-search backends.
//!
//! Both backends hold the vectors themselves and answer exact k-nearest
//! queries. They differ only in memory layout:
//!
//! - [`LinearBackend`] keeps one `Vec<f32>` per entry in id order and scans
//!   them one by one.
//! - [`FlatBackend`] keeps every vector in one contiguous row-major buffer and
//!   scores the whole matrix with a single `ndarray` matrix-vector product.
//!
//! Results are ordered by distance ascending, ties by internal id ascending.

use ndarray::{ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use crate::error::{IngestError, Result};

/// Which backend holds the vectors, selected by `[index] backend`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Linear,
    Flat,
}

/// Distance function, selected by `[index] metric`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    /// `1 - cosine_similarity`. Zero vectors are at distance 1 from everything.
    #[default]
    Cosine,
    /// Euclidean distance.
    L2,
}

pub trait SearchBackend: Send + Sync {
    fn insert(&mut self, internal_id: u64, vector: Vec<f32>);
    fn remove(&mut self, internal_id: u64) -> Option<Vec<f32>>;
    fn get(&self, internal_id: u64) -> Option<Vec<f32>>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// All `(internal_id, vector)` pairs in ascending id order.
    fn export(&self) -> Vec<(u64, Vec<f32>)>;
    fn search(&self, query: &[f32], k: usize, metric: Metric) -> Result<Vec<(u64, f32)>>;
}

pub fn create_backend(kind: BackendKind, dims: usize) -> Box<dyn SearchBackend> {
    match kind {
        BackendKind::Linear => Box::new(LinearBackend::default()),
        BackendKind::Flat => Box::new(FlatBackend::new(dims)),
    }
}

fn norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

fn cosine_distance(dot: f32, norm_a: f32, norm_b: f32) -> f32 {
    let denom = norm_a * norm_b;
    if denom < f32::EPSILON {
        1.0
    } else {
        1.0 - dot / denom
    }
}

fn rank(mut scored: Vec<(u64, f32)>, k: usize) -> Vec<(u64, f32)> {
    scored.sort_by(|a, b| match a.1.total_cmp(&b.1) {
        Ordering::Equal => a.0.cmp(&b.0),
        other => other,
    });
    scored.truncate(k);
    scored
}

/// One vector per entry, scanned in id order.
#[derive(Default)]
pub struct LinearBackend {
    vectors: BTreeMap<u64, Vec<f32>>,
}

impl SearchBackend for LinearBackend {
    fn insert(&mut self, internal_id: u64, vector: Vec<f32>) {
        self.vectors.insert(internal_id, vector);
    }

    fn remove(&mut self, internal_id: u64) -> Option<Vec<f32>> {
        self.vectors.remove(&internal_id)
    }

    fn get(&self, internal_id: u64) -> Option<Vec<f32>> {
        self.vectors.get(&internal_id).cloned()
    }

    fn len(&self) -> usize {
        self.vectors.len()
    }

    fn export(&self) -> Vec<(u64, Vec<f32>)> {
        self.vectors
            .iter()
            .map(|(id, v)| (*id, v.clone()))
            .collect()
    }

    fn search(&self, query: &[f32], k: usize, metric: Metric) -> Result<Vec<(u64, f32)>> {
        let query_norm = norm(query);
        let scored = self
            .vectors
            .iter()
            .map(|(id, v)| {
                let distance = match metric {
                    Metric::Cosine => {
                        let dot: f32 = v.iter().zip(query).map(|(a, b)| a * b).sum();
                        cosine_distance(dot, norm(v), query_norm)
                    }
                    Metric::L2 => v
                        .iter()
                        .zip(query)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f32>()
                        .sqrt(),
                };
                (*id, distance)
            })
            .collect();
        Ok(rank(scored, k))
    }
}

/// Contiguous row-major matrix. Removal swaps the last row into the hole.
pub struct FlatBackend {
    dims: usize,
    data: Vec<f32>,
    ids: Vec<u64>,
    norms: Vec<f32>,
    positions: HashMap<u64, usize>,
}

impl FlatBackend {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
            ids: Vec::new(),
            norms: Vec::new(),
            positions: HashMap::new(),
        }
    }

    fn row(&self, pos: usize) -> &[f32] {
        &self.data[pos * self.dims..(pos + 1) * self.dims]
    }
}

impl SearchBackend for FlatBackend {
    fn insert(&mut self, internal_id: u64, vector: Vec<f32>) {
        if self.positions.contains_key(&internal_id) {
            self.remove(internal_id);
        }
        let pos = self.ids.len();
        self.norms.push(norm(&vector));
        self.data.extend_from_slice(&vector);
        self.ids.push(internal_id);
        self.positions.insert(internal_id, pos);
    }

    fn remove(&mut self, internal_id: u64) -> Option<Vec<f32>> {
        let pos = self.positions.remove(&internal_id)?;
        let removed = self.row(pos).to_vec();
        let last = self.ids.len() - 1;
        if pos != last {
            let (head, tail) = self.data.split_at_mut(last * self.dims);
            head[pos * self.dims..(pos + 1) * self.dims].copy_from_slice(&tail[..self.dims]);
            let moved_id = self.ids[last];
            self.ids[pos] = moved_id;
            self.norms[pos] = self.norms[last];
            self.positions.insert(moved_id, pos);
        }
        self.data.truncate(last * self.dims);
        self.ids.truncate(last);
        self.norms.truncate(last);
        Some(removed)
    }

    fn get(&self, internal_id: u64) -> Option<Vec<f32>> {
        self.positions.get(&internal_id).map(|&pos| self.row(pos).to_vec())
    }

    fn len(&self) -> usize {
        self.ids.len()
    }

    fn export(&self) -> Vec<(u64, Vec<f32>)> {
        let mut out: Vec<(u64, Vec<f32>)> = self
            .ids
            .iter()
            .enumerate()
            .map(|(pos, id)| (*id, self.row(pos).to_vec()))
            .collect();
        out.sort_by_key(|(id, _)| *id);
        out
    }

    fn search(&self, query: &[f32], k: usize, metric: Metric) -> Result<Vec<(u64, f32)>> {
        if self.ids.is_empty() {
            return Ok(Vec::new());
        }
        let matrix = ArrayView2::from_shape((self.ids.len(), self.dims), &self.data)
            .map_err(|e| IngestError::CorruptIndex(format!("flat backend shape: {}", e)))?;
        let q = ArrayView1::from(query);
        let dots = matrix.dot(&q);
        let query_norm = norm(query);

        let scored = dots
            .iter()
            .enumerate()
            .map(|(pos, &dot)| {
                let distance = match metric {
                    Metric::Cosine => cosine_distance(dot, self.norms[pos], query_norm),
                    Metric::L2 => {
                        let sq = self.norms[pos] * self.norms[pos] + query_norm * query_norm
                            - 2.0 * dot;
                        sq.max(0.0).sqrt()
                    }
                };
                (self.ids[pos], distance)
            })
            .collect();
        Ok(rank(scored, k))
    }
}
