// Vector Store
// On-disk KNN store addressed by node id, one embedding record per node.
// Each record carries the SHA-256 of the text it was generated from so
// the embedding service can skip unchanged nodes. Exact scan with a
// pluggable distance metric; the corpus is one workspace's "interesting"
// nodes, small enough that approximate structures would be overkill.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::types::NodeId;

const VECTORS_MAGIC: &[u8; 4] = b"STVX";
const AUTO_FLUSH_THRESHOLD: usize = 64;

/// Distance metrics for vector similarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    DotProduct,
}

/// One embedding row.
///
/// # Invariants
/// - One record per node id.
/// - `text_hash` is the SHA-256 of the exact text the vector encodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingRecord {
    pub node_id: NodeId,
    pub dimensions: usize,
    pub vector: Vec<f32>,
    pub text_hash: [u8; 32],
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct VectorImage {
    records: HashMap<NodeId, EmbeddingRecord>,
}

/// Sibling vector store of a workspace store.
pub struct VectorStore {
    path: PathBuf,
    image: VectorImage,
    metric: DistanceMetric,
    dirty: bool,
    pending_writes: usize,
}

impl VectorStore {
    /// Open the store under `dir` (created on demand).
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_metric(dir, DistanceMetric::Cosine)
    }

    pub fn open_with_metric(dir: impl AsRef<Path>, metric: DistanceMetric) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating vector directory {}", dir.display()))?;
        let path = dir.join("vectors.stvx");

        let image = if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading vector store {}", path.display()))?;
            if bytes.len() >= 4 && &bytes[..4] == VECTORS_MAGIC {
                bincode::deserialize(&bytes[4..]).unwrap_or_default()
            } else {
                VectorImage::default()
            }
        } else {
            VectorImage::default()
        };

        Ok(Self {
            path,
            image,
            metric,
            dirty: false,
            pending_writes: 0,
        })
    }

    pub fn get(&self, id: &NodeId) -> Option<&EmbeddingRecord> {
        self.image.records.get(id)
    }

    /// Insert or replace the record for a node.
    pub fn upsert(&mut self, record: EmbeddingRecord) -> Result<()> {
        self.image.records.insert(record.node_id.clone(), record);
        self.dirty = true;
        self.pending_writes += 1;
        if self.pending_writes >= AUTO_FLUSH_THRESHOLD {
            self.flush()?;
        }
        Ok(())
    }

    pub fn remove(&mut self, id: &NodeId) -> bool {
        let removed = self.image.records.remove(id).is_some();
        if removed {
            self.dirty = true;
            self.pending_writes += 1;
        }
        removed
    }

    /// Drop records whose node id fails the predicate; returns how many
    /// were removed. Used by `embed maintain` to shed deleted nodes.
    pub fn retain(&mut self, keep: impl Fn(&NodeId) -> bool) -> usize {
        let before = self.image.records.len();
        self.image.records.retain(|id, _| keep(id));
        let removed = before - self.image.records.len();
        if removed > 0 {
            self.dirty = true;
            self.pending_writes += removed;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.image.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.records.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EmbeddingRecord> {
        self.image.records.values()
    }

    /// Dimensions of the stored vectors, when any exist. Mixed
    /// dimensions cannot occur: the embedding service rejects batches
    /// whose dimensions disagree.
    pub fn dimensions(&self) -> Option<usize> {
        self.image.records.values().next().map(|r| r.dimensions)
    }

    fn score(&self, a: &[f32], b: &[f32]) -> f32 {
        if a.len() != b.len() {
            return f32::NEG_INFINITY;
        }
        match self.metric {
            DistanceMetric::Cosine => {
                let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
                let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
                let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
                if na == 0.0 || nb == 0.0 {
                    0.0
                } else {
                    dot / (na * nb)
                }
            }
            DistanceMetric::DotProduct => a.iter().zip(b).map(|(x, y)| x * y).sum(),
            DistanceMetric::Euclidean => {
                let dist: f32 = a
                    .iter()
                    .zip(b)
                    .map(|(x, y)| (x - y) * (x - y))
                    .sum::<f32>()
                    .sqrt();
                -dist
            }
        }
    }

    /// K nearest neighbors of `query`, best first, ties broken by node
    /// id so results are deterministic.
    pub fn knn(&self, query: &[f32], k: usize) -> Vec<(NodeId, f32)> {
        let mut scored: Vec<(NodeId, f32)> = self
            .image
            .records
            .values()
            .map(|r| (r.node_id.clone(), self.score(query, &r.vector)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.0.cmp(&b.0))
        });
        scored.truncate(k);
        scored
    }

    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("stvx.tmp");
        let body = bincode::serialize(&self.image).context("encoding vector image")?;
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(VECTORS_MAGIC);
        bytes.extend_from_slice(&body);
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("installing vector store {}", self.path.display()))?;
        self.dirty = false;
        self.pending_writes = 0;
        Ok(())
    }
}

impl Drop for VectorStore {
    fn drop(&mut self) {
        // Partial progress is durable even if the caller forgets to
        // flush; errors here have nowhere to go.
        let _ = self.flush();
    }
}
