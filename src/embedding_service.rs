// Embedding Service
// Keeps the vector store in step with the node corpus. Generation is
// incremental: each candidate's embedding input text is hashed and
// nodes whose hash matches the stored record are skipped, so re-running
// after no changes makes zero external calls. Batches go to the
// provider sequentially; cancellation is honored between batches and
// partial progress stays durable.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{debug, info};

use crate::contracts::CancellationToken;
use crate::content_filter::ContentFilter;
use crate::database::Database;
use crate::embeddings::EmbeddingProvider;
use crate::errors::SupertagError;
use crate::query_engine::{resolve_matches, ResolutionMode, ResolvedMatch};
use crate::store::Tables;
use crate::types::{NodeId, ValidatedLimit};
use crate::vector_store::EmbeddingRecord;

/// Ancestor names included in the embedded text, nearest first.
const CONTEXT_ANCESTORS: usize = 3;
/// Hard cap on the embedded text length, in characters.
const MAX_EMBED_TEXT_CHARS: usize = 512;

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub filter: ContentFilter,
    pub cancellation: CancellationToken,
    /// Overrides the provider's batch size when smaller.
    pub batch_size: Option<usize>,
}

impl Default for GenerateOptions {
    fn default() -> Self {
        Self {
            filter: ContentFilter::default(),
            cancellation: CancellationToken::new(),
            batch_size: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerateReport {
    pub selected: usize,
    pub embedded: usize,
    pub skipped_unchanged: usize,
    pub batches: usize,
    pub dimensions: Option<usize>,
    pub cancelled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticHit {
    pub id: NodeId,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ancestor: Option<ResolvedMatch>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<SemanticChild>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SemanticChild {
    pub id: NodeId,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SemanticSearchOptions {
    pub resolution: Option<ResolutionMode>,
    /// Include the first N child levels of each hit (0 = none).
    pub child_depth: usize,
    /// Restrict hits to nodes the filter would select today.
    pub filter: Option<ContentFilter>,
    pub cancellation: CancellationToken,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedStats {
    pub records: usize,
    pub dimensions: Option<usize>,
    pub candidates: usize,
    pub stale: usize,
}

/// Text a node is embedded as: its name plus a bounded chain of named
/// ancestors for context.
pub fn build_embed_text(tables: &Tables, id: &NodeId) -> Option<String> {
    let node = tables.node(id)?;
    let name = node.name.as_deref()?;

    let mut text = String::from(name);
    for ancestor in tables.named_ancestor_chain(id, CONTEXT_ANCESTORS) {
        if let Some(ancestor_name) = ancestor.name.as_deref() {
            if text.chars().count() + ancestor_name.chars().count() + 3 > MAX_EMBED_TEXT_CHARS {
                break;
            }
            text.push_str(" < ");
            text.push_str(ancestor_name);
        }
    }
    if text.chars().count() > MAX_EMBED_TEXT_CHARS {
        text = text.chars().take(MAX_EMBED_TEXT_CHARS).collect();
    }
    Some(text)
}

pub fn text_hash(text: &str) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    hasher.finalize().into()
}

/// Generate embeddings for every selected node whose text changed.
pub async fn generate(
    db: &Database,
    provider: Arc<dyn EmbeddingProvider>,
    options: &GenerateOptions,
) -> Result<GenerateReport> {
    let tables = db.store.snapshot();
    let selected = options.filter.select_ids(&tables);

    // Change detection pass: candidates whose stored hash differs.
    let mut pending: Vec<(NodeId, String, [u8; 32])> = Vec::new();
    let mut skipped = 0usize;
    {
        let vectors = db.vectors.lock();
        for id in &selected {
            let text = match build_embed_text(&tables, id) {
                Some(t) => t,
                None => continue,
            };
            let hash = text_hash(&text);
            match vectors.get(id) {
                Some(record) if record.text_hash == hash => skipped += 1,
                _ => pending.push((id.clone(), text, hash)),
            }
        }
    }

    let batch_size = options
        .batch_size
        .unwrap_or_else(|| provider.max_batch_size())
        .clamp(1, provider.max_batch_size());

    let mut embedded = 0usize;
    let mut batches = 0usize;
    let mut dimensions: Option<usize> = db.vectors.lock().dimensions();
    let mut cancelled = false;

    for batch in pending.chunks(batch_size) {
        if options.cancellation.is_cancelled() {
            cancelled = true;
            break;
        }
        let texts: Vec<String> = batch.iter().map(|(_, text, _)| text.clone()).collect();
        let result = provider.embed_texts(&texts).await?;
        crate::observability::record_embed_batch();
        batches += 1;

        if result.embeddings.len() != batch.len() {
            return Err(SupertagError::ApiError(format!(
                "provider returned {} vectors for a batch of {}",
                result.embeddings.len(),
                batch.len()
            ))
            .into());
        }

        let mut vectors = db.vectors.lock();
        for ((id, _, hash), vector) in batch.iter().zip(result.embeddings) {
            // The first response pins the dimensionality; later
            // disagreement rejects the batch.
            match dimensions {
                None => dimensions = Some(vector.len()),
                Some(d) if d != vector.len() => {
                    return Err(SupertagError::ApiError(format!(
                        "embedding dimensions changed from {d} to {}",
                        vector.len()
                    ))
                    .into());
                }
                Some(_) => {}
            }
            vectors.upsert(EmbeddingRecord {
                node_id: id.clone(),
                dimensions: vector.len(),
                vector,
                text_hash: *hash,
            })?;
            embedded += 1;
        }
        // Partial progress is durable between batches.
        vectors.flush()?;
    }

    info!(
        selected = selected.len(),
        embedded, skipped, batches, "embedding generation finished"
    );
    Ok(GenerateReport {
        selected: selected.len(),
        embedded,
        skipped_unchanged: skipped,
        batches,
        dimensions,
        cancelled,
    })
}

/// Embed the query once, KNN, and join hits back to node rows.
pub async fn semantic_search(
    db: &Database,
    provider: Arc<dyn EmbeddingProvider>,
    query: &str,
    limit: ValidatedLimit,
    options: &SemanticSearchOptions,
) -> Result<Vec<SemanticHit>> {
    let query_vector = provider.embed_text(query).await?;
    options.cancellation.check()?;

    let tables = db.store.snapshot();
    let neighbors = db.vectors.lock().knn(&query_vector, limit.get());

    let mut hits = Vec::with_capacity(neighbors.len());
    for (id, score) in neighbors {
        let node = match tables.node(&id) {
            Some(n) => n,
            // The vector store may lag one index run behind.
            None => continue,
        };
        if let Some(filter) = &options.filter {
            if !filter.selects(node) {
                continue;
            }
        }
        let ancestor = options.resolution.and_then(|mode| {
            resolve_matches(&tables, std::slice::from_ref(&id), mode)
                .into_iter()
                .next()
        });
        let children = collect_children(&tables, &id, options.child_depth);
        hits.push(SemanticHit {
            id: id.clone(),
            name: node.name.clone(),
            tags: tables
                .tags_of(&id)
                .iter()
                .map(|t| t.tag_name.clone())
                .collect(),
            score,
            ancestor,
            children,
        });
    }
    Ok(hits)
}

fn collect_children(tables: &Tables, id: &NodeId, depth: usize) -> Vec<SemanticChild> {
    if depth == 0 {
        return Vec::new();
    }
    let mut out = Vec::new();
    let mut frontier: Vec<NodeId> = vec![id.clone()];
    for _ in 0..depth {
        let mut next = Vec::new();
        for parent in &frontier {
            for child in tables.children_of(parent) {
                out.push(SemanticChild {
                    id: child.clone(),
                    name: tables.node(child).and_then(|n| n.name.clone()),
                });
                next.push(child.clone());
            }
        }
        frontier = next;
        if frontier.is_empty() {
            break;
        }
    }
    out
}

/// Counts for `embed stats`: stored records, candidate set size, and
/// how many candidates are stale (missing or out-of-date hash).
pub fn embed_stats(db: &Database, filter: &ContentFilter) -> EmbedStats {
    let tables = db.store.snapshot();
    let vectors = db.vectors.lock();
    let candidates = filter.select_ids(&tables);
    let stale = candidates
        .iter()
        .filter(|id| {
            build_embed_text(&tables, id)
                .map(|text| {
                    vectors
                        .get(id)
                        .map(|r| r.text_hash != text_hash(&text))
                        .unwrap_or(true)
                })
                .unwrap_or(false)
        })
        .count();
    EmbedStats {
        records: vectors.len(),
        dimensions: vectors.dimensions(),
        candidates: candidates.len(),
        stale,
    }
}

/// Drop vector records whose nodes no longer exist.
pub fn maintain(db: &Database) -> Result<usize> {
    let tables = db.store.snapshot();
    let mut vectors = db.vectors.lock();
    let removed = vectors.retain(|id| tables.nodes.contains_key(id));
    vectors.flush()?;
    if removed > 0 {
        debug!(removed, "dropped vectors for deleted nodes");
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NodeRow;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn named(id: &str, name: &str, parent: Option<&str>) -> NodeRow {
        NodeRow {
            id: nid(id),
            name: Some(name.to_string()),
            parent_id: parent.map(nid),
            doc_type: None,
            created: None,
            updated: None,
            done_at: None,
            flags: None,
            entity_override: None,
            signature: [0u8; 32],
            raw: Vec::new(),
        }
    }

    #[test]
    fn embed_text_includes_bounded_ancestor_context() {
        let mut tables = Tables::default();
        tables.nodes.insert(nid("root0001"), named("root0001", "Projects", None));
        tables
            .nodes
            .insert(nid("mid00001"), named("mid00001", "Supertag CLI", Some("root0001")));
        tables
            .nodes
            .insert(nid("leaf0001"), named("leaf0001", "Ship v1", Some("mid00001")));
        tables.rebuild_derived();

        let text = build_embed_text(&tables, &nid("leaf0001")).unwrap();
        assert_eq!(text, "Ship v1 < Supertag CLI < Projects");
    }

    #[test]
    fn embed_text_is_capped() {
        let mut tables = Tables::default();
        let long = "x".repeat(2 * MAX_EMBED_TEXT_CHARS);
        tables.nodes.insert(nid("n0000001"), named("n0000001", &long, None));
        tables.rebuild_derived();
        let text = build_embed_text(&tables, &nid("n0000001")).unwrap();
        assert_eq!(text.chars().count(), MAX_EMBED_TEXT_CHARS);
    }

    #[test]
    fn hash_is_stable_and_sensitive() {
        assert_eq!(text_hash("abc"), text_hash("abc"));
        assert_ne!(text_hash("abc"), text_hash("abd"));
    }
}
