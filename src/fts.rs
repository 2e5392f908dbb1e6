// Trigram Full-Text Index
// Inverted index over node names: lowercase trigrams -> node ids, with a
// verification pass against the actual names so results have exact
// substring semantics rather than approximate trigram overlap.
// Rebuilt wholesale by the indexer on every snapshot commit and persisted
// beside the store with the same temp-file + rename discipline.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::types::NodeId;

const FTS_MAGIC: &[u8; 4] = b"STFT";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FtsMetadata {
    version: u32,
    node_count: usize,
    trigram_count: usize,
    updated_ms: i64,
}

impl Default for FtsMetadata {
    fn default() -> Self {
        Self {
            version: 1,
            node_count: 0,
            trigram_count: 0,
            updated_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FtsImage {
    metadata: FtsMetadata,
    trigrams: HashMap<String, HashSet<NodeId>>,
    /// Lowercased names kept for the verification pass and for short
    /// (sub-trigram) queries.
    names: HashMap<NodeId, String>,
}

/// Full-text index over node names.
pub struct FtsIndex {
    path: PathBuf,
    image: FtsImage,
    dirty: bool,
}

impl FtsIndex {
    /// Extract trigrams from text.
    ///
    /// Lowercases, then yields every 3-char window containing at least
    /// one alphanumeric character. Duplicates are dropped; the index
    /// only answers membership, not ranking.
    pub fn extract_trigrams(text: &str) -> Vec<String> {
        let normalized = text.to_lowercase();
        let chars: Vec<char> = normalized.chars().collect();
        if chars.len() < 3 {
            return Vec::new();
        }

        let mut seen = HashSet::new();
        let mut trigrams = Vec::new();
        for window in chars.windows(3) {
            if !window.iter().any(|c| c.is_alphanumeric()) {
                continue;
            }
            let trigram: String = window.iter().collect();
            if seen.insert(trigram.clone()) {
                trigrams.push(trigram);
            }
        }
        trigrams
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let image = if path.exists() {
            let bytes = std::fs::read(&path)
                .with_context(|| format!("reading fts index {}", path.display()))?;
            if bytes.len() >= 4 && &bytes[..4] == FTS_MAGIC {
                bincode::deserialize(&bytes[4..]).unwrap_or_else(|e| {
                    // A torn index is not fatal: the next index run
                    // rebuilds it from the store.
                    debug!(error = %e, "fts image unreadable, starting empty");
                    FtsImage::default()
                })
            } else {
                FtsImage::default()
            }
        } else {
            FtsImage::default()
        };

        Ok(Self {
            path,
            image,
            dirty: false,
        })
    }

    /// Replace the whole index with the given (id, name) pairs.
    pub fn rebuild<'a>(&mut self, names: impl Iterator<Item = (&'a NodeId, &'a str)>) {
        let mut image = FtsImage::default();
        for (id, name) in names {
            let lowered = name.to_lowercase();
            for trigram in Self::extract_trigrams(name) {
                image.trigrams.entry(trigram).or_default().insert(id.clone());
            }
            image.names.insert(id.clone(), lowered);
        }
        image.metadata.node_count = image.names.len();
        image.metadata.trigram_count = image.trigrams.len();
        image.metadata.updated_ms = chrono::Utc::now().timestamp_millis();
        self.image = image;
        self.dirty = true;
    }

    /// Case-insensitive substring search over node names.
    ///
    /// Queries of three or more characters intersect trigram posting
    /// lists and verify candidates against the stored name; shorter
    /// queries scan the name table directly.
    pub fn search_substring(&self, query: &str) -> Vec<NodeId> {
        let needle = query.to_lowercase();
        if needle.is_empty() {
            return Vec::new();
        }

        let mut hits: Vec<NodeId> = if needle.chars().count() < 3 {
            self.image
                .names
                .iter()
                .filter(|(_, name)| name.contains(&needle))
                .map(|(id, _)| id.clone())
                .collect()
        } else {
            let trigrams = Self::extract_trigrams(&needle);
            let mut candidates: Option<HashSet<NodeId>> = None;
            for trigram in &trigrams {
                let posting = match self.image.trigrams.get(trigram) {
                    Some(p) => p,
                    None => return Vec::new(),
                };
                candidates = Some(match candidates {
                    None => posting.clone(),
                    Some(acc) => acc.intersection(posting).cloned().collect(),
                });
                if candidates.as_ref().map(HashSet::is_empty).unwrap_or(false) {
                    return Vec::new();
                }
            }
            candidates
                .unwrap_or_default()
                .into_iter()
                .filter(|id| {
                    self.image
                        .names
                        .get(id)
                        .map(|name| name.contains(&needle))
                        .unwrap_or(false)
                })
                .collect()
        };

        // Deterministic result order; ranking is out of scope.
        hits.sort();
        hits
    }

    pub fn len(&self) -> usize {
        self.image.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.image.names.is_empty()
    }

    /// Persist when dirty. Same temp+rename discipline as the store.
    pub fn flush(&mut self) -> Result<()> {
        if !self.dirty {
            return Ok(());
        }
        let tmp = self.path.with_extension("stft.tmp");
        let body = bincode::serialize(&self.image).context("encoding fts image")?;
        let mut bytes = Vec::with_capacity(body.len() + 4);
        bytes.extend_from_slice(FTS_MAGIC);
        bytes.extend_from_slice(&body);
        std::fs::write(&tmp, &bytes)
            .with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("installing fts index {}", self.path.display()))?;
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn build(entries: &[(&str, &str)]) -> (TempDir, FtsIndex) {
        let dir = TempDir::new().unwrap();
        let mut index = FtsIndex::open(dir.path().join("fts.stft")).unwrap();
        let owned: Vec<(NodeId, String)> = entries
            .iter()
            .map(|(id, name)| (nid(id), name.to_string()))
            .collect();
        index.rebuild(owned.iter().map(|(id, name)| (id, name.as_str())));
        (dir, index)
    }

    #[test]
    fn trigram_extraction_lowercases_and_dedupes() {
        let trigrams = FtsIndex::extract_trigrams("AbaBab");
        assert!(trigrams.contains(&"aba".to_string()));
        assert!(trigrams.contains(&"bab".to_string()));
        assert_eq!(trigrams.len(), 2);
        assert!(FtsIndex::extract_trigrams("ab").is_empty());
    }

    #[test]
    fn substring_search_is_case_insensitive() {
        let (_dir, index) = build(&[
            ("N1", "Team sync Zurich"),
            ("N2", "Client call Berlin"),
            ("N3", "Workshop Zurich"),
        ]);

        let lower = index.search_substring("zurich");
        let upper = index.search_substring("ZURICH");
        assert_eq!(lower, vec![nid("N1"), nid("N3")]);
        assert_eq!(lower, upper);
    }

    #[test]
    fn trigram_overlap_without_substring_is_rejected() {
        // "abcx dabc" contains the trigrams of "abcabc"-ish queries
        // without containing the query itself.
        let (_dir, index) = build(&[("N1", "abc dabc"), ("N2", "abcdabc")]);
        assert_eq!(index.search_substring("abcdab"), vec![nid("N2")]);
    }

    #[test]
    fn short_queries_fall_back_to_scan() {
        let (_dir, index) = build(&[("N1", "Go"), ("N2", "Rust"), ("N3", "gopher")]);
        assert_eq!(index.search_substring("go"), vec![nid("N1"), nid("N3")]);
    }

    #[test]
    fn flush_and_reopen_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("fts.stft");
        {
            let mut index = FtsIndex::open(&path).unwrap();
            let id = nid("N1");
            index.rebuild([(&id, "hello world")].into_iter());
            index.flush().unwrap();
        }
        let reopened = FtsIndex::open(&path).unwrap();
        assert_eq!(reopened.search_substring("world"), vec![nid("N1")]);
    }
}
