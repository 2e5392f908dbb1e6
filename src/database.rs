// Database
// Per-workspace wiring of the table store, the FTS index and the vector
// store. One Database per workspace; surfaces share it behind an Arc.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::fts::FtsIndex;
use crate::store::{Store, StoreStats};
use crate::vector_store::VectorStore;
use crate::workspace::{resolve, ConfigDocument, WorkspaceEntry, WorkspaceSelector};

/// On-disk layout of one workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabasePaths {
    pub db_path: PathBuf,
    pub vector_dir: PathBuf,
    pub schema_cache_path: PathBuf,
}

impl DatabasePaths {
    /// Conventional layout under one workspace directory.
    pub fn under(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        Self {
            db_path: dir.join("store.stdb"),
            vector_dir: dir.join("vectors"),
            schema_cache_path: dir.join("schema.json"),
        }
    }

    fn fts_path(&self) -> PathBuf {
        self.db_path.with_extension("stft")
    }
}

pub struct Database {
    pub store: Arc<Store>,
    pub fts: Arc<parking_lot::Mutex<FtsIndex>>,
    pub vectors: Arc<parking_lot::Mutex<VectorStore>>,
    pub paths: DatabasePaths,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseStats {
    pub store: StoreStats,
    pub store_bytes: u64,
    pub fts_nodes: usize,
    pub embeddings: usize,
}

impl Database {
    /// Open (creating on demand) every component of a workspace.
    pub fn open(paths: DatabasePaths) -> Result<Self> {
        let store = Arc::new(Store::open(&paths.db_path)?);
        let fts = FtsIndex::open(paths.fts_path())?;
        let vectors = VectorStore::open(&paths.vector_dir)?;
        Ok(Self {
            store,
            fts: Arc::new(parking_lot::Mutex::new(fts)),
            vectors: Arc::new(parking_lot::Mutex::new(vectors)),
            paths,
        })
    }

    /// Open for reading; fails with `DatabaseNotFound` when the store
    /// file does not exist yet.
    pub fn open_existing(paths: DatabasePaths) -> Result<Self> {
        let store = Arc::new(Store::open_existing(&paths.db_path)?);
        let fts = FtsIndex::open(paths.fts_path())?;
        let vectors = VectorStore::open(&paths.vector_dir)?;
        Ok(Self {
            store,
            fts: Arc::new(parking_lot::Mutex::new(fts)),
            vectors: Arc::new(parking_lot::Mutex::new(vectors)),
            paths,
        })
    }

    pub fn stats(&self) -> DatabaseStats {
        DatabaseStats {
            store: self.store.snapshot().stats(),
            store_bytes: self.store.file_size(),
            fts_nodes: self.fts.lock().len(),
            embeddings: self.vectors.lock().len(),
        }
    }
}

/// Cache of open databases keyed by store path, shared by the long
/// running surfaces (webhook, MCP). Resolution goes through the
/// workspace configuration; each distinct store is opened once.
pub struct DatabaseRegistry {
    config: ConfigDocument,
    open: dashmap::DashMap<PathBuf, Arc<Database>>,
}

impl DatabaseRegistry {
    pub fn new(config: ConfigDocument) -> Self {
        Self {
            config,
            open: dashmap::DashMap::new(),
        }
    }

    pub fn config(&self) -> &ConfigDocument {
        &self.config
    }

    /// Resolve a selector and return the (cached) open database.
    pub fn database(&self, selector: &WorkspaceSelector) -> Result<(WorkspaceEntry, Arc<Database>)> {
        let entry = resolve(&self.config, selector)?;
        if let Some(db) = self.open.get(&entry.db_path) {
            return Ok((entry, db.clone()));
        }
        let db = Arc::new(Database::open_existing(entry.database_paths())?);
        self.open.insert(entry.db_path.clone(), db.clone());
        Ok((entry, db))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn open_creates_layout_and_stats_work() -> Result<()> {
        let dir = TempDir::new()?;
        let db = Database::open(DatabasePaths::under(dir.path()))?;
        let stats = db.stats();
        assert_eq!(stats.store.nodes, 0);
        assert_eq!(stats.embeddings, 0);
        assert!(dir.path().join("store.stdb").exists());
        Ok(())
    }

    #[test]
    fn open_existing_requires_an_indexed_store() {
        let dir = TempDir::new().unwrap();
        assert!(Database::open_existing(DatabasePaths::under(dir.path())).is_err());
    }
}
