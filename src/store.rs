// Embedded Table Store
// Single-file store per workspace holding the normalized tables the
// indexer projects snapshots into. The whole table set lives in memory
// behind an Arc swap; commits persist a bincode image via temp-file +
// rename, so a crash mid-commit leaves the previous state intact.
//
// Concurrency model: many readers (cheap Arc clones of the table set),
// one writer (tokio mutex held for the life of a transaction).

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::errors::SupertagError;
use crate::types::{DocType, FieldDataType, NodeId, NormalizedName};

const STORE_MAGIC: &[u8; 4] = b"STDB";
pub const SCHEMA_VERSION: u32 = 3;

/// Traversal guard for parent walks; node graphs may be cyclic through
/// dangling or imported parents.
pub const MAX_ANCESTOR_DEPTH: usize = 100;

/// One node of the user's graph, with the raw source record preserved
/// verbatim for fields not yet normalized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub id: NodeId,
    pub name: Option<String>,
    pub parent_id: Option<NodeId>,
    pub doc_type: Option<DocType>,
    pub created: Option<i64>,
    pub updated: Option<i64>,
    pub done_at: Option<i64>,
    pub flags: Option<i64>,
    pub entity_override: Option<bool>,
    /// Normalized signature over (name, parent, doc_type, ordered
    /// children); drives delta computation between snapshots.
    pub signature: [u8; 32],
    /// Original record bytes, untouched.
    pub raw: Vec<u8>,
}

/// Directed edge between nodes. Duplicates are permitted; queries dedupe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceRow {
    pub from_node: NodeId,
    pub to_node: NodeId,
    pub reference_type: String,
}

/// "Data node carries tag", with the carrier tuple recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagApplicationRow {
    pub tuple_node_id: NodeId,
    pub data_node_id: NodeId,
    pub tag_id: NodeId,
    pub tag_name: String,
}

/// One value of one field on one node.
///
/// # Invariants
/// - `(parent_id, field_def_id, value_order)` is unique (enforced by the
///   table key).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldValueRow {
    pub tuple_id: NodeId,
    pub parent_id: NodeId,
    pub field_def_id: NodeId,
    pub field_name: String,
    pub value_node_id: Option<NodeId>,
    pub value_text: Option<String>,
    pub value_order: u32,
}

/// Supertag metadata derived from a tagDef record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupertagRow {
    pub tag_id: NodeId,
    pub tag_name: String,
    pub normalized_name: NormalizedName,
    pub description: Option<String>,
    pub color: Option<String>,
}

/// A field definition owned by a supertag.
///
/// # Invariants
/// - `(tag_id, field_label_id)` unique (table key)
/// - `field_order` total-orders fields within a tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupertagFieldRow {
    pub tag_id: NodeId,
    pub field_name: String,
    pub field_label_id: NodeId,
    pub field_order: u32,
    pub normalized_name: NormalizedName,
    pub description: Option<String>,
    pub inferred_data_type: FieldDataType,
    pub target_supertag_id: Option<NodeId>,
    pub default_value_id: Option<NodeId>,
}

/// Secondary indexes rebuilt from the persisted tables on load and after
/// every committed mutation. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct DerivedIndexes {
    /// parent -> child ids, in id order.
    pub children: HashMap<NodeId, Vec<NodeId>>,
    /// tag id -> data node ids carrying it.
    pub nodes_by_tag: HashMap<NodeId, Vec<NodeId>>,
    /// target -> referencing node ids.
    pub inbound_refs: HashMap<NodeId, Vec<NodeId>>,
}

/// The complete normalized table set for one workspace.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tables {
    pub schema_version: u32,
    pub nodes: BTreeMap<NodeId, NodeRow>,
    /// Keyed by `from_node`; deleting a node drops its outbound edges.
    pub references: BTreeMap<NodeId, Vec<ReferenceRow>>,
    /// Keyed by `data_node_id`.
    pub tag_applications: BTreeMap<NodeId, Vec<TagApplicationRow>>,
    /// parent -> (field_def, value_order) -> row.
    pub field_values: BTreeMap<NodeId, BTreeMap<(NodeId, u32), FieldValueRow>>,
    pub field_names: BTreeMap<NodeId, String>,
    pub supertags: BTreeMap<NodeId, SupertagRow>,
    /// tag -> field_label -> row.
    pub supertag_fields: BTreeMap<NodeId, BTreeMap<NodeId, SupertagFieldRow>>,
    /// child tag -> parent tags. Acyclic; the indexer rejects edges that
    /// would close a cycle before they reach this table.
    pub supertag_parents: BTreeMap<NodeId, Vec<NodeId>>,
    /// Snapshot filename of the last successful index run.
    pub export_file: Option<String>,
    pub last_indexed_ms: Option<i64>,
    #[serde(skip)]
    pub derived: DerivedIndexes,
}

impl Tables {
    pub fn node(&self, id: &NodeId) -> Option<&NodeRow> {
        self.nodes.get(id)
    }

    /// Tags applied to a data node. Empty slice when untagged.
    pub fn tags_of(&self, id: &NodeId) -> &[TagApplicationRow] {
        self.tag_applications
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn nodes_with_tag(&self, tag_id: &NodeId) -> &[NodeId] {
        self.derived
            .nodes_by_tag
            .get(tag_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn children_of(&self, id: &NodeId) -> &[NodeId] {
        self.derived
            .children
            .get(id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Field value rows anchored on `parent`, in (field, order) order.
    pub fn field_values_of<'a>(
        &'a self,
        parent: &NodeId,
    ) -> impl Iterator<Item = &'a FieldValueRow> + 'a {
        self.field_values
            .get(parent)
            .into_iter()
            .flat_map(|m| m.values())
    }

    pub fn outbound_refs(&self, from: &NodeId) -> &[ReferenceRow] {
        self.references
            .get(from)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    /// Climb `parent_id` until `pred` accepts a node. A dangling parent
    /// terminates the walk; depth is capped so reference cycles cannot
    /// spin forever.
    pub fn find_ancestor<'a>(
        &'a self,
        start: &NodeId,
        pred: impl Fn(&NodeRow) -> bool,
    ) -> Option<&'a NodeRow> {
        let mut current = self.nodes.get(start)?;
        for _ in 0..MAX_ANCESTOR_DEPTH {
            if pred(current) {
                return Some(current);
            }
            let parent = current.parent_id.as_ref()?;
            current = self.nodes.get(parent)?;
        }
        None
    }

    /// Nearest ancestor (inclusive) carrying any tag application.
    pub fn find_tagged_ancestor<'a>(&'a self, start: &NodeId) -> Option<&'a NodeRow> {
        self.find_ancestor(start, |n| !self.tags_of(&n.id).is_empty())
    }

    /// Nearest ancestor (inclusive) with a non-null name.
    pub fn find_named_ancestor<'a>(&'a self, start: &NodeId) -> Option<&'a NodeRow> {
        self.find_ancestor(start, |n| n.name.is_some())
    }

    /// Named ancestors from the node upward, nearest first, capped.
    pub fn named_ancestor_chain<'a>(&'a self, start: &NodeId, max: usize) -> Vec<&'a NodeRow> {
        let mut chain = Vec::new();
        let mut current = match self.nodes.get(start) {
            Some(n) => n,
            None => return chain,
        };
        for _ in 0..MAX_ANCESTOR_DEPTH {
            let parent = match current.parent_id.as_ref() {
                Some(p) => p,
                None => break,
            };
            current = match self.nodes.get(parent) {
                Some(n) => n,
                None => break,
            };
            if current.name.is_some() {
                chain.push(current);
                if chain.len() >= max {
                    break;
                }
            }
        }
        chain
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            nodes: self.nodes.len(),
            references: self.references.values().map(Vec::len).sum(),
            tag_applications: self.tag_applications.values().map(Vec::len).sum(),
            field_values: self.field_values.values().map(BTreeMap::len).sum(),
            supertags: self.supertags.len(),
            supertag_fields: self.supertag_fields.values().map(BTreeMap::len).sum(),
            export_file: self.export_file.clone(),
            last_indexed_ms: self.last_indexed_ms,
        }
    }

    /// Recompute every derived index from the persisted tables.
    pub fn rebuild_derived(&mut self) {
        let mut derived = DerivedIndexes::default();
        for (id, row) in &self.nodes {
            if let Some(parent) = &row.parent_id {
                derived
                    .children
                    .entry(parent.clone())
                    .or_default()
                    .push(id.clone());
            }
        }
        for apps in self.tag_applications.values() {
            for app in apps {
                derived
                    .nodes_by_tag
                    .entry(app.tag_id.clone())
                    .or_default()
                    .push(app.data_node_id.clone());
            }
        }
        for refs in self.references.values() {
            for r in refs {
                derived
                    .inbound_refs
                    .entry(r.to_node.clone())
                    .or_default()
                    .push(r.from_node.clone());
            }
        }
        for ids in derived.nodes_by_tag.values_mut() {
            ids.sort();
            ids.dedup();
        }
        self.derived = derived;
    }
}

/// Snapshot of table counts for `stats` surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    pub nodes: usize,
    pub references: usize,
    pub tag_applications: usize,
    pub field_values: usize,
    pub supertags: usize,
    pub supertag_fields: usize,
    pub export_file: Option<String>,
    pub last_indexed_ms: Option<i64>,
}

/// Forward-only migrations. Each step is idempotent: re-deriving data
/// that is already present leaves it unchanged.
fn apply_migrations(tables: &mut Tables) -> Result<bool> {
    if tables.schema_version > SCHEMA_VERSION {
        bail!(SupertagError::DatabaseCorrupt(format!(
            "store schema v{} is newer than supported v{}",
            tables.schema_version, SCHEMA_VERSION
        )));
    }
    let mut changed = false;
    while tables.schema_version < SCHEMA_VERSION {
        match tables.schema_version {
            // v0 -> v1: initial table set; nothing to transform.
            0 => {}
            // v1 -> v2: normalized names on supertags and fields.
            1 => {
                for tag in tables.supertags.values_mut() {
                    tag.normalized_name = NormalizedName::of(&tag.tag_name);
                }
                for fields in tables.supertag_fields.values_mut() {
                    for field in fields.values_mut() {
                        field.normalized_name = NormalizedName::of(&field.field_name);
                    }
                }
            }
            // v2 -> v3: field-name lookup table backfilled from the
            // field definitions and value rows.
            2 => {
                let mut names: BTreeMap<NodeId, String> = BTreeMap::new();
                for fields in tables.supertag_fields.values() {
                    for field in fields.values() {
                        names.insert(field.field_label_id.clone(), field.field_name.clone());
                    }
                }
                for values in tables.field_values.values() {
                    for row in values.values() {
                        names
                            .entry(row.field_def_id.clone())
                            .or_insert_with(|| row.field_name.clone());
                    }
                }
                tables.field_names = names;
            }
            v => bail!("no migration path from schema version {v}"),
        }
        tables.schema_version += 1;
        changed = true;
        debug!(version = tables.schema_version, "store migration applied");
    }
    Ok(changed)
}

/// Single-file embedded store for one workspace.
pub struct Store {
    path: PathBuf,
    tables: Arc<parking_lot::RwLock<Arc<Tables>>>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Store {
    /// Open (or create) the store file and bring it to the current
    /// schema version.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let mut tables = if path.exists() {
            read_image(&path)?
        } else {
            info!(path = %path.display(), "creating new store");
            Tables::default()
        };

        let migrated = apply_migrations(&mut tables)?;
        tables.rebuild_derived();

        let store = Self {
            path,
            tables: Arc::new(parking_lot::RwLock::new(Arc::new(tables))),
            write_lock: Arc::new(tokio::sync::Mutex::new(())),
        };
        if migrated {
            store.persist_current()?;
        }
        Ok(store)
    }

    /// Open an existing store, failing with `DatabaseNotFound` when the
    /// file is absent. Read surfaces use this so a missing index run is
    /// reported as such instead of silently creating an empty store.
    pub fn open_existing(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            bail!(SupertagError::DatabaseNotFound(path.display().to_string()));
        }
        Self::open(path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Consistent point-in-time view of the tables. Cheap (Arc clone);
    /// the view never observes a partially applied transaction.
    pub fn snapshot(&self) -> Arc<Tables> {
        self.tables.read().clone()
    }

    /// Re-run migrations; a no-op when the store is current.
    pub fn initialize_schema(&self) -> Result<()> {
        let mut working = (*self.snapshot()).clone();
        if apply_migrations(&mut working)? {
            working.rebuild_derived();
            self.install(working)?;
        }
        Ok(())
    }

    /// Begin a write transaction, waiting for any active writer.
    pub async fn begin(&self) -> StoreTxn {
        let guard = self.write_lock.clone().lock_owned().await;
        StoreTxn {
            path: self.path.clone(),
            handle: self.tables.clone(),
            tables: (*self.snapshot()).clone(),
            _guard: guard,
        }
    }

    /// Begin without waiting; `DatabaseLocked` when a writer is active.
    pub fn try_begin(&self) -> Result<StoreTxn> {
        let guard = self
            .write_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| SupertagError::DatabaseLocked)?;
        Ok(StoreTxn {
            path: self.path.clone(),
            handle: self.tables.clone(),
            tables: (*self.snapshot()).clone(),
            _guard: guard,
        })
    }

    fn install(&self, mut tables: Tables) -> Result<()> {
        tables.rebuild_derived();
        write_image(&self.path, &tables)?;
        *self.tables.write() = Arc::new(tables);
        Ok(())
    }

    fn persist_current(&self) -> Result<()> {
        write_image(&self.path, &self.snapshot())
    }

    pub fn file_size(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }
}

/// A write transaction over a private copy of the tables.
///
/// Dropping the transaction without calling [`StoreTxn::commit`] rolls
/// back: the working copy is discarded and readers never saw it.
pub struct StoreTxn {
    path: PathBuf,
    handle: Arc<parking_lot::RwLock<Arc<Tables>>>,
    pub tables: Tables,
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

impl StoreTxn {
    /// Persist the working copy and make it visible to readers.
    ///
    /// The image is written to a temp file and renamed over the store
    /// file, so the on-disk state is always either the previous or the
    /// new full state, never partial.
    pub fn commit(mut self) -> Result<()> {
        self.tables.rebuild_derived();
        write_image(&self.path, &self.tables)?;
        *self.handle.write() = Arc::new(self.tables);
        Ok(())
    }
}

fn read_image(path: &Path) -> Result<Tables> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading store file {}", path.display()))?;
    if bytes.len() < 8 || &bytes[..4] != STORE_MAGIC {
        bail!(SupertagError::DatabaseCorrupt(format!(
            "{} is not a supertag store",
            path.display()
        )));
    }
    let tables: Tables = bincode::deserialize(&bytes[8..]).map_err(|e| {
        SupertagError::DatabaseCorrupt(format!("{}: {e}", path.display()))
    })?;
    Ok(tables)
}

fn write_image(path: &Path, tables: &Tables) -> Result<()> {
    let tmp = path.with_extension("stdb.tmp");
    {
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(STORE_MAGIC)?;
        file.write_all(&tables.schema_version.to_le_bytes())?;
        let body = bincode::serialize(tables).context("encoding store image")?;
        file.write_all(&body)?;
        file.sync_all()?;
    }
    std::fs::rename(&tmp, path)
        .with_context(|| format!("installing store image {}", path.display()))?;
    Ok(())
}

/// Convenience constructor mirroring the snapshot record shape; used by
/// the indexer's staging pass and by tests.
impl NodeRow {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        name: Option<String>,
        parent_id: Option<NodeId>,
        doc_type: Option<DocType>,
        created: Option<i64>,
        updated: Option<i64>,
        signature: [u8; 32],
        raw: Vec<u8>,
    ) -> Self {
        Self {
            id,
            name,
            parent_id,
            doc_type,
            created,
            updated,
            done_at: None,
            flags: None,
            entity_override: None,
            signature,
            raw,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn node(id: &str, name: &str, parent: Option<&str>) -> NodeRow {
        NodeRow::new(
            nid(id),
            Some(name.to_string()),
            parent.map(nid),
            None,
            Some(1),
            Some(1),
            [0u8; 32],
            Vec::new(),
        )
    }

    #[tokio::test]
    async fn commit_makes_changes_visible_and_durable() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("store.stdb");
        let store = Store::open(&path)?;

        let mut txn = store.begin().await;
        txn.tables.nodes.insert(nid("N1"), node("N1", "hello", None));
        txn.commit()?;

        assert_eq!(store.snapshot().nodes.len(), 1);

        // Reopen from disk: the committed state survives.
        drop(store);
        let reopened = Store::open(&path)?;
        assert!(reopened.snapshot().node(&nid("N1")).is_some());
        Ok(())
    }

    #[tokio::test]
    async fn dropped_transaction_rolls_back() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path().join("store.stdb"))?;

        {
            let mut txn = store.begin().await;
            txn.tables.nodes.insert(nid("N1"), node("N1", "x", None));
            // no commit
        }
        assert!(store.snapshot().nodes.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn second_writer_gets_database_locked() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path().join("store.stdb"))?;

        let _txn = store.begin().await;
        let err = store.try_begin().err().expect("second writer must fail");
        let kind = err
            .downcast_ref::<SupertagError>()
            .map(SupertagError::kind_name);
        assert_eq!(kind, Some("DatabaseLocked"));
        Ok(())
    }

    #[tokio::test]
    async fn derived_indexes_track_children_and_tags() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path().join("store.stdb"))?;

        let mut txn = store.begin().await;
        txn.tables.nodes.insert(nid("P"), node("P", "parent", None));
        txn.tables.nodes.insert(nid("C1"), node("C1", "a", Some("P")));
        txn.tables.nodes.insert(nid("C2"), node("C2", "b", Some("P")));
        txn.tables.tag_applications.insert(
            nid("C1"),
            vec![TagApplicationRow {
                tuple_node_id: nid("T1"),
                data_node_id: nid("C1"),
                tag_id: nid("tagXmeeting"),
                tag_name: "meeting".into(),
            }],
        );
        txn.commit()?;

        let tables = store.snapshot();
        assert_eq!(tables.children_of(&nid("P")).len(), 2);
        assert_eq!(tables.nodes_with_tag(&nid("tagXmeeting")), &[nid("C1")]);
        assert_eq!(tables.tags_of(&nid("C1"))[0].tag_name, "meeting");
        Ok(())
    }

    #[tokio::test]
    async fn ancestor_walks_stop_at_dangling_parents() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path().join("store.stdb"))?;

        let mut txn = store.begin().await;
        let mut fragment = node("F", "fragment", Some("MISSING"));
        fragment.name = None;
        txn.tables.nodes.insert(nid("F"), fragment);
        txn.commit()?;

        let tables = store.snapshot();
        assert!(tables.find_named_ancestor(&nid("F")).is_none());
        Ok(())
    }

    #[test]
    fn corrupt_file_is_reported_as_corrupt() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("store.stdb");
        std::fs::write(&path, b"not a store at all")?;

        let err = Store::open(&path).err().expect("open must fail");
        let kind = err
            .downcast_ref::<SupertagError>()
            .map(SupertagError::kind_name);
        assert_eq!(kind, Some("DatabaseCorrupt"));
        Ok(())
    }

    #[test]
    fn initialize_schema_is_idempotent() -> Result<()> {
        let dir = TempDir::new()?;
        let store = Store::open(dir.path().join("store.stdb"))?;
        assert_eq!(store.snapshot().schema_version, SCHEMA_VERSION);
        store.initialize_schema()?;
        store.initialize_schema()?;
        assert_eq!(store.snapshot().schema_version, SCHEMA_VERSION);
        Ok(())
    }

    #[test]
    fn open_existing_requires_a_file() {
        let dir = TempDir::new().unwrap();
        let err = Store::open_existing(dir.path().join("missing.stdb"))
            .err()
            .expect("must fail");
        let kind = err
            .downcast_ref::<SupertagError>()
            .map(SupertagError::kind_name);
        assert_eq!(kind, Some("DatabaseNotFound"));
    }
}
