// Schema Service
// Read-side view of the supertag catalog: name/id lookup, inheritance
// closure with diamond deduplication, field-type inference and the
// stable catalog document. All operations are referentially transparent
// over one store snapshot; the tables stay authoritative and the
// catalog document is an export.

use anyhow::{bail, Context, Result};
use once_cell::sync::Lazy;
use petgraph::algo::has_path_connecting;
use petgraph::graphmap::DiGraphMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;

use crate::errors::SupertagError;
use crate::store::{Store, SupertagFieldRow, Tables};
use crate::types::{FieldDataType, NodeId, NormalizedName};

/// A supertag with its own fields and direct parents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Supertag {
    pub id: NodeId,
    pub name: String,
    pub normalized_name: NormalizedName,
    pub description: Option<String>,
    pub color: Option<String>,
    pub parents: Vec<NodeId>,
    pub fields: Vec<SupertagFieldRow>,
}

/// Infer a field's data type from its name. First matching rule wins.
///
/// The phone exception sits before the number rule so "Phone number"
/// stays text instead of becoming numeric.
pub fn infer_data_type(field_name: &str) -> FieldDataType {
    // Case-insensitive prefix, case-sensitive boundary: the uppercase
    // class must still see the original name so camelCase ("isDone")
    // counts as a word boundary while "island" does not.
    static CHECKBOX_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^(?i:is|has)(?:[A-Z\s_?-]|$)").expect("checkbox regex"));

    let lower = field_name.to_lowercase();
    if lower.contains("phone") {
        return FieldDataType::Text;
    }
    if lower.contains("date") || lower.contains("time") {
        return FieldDataType::Date;
    }
    if lower.contains("url") || lower.contains("link") {
        return FieldDataType::Url;
    }
    if lower.contains("count") || lower.contains("number") || lower.contains("amount") {
        return FieldDataType::Number;
    }
    if lower.contains("status") || lower.contains("type") || lower.contains("category") {
        return FieldDataType::Reference;
    }
    if CHECKBOX_RE.is_match(field_name) {
        return FieldDataType::Checkbox;
    }
    if lower.contains("enabled") || lower.contains("completed") {
        return FieldDataType::Checkbox;
    }
    FieldDataType::Text
}

/// Supertag inheritance DAG with cycle rejection.
///
/// # Invariants
/// - Acyclic: an edge that would close a cycle raises `CycleDetected`
///   and leaves the graph unchanged.
#[derive(Debug, Default)]
pub struct SupertagGraph {
    graph: DiGraphMap<u32, ()>,
    ids: HashMap<NodeId, u32>,
    next: u32,
}

impl SupertagGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn intern(&mut self, id: &NodeId) -> u32 {
        if let Some(&n) = self.ids.get(id) {
            return n;
        }
        let n = self.next;
        self.next += 1;
        self.ids.insert(id.clone(), n);
        self.graph.add_node(n);
        n
    }

    /// Add `child extends parent`.
    pub fn add_edge(&mut self, child: &NodeId, parent: &NodeId) -> Result<()> {
        if child == parent {
            bail!(SupertagError::CycleDetected {
                child: child.to_string(),
                parent: parent.to_string(),
            });
        }
        let c = self.intern(child);
        let p = self.intern(parent);
        if has_path_connecting(&self.graph, p, c, None) {
            bail!(SupertagError::CycleDetected {
                child: child.to_string(),
                parent: parent.to_string(),
            });
        }
        self.graph.add_edge(c, p, ());
        Ok(())
    }
}

// Core lookups as free functions over one table snapshot, so the query
// engine can share the exact view it is executing against.

pub fn supertag_in(tables: &Tables, id: &NodeId) -> Option<Supertag> {
    let row = tables.supertags.get(id)?;
    Some(Supertag {
        id: row.tag_id.clone(),
        name: row.tag_name.clone(),
        normalized_name: row.normalized_name.clone(),
        description: row.description.clone(),
        color: row.color.clone(),
        parents: tables
            .supertag_parents
            .get(id)
            .cloned()
            .unwrap_or_default(),
        fields: own_fields_in(tables, id),
    })
}

/// Resolve by exact name first, then by normalized name.
pub fn supertag_by_name_in(tables: &Tables, name: &str) -> Option<Supertag> {
    if let Some(row) = tables.supertags.values().find(|t| t.tag_name == name) {
        return supertag_in(tables, &row.tag_id.clone());
    }
    let normalized = NormalizedName::of(name);
    if normalized.is_empty() {
        return None;
    }
    tables
        .supertags
        .values()
        .find(|t| t.normalized_name == normalized)
        .and_then(|row| supertag_in(tables, &row.tag_id.clone()))
}

/// Own fields only, ordered by `field_order`.
pub fn own_fields_in(tables: &Tables, tag_id: &NodeId) -> Vec<SupertagFieldRow> {
    let mut fields: Vec<SupertagFieldRow> = tables
        .supertag_fields
        .get(tag_id)
        .map(|m| m.values().cloned().collect())
        .unwrap_or_default();
    fields.sort_by_key(|f| f.field_order);
    fields
}

/// Own plus inherited fields, breadth-first from the tag.
///
/// Diamond parents are visited once; fields are deduplicated by
/// normalized name keeping the first occurrence in traversal order, so
/// a child field shadows a same-named parent field at any depth.
pub fn all_fields_in(tables: &Tables, tag_id: &NodeId) -> Vec<SupertagFieldRow> {
    let mut queue: VecDeque<NodeId> = VecDeque::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut seen_names: HashSet<NormalizedName> = HashSet::new();
    let mut out: Vec<SupertagFieldRow> = Vec::new();

    queue.push_back(tag_id.clone());
    visited.insert(tag_id.clone());

    while let Some(current) = queue.pop_front() {
        for field in own_fields_in(tables, &current) {
            if seen_names.insert(field.normalized_name.clone()) {
                out.push(field);
            }
        }
        if let Some(parents) = tables.supertag_parents.get(&current) {
            for parent in parents {
                if visited.insert(parent.clone()) {
                    queue.push_back(parent.clone());
                }
            }
        }
    }
    out
}

pub fn field_by_normalized_name_in(
    tables: &Tables,
    tag_id: &NodeId,
    name: &str,
) -> Option<SupertagFieldRow> {
    let wanted = NormalizedName::of(name);
    all_fields_in(tables, tag_id)
        .into_iter()
        .find(|f| f.normalized_name == wanted)
}

/// Read service over the live store. Each call operates on a fresh
/// consistent snapshot of the tables.
pub struct SchemaService {
    store: Arc<Store>,
}

impl SchemaService {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    fn tables(&self) -> Arc<Tables> {
        self.store.snapshot()
    }

    pub fn get_supertag(&self, name: &str) -> Result<Supertag> {
        supertag_by_name_in(&self.tables(), name)
            .ok_or_else(|| SupertagError::TagNotFound(name.to_string()).into())
    }

    pub fn get_supertag_by_id(&self, id: &NodeId) -> Result<Supertag> {
        supertag_in(&self.tables(), id)
            .ok_or_else(|| SupertagError::TagNotFound(id.to_string()).into())
    }

    /// All supertags, ordered by name (ties broken by id).
    pub fn list_supertags(&self) -> Vec<Supertag> {
        let tables = self.tables();
        let mut tags: Vec<Supertag> = tables
            .supertags
            .keys()
            .filter_map(|id| supertag_in(&tables, id))
            .collect();
        tags.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        tags
    }

    /// Case-insensitive substring match on name and normalized name.
    pub fn search_supertags(&self, query: &str) -> Vec<Supertag> {
        let needle = query.to_lowercase();
        let normalized = NormalizedName::of(query);
        self.list_supertags()
            .into_iter()
            .filter(|t| {
                t.name.to_lowercase().contains(&needle)
                    || (!normalized.is_empty()
                        && t.normalized_name.as_str().contains(normalized.as_str()))
            })
            .collect()
    }

    pub fn fields(&self, tag_id: &NodeId) -> Vec<SupertagFieldRow> {
        own_fields_in(&self.tables(), tag_id)
    }

    pub fn all_fields(&self, tag_id: &NodeId) -> Vec<SupertagFieldRow> {
        all_fields_in(&self.tables(), tag_id)
    }

    pub fn field_by_normalized_name(
        &self,
        tag_id: &NodeId,
        name: &str,
    ) -> Option<SupertagFieldRow> {
        field_by_normalized_name_in(&self.tables(), tag_id, name)
    }

    /// Export the catalog as a stable document.
    pub fn to_catalog_document(&self) -> CatalogDocument {
        catalog_from_tables(&self.tables())
    }

    /// Serialize the catalog to `path` with write-then-rename so
    /// concurrent readers never observe a partial document.
    pub fn write_catalog(&self, path: &Path) -> Result<()> {
        let doc = self.to_catalog_document();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(&doc).context("encoding catalog document")?;
        std::fs::write(&tmp, body.as_bytes())?;
        std::fs::rename(&tmp, path)
            .with_context(|| format!("installing catalog {}", path.display()))?;
        Ok(())
    }
}

/// Stable serialized catalog. Key order follows struct order; optional
/// attributes are absent (never null) when missing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogDocument {
    pub version: u32,
    pub supertags: Vec<CatalogSupertag>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogSupertag {
    pub id: String,
    pub name: String,
    pub normalized_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extends: Option<Vec<String>>,
    pub fields: Vec<CatalogField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogField {
    pub attribute_id: String,
    pub name: String,
    pub normalized_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
}

pub fn catalog_from_tables(tables: &Tables) -> CatalogDocument {
    let mut supertags: Vec<CatalogSupertag> = tables
        .supertags
        .keys()
        .filter_map(|id| supertag_in(tables, id))
        .map(|tag| CatalogSupertag {
            id: tag.id.to_string(),
            name: tag.name.clone(),
            normalized_name: tag.normalized_name.to_string(),
            description: tag.description.clone(),
            color: tag.color.clone(),
            extends: if tag.parents.is_empty() {
                None
            } else {
                Some(tag.parents.iter().map(NodeId::to_string).collect())
            },
            fields: tag
                .fields
                .iter()
                .map(|f| CatalogField {
                    attribute_id: f.field_label_id.to_string(),
                    name: f.field_name.clone(),
                    normalized_name: f.normalized_name.to_string(),
                    description: f.description.clone(),
                    data_type: Some(f.inferred_data_type.as_str().to_string()),
                })
                .collect(),
        })
        .collect();
    supertags.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
    CatalogDocument {
        version: 1,
        supertags,
    }
}

/// Parse a catalog document back. Together with
/// [`catalog_from_tables`] this round-trips the catalog subset.
pub fn from_catalog_document(value: &serde_json::Value) -> Result<CatalogDocument> {
    let doc: CatalogDocument = serde_json::from_value(value.clone())
        .map_err(|e| SupertagError::InvalidFormat(format!("catalog document: {e}")))?;
    if doc.version != 1 {
        bail!(SupertagError::InvalidFormat(format!(
            "unsupported catalog version {}",
            doc.version
        )));
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SupertagRow;
    use std::collections::BTreeMap;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    fn tag(tables: &mut Tables, id: &str, name: &str) {
        tables.supertags.insert(
            nid(id),
            SupertagRow {
                tag_id: nid(id),
                tag_name: name.to_string(),
                normalized_name: NormalizedName::of(name),
                description: None,
                color: None,
            },
        );
    }

    fn field(tables: &mut Tables, tag_id: &str, label: &str, name: &str, order: u32) {
        tables
            .supertag_fields
            .entry(nid(tag_id))
            .or_insert_with(BTreeMap::new)
            .insert(
                nid(label),
                SupertagFieldRow {
                    tag_id: nid(tag_id),
                    field_name: name.to_string(),
                    field_label_id: nid(label),
                    field_order: order,
                    normalized_name: NormalizedName::of(name),
                    description: None,
                    inferred_data_type: infer_data_type(name),
                    target_supertag_id: None,
                    default_value_id: None,
                },
            );
    }

    #[test]
    fn inference_rules_in_order() {
        assert_eq!(infer_data_type("Phone number"), FieldDataType::Text);
        assert_eq!(infer_data_type("Due Date"), FieldDataType::Date);
        assert_eq!(infer_data_type("Start time"), FieldDataType::Date);
        assert_eq!(infer_data_type("Website URL"), FieldDataType::Url);
        assert_eq!(infer_data_type("Permalink"), FieldDataType::Url);
        assert_eq!(infer_data_type("Item count"), FieldDataType::Number);
        assert_eq!(infer_data_type("Amount"), FieldDataType::Number);
        assert_eq!(infer_data_type("Status"), FieldDataType::Reference);
        assert_eq!(infer_data_type("Category"), FieldDataType::Reference);
        assert_eq!(infer_data_type("isDone"), FieldDataType::Checkbox);
        assert_eq!(infer_data_type("has attachment"), FieldDataType::Checkbox);
        assert_eq!(infer_data_type("Is Done"), FieldDataType::Checkbox);
        assert_eq!(infer_data_type("Has Attachment"), FieldDataType::Checkbox);
        assert_eq!(infer_data_type("Enabled"), FieldDataType::Checkbox);
        assert_eq!(infer_data_type("Completed"), FieldDataType::Checkbox);
        // No word boundary: not a checkbox.
        assert_eq!(infer_data_type("island"), FieldDataType::Text);
        assert_eq!(infer_data_type("Island"), FieldDataType::Text);
        assert_eq!(infer_data_type("Notes"), FieldDataType::Text);
    }

    #[test]
    fn cycle_rejection_leaves_graph_unchanged() {
        let mut graph = SupertagGraph::new();
        graph.add_edge(&nid("AAAAAAAA"), &nid("BBBBBBBB")).unwrap();
        graph.add_edge(&nid("BBBBBBBB"), &nid("CCCCCCCC")).unwrap();

        let err = graph
            .add_edge(&nid("CCCCCCCC"), &nid("AAAAAAAA"))
            .err()
            .expect("cycle must be rejected");
        assert_eq!(
            err.downcast_ref::<SupertagError>().map(|e| e.kind_name()),
            Some("CycleDetected")
        );
        // The rejected edge left the graph usable: an unrelated edge
        // from the same child still works.
        graph.add_edge(&nid("CCCCCCCC"), &nid("DDDDDDDD")).unwrap();
    }

    #[test]
    fn self_edge_is_a_cycle() {
        let mut graph = SupertagGraph::new();
        assert!(graph.add_edge(&nid("AAAAAAAA"), &nid("AAAAAAAA")).is_err());
    }

    #[test]
    fn all_fields_diamond_dedup_child_wins() {
        // D extends B and C; both extend A. "status" exists on A and C,
        // "priority" on B. Child D has its own "status".
        let mut tables = Tables::default();
        tag(&mut tables, "tagAAAAA", "base");
        tag(&mut tables, "tagBBBBB", "left");
        tag(&mut tables, "tagCCCCC", "right");
        tag(&mut tables, "tagDDDDD", "leaf");
        field(&mut tables, "tagAAAAA", "labStatA", "Status", 0);
        field(&mut tables, "tagAAAAA", "labOwner", "Owner", 1);
        field(&mut tables, "tagBBBBB", "labPrio1", "Priority", 0);
        field(&mut tables, "tagCCCCC", "labStatC", "Status", 0);
        field(&mut tables, "tagDDDDD", "labStatD", "Status", 0);
        tables
            .supertag_parents
            .insert(nid("tagDDDDD"), vec![nid("tagBBBBB"), nid("tagCCCCC")]);
        tables
            .supertag_parents
            .insert(nid("tagBBBBB"), vec![nid("tagAAAAA")]);
        tables
            .supertag_parents
            .insert(nid("tagCCCCC"), vec![nid("tagAAAAA")]);

        let fields = all_fields_in(&tables, &nid("tagDDDDD"));
        let names: Vec<&str> = fields.iter().map(|f| f.field_name.as_str()).collect();
        assert_eq!(names, vec!["Status", "Priority", "Owner"]);
        // The surviving Status is the child's own.
        assert_eq!(fields[0].field_label_id, nid("labStatD"));
    }

    #[test]
    fn all_fields_is_stable_under_parent_reordering() {
        let mut a = Tables::default();
        tag(&mut a, "tagXXXXX", "x");
        tag(&mut a, "tagYYYYY", "y");
        tag(&mut a, "tagZZZZZ", "z");
        field(&mut a, "tagYYYYY", "labAlpha", "Alpha", 0);
        field(&mut a, "tagZZZZZ", "labBeta", "Beta", 0);
        let mut b = a.clone();

        a.supertag_parents
            .insert(nid("tagXXXXX"), vec![nid("tagYYYYY"), nid("tagZZZZZ")]);
        b.supertag_parents
            .insert(nid("tagXXXXX"), vec![nid("tagZZZZZ"), nid("tagYYYYY")]);

        // Sibling order may shuffle the output order but never the
        // resolved field set.
        let mut fa: Vec<String> = all_fields_in(&a, &nid("tagXXXXX"))
            .iter()
            .map(|f| f.field_name.clone())
            .collect();
        let mut fb: Vec<String> = all_fields_in(&b, &nid("tagXXXXX"))
            .iter()
            .map(|f| f.field_name.clone())
            .collect();
        fa.sort();
        fb.sort();
        assert_eq!(fa, fb);
    }

    #[test]
    fn catalog_round_trips() {
        let mut tables = Tables::default();
        tag(&mut tables, "tagAAAAA", "meeting");
        field(&mut tables, "tagAAAAA", "labLoc01", "Location", 0);
        field(&mut tables, "tagAAAAA", "labDate01", "Due Date", 1);

        let doc = catalog_from_tables(&tables);
        let json = serde_json::to_value(&doc).unwrap();
        let parsed = from_catalog_document(&json).unwrap();
        assert_eq!(doc, parsed);

        // Absent-vs-null: missing description stays absent.
        let text = serde_json::to_string(&json).unwrap();
        assert!(!text.contains("\"description\":null"));
    }
}
