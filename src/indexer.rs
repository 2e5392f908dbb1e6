// Ingestion Engine
// Projects one snapshot into the normalized store atomically. Streams
// records, classifies them by `_docType`, computes the delta against the
// previously indexed state, re-derives the supertag catalog and rebuilds
// the FTS index, all inside a single write transaction. On any failure
// the transaction is dropped and readers keep the prior state.

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, warn};

use crate::contracts::CancellationToken;
use crate::database::Database;
use crate::errors::SupertagError;
use crate::schema::{infer_data_type, SupertagGraph};
use crate::snapshot::{RecordItem, RecordProps, SnapshotReader};
use crate::store::{
    FieldValueRow, NodeRow, ReferenceRow, SupertagFieldRow, SupertagRow, TagApplicationRow,
};
use crate::types::{DocType, NodeId, NormalizedName};

static INLINE_REF_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\[\[([A-Za-z0-9_-]+)\]\]").expect("inline ref regex"));

/// Knobs for one index run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub cancellation: CancellationToken,
    pub show_progress: bool,
    /// Cancellation is checked once per this many records.
    pub batch_size: usize,
}

impl Default for IndexOptions {
    fn default() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            show_progress: false,
            batch_size: 1024,
        }
    }
}

/// Outcome of one index run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexReport {
    pub added: usize,
    pub modified: usize,
    pub deleted: usize,
    pub nodes_total: usize,
    pub supertags_total: usize,
    pub fields_total: usize,
    pub refs_total: usize,
    pub tag_apps_total: usize,
    pub skipped_records: usize,
    pub duration_ms: u64,
    pub export_file: String,
}

/// Apply forward-only migrations to the open store; idempotent.
pub fn initialize_schema(db: &Database) -> Result<()> {
    db.store.initialize_schema()
}

/// A record as staged during the streaming pass, before classification.
struct StagedRecord {
    id: NodeId,
    props: RecordProps,
    children: Vec<NodeId>,
    raw: String,
}

impl StagedRecord {
    fn doc_type(&self) -> Option<DocType> {
        self.props.doc_type.as_deref().map(DocType::parse)
    }

    fn name(&self) -> Option<&str> {
        self.props.name.as_deref()
    }
}

/// Index one snapshot file into the workspace store.
///
/// The write lock is held for the whole run; readers see either the
/// previous or the new committed state. Malformed records are counted
/// and skipped; only top-level malformation aborts with
/// `CorruptSnapshot`.
pub async fn index_snapshot(
    db: &Database,
    path: &Path,
    options: &IndexOptions,
) -> Result<IndexReport> {
    let started = Instant::now();
    let reader = SnapshotReader::open(path)?;
    let mut txn = db.store.begin().await;

    let progress = if options.show_progress {
        let bar = ProgressBar::new_spinner();
        bar.set_style(
            ProgressStyle::with_template("{spinner} {msg} ({pos} records)")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message("indexing snapshot");
        Some(bar)
    } else {
        None
    };

    // Pass 1: stream every record into staging.
    let mut staged: BTreeMap<NodeId, StagedRecord> = BTreeMap::new();
    let mut order: Vec<NodeId> = Vec::new();
    let mut skipped = 0usize;
    let mut seen = 0usize;

    for item in reader.records()? {
        seen += 1;
        if seen % options.batch_size == 0 {
            options.cancellation.check()?;
            tokio::task::yield_now().await;
        }
        if let Some(bar) = &progress {
            bar.inc(1);
        }
        match item? {
            RecordItem::Malformed { error } => {
                debug!(error, "skipping malformed record");
                skipped += 1;
            }
            RecordItem::Record(record) => {
                let id = match NodeId::new(record.id.clone()) {
                    Ok(id) => id,
                    Err(e) => {
                        debug!(error = %e, "skipping record with invalid id");
                        skipped += 1;
                        continue;
                    }
                };
                let children = record
                    .children
                    .iter()
                    .filter_map(|c| NodeId::new(c.clone()).ok())
                    .collect();
                if staged
                    .insert(
                        id.clone(),
                        StagedRecord {
                            id: id.clone(),
                            props: record.props,
                            children,
                            raw: record.raw,
                        },
                    )
                    .is_none()
                {
                    order.push(id);
                }
            }
        }
    }

    // Parents: the first record listing a node among its children owns
    // it. Later listers are treated as plain references.
    let mut parents: HashMap<NodeId, NodeId> = HashMap::new();
    for id in &order {
        let record = &staged[id];
        for child in &record.children {
            parents.entry(child.clone()).or_insert_with(|| id.clone());
        }
    }

    options.cancellation.check()?;

    // Pass 2: classification into typed tables.
    let mut nodes: BTreeMap<NodeId, NodeRow> = BTreeMap::new();
    let mut references: BTreeMap<NodeId, Vec<ReferenceRow>> = BTreeMap::new();
    let mut tag_applications: BTreeMap<NodeId, Vec<TagApplicationRow>> = BTreeMap::new();
    let mut field_values: BTreeMap<NodeId, BTreeMap<(NodeId, u32), FieldValueRow>> =
        BTreeMap::new();
    let mut field_names: BTreeMap<NodeId, String> = BTreeMap::new();
    let mut supertags: BTreeMap<NodeId, SupertagRow> = BTreeMap::new();
    let mut supertag_fields: BTreeMap<NodeId, BTreeMap<NodeId, SupertagFieldRow>> =
        BTreeMap::new();
    let mut supertag_parents: BTreeMap<NodeId, Vec<NodeId>> = BTreeMap::new();

    for id in &order {
        let record = &staged[id];
        let parent = parents.get(id).cloned();
        let row = build_node_row(record, parent);

        if let Some(name) = record.name() {
            for cap in INLINE_REF_RE.captures_iter(name) {
                if let Ok(target) = NodeId::new(&cap[1]) {
                    references.entry(id.clone()).or_default().push(ReferenceRow {
                        from_node: id.clone(),
                        to_node: target,
                        reference_type: "inline".into(),
                    });
                }
            }
        }

        nodes.insert(id.clone(), row);
    }

    // Tuples carry both tag applications and field values, depending on
    // what their first child is. Tuples parented by a tagDef describe
    // the tag's own field definitions and are handled below.
    for id in &order {
        let record = &staged[id];
        if record.doc_type() != Some(DocType::Tuple) {
            continue;
        }
        let data_node = match parents.get(id) {
            Some(p) => p.clone(),
            None => continue,
        };
        if staged
            .get(&data_node)
            .and_then(StagedRecord::doc_type)
            == Some(DocType::TagDef)
        {
            continue;
        }
        let head = match record.children.first() {
            Some(h) => h,
            None => continue,
        };
        let head_record = match staged.get(head) {
            Some(r) => r,
            None => continue,
        };

        match head_record.doc_type() {
            Some(DocType::TagDef) => {
                let tag_name = match head_record.name() {
                    Some(n) => n.to_string(),
                    None => continue,
                };
                tag_applications
                    .entry(data_node.clone())
                    .or_default()
                    .push(TagApplicationRow {
                        tuple_node_id: id.clone(),
                        data_node_id: data_node.clone(),
                        tag_id: head.clone(),
                        tag_name,
                    });
            }
            Some(DocType::AttrDef) => {
                let field_name = match head_record.name() {
                    Some(n) => n.to_string(),
                    None => continue,
                };
                field_names.insert(head.clone(), field_name.clone());
                let values = field_values.entry(data_node.clone()).or_default();
                for (position, value_id) in record.children.iter().skip(1).enumerate() {
                    let value_record = match staged.get(value_id) {
                        Some(r) => r,
                        None => continue,
                    };
                    // Empty or whitespace-only values are dropped to
                    // keep payloads and filters minimal.
                    let value_text = value_record
                        .name()
                        .map(str::trim)
                        .filter(|t| !t.is_empty())
                        .map(str::to_string);
                    if value_text.is_none() && value_record.children.is_empty() {
                        continue;
                    }
                    values.insert(
                        (head.clone(), position as u32),
                        FieldValueRow {
                            tuple_id: id.clone(),
                            parent_id: data_node.clone(),
                            field_def_id: head.clone(),
                            field_name: field_name.clone(),
                            value_node_id: Some(value_id.clone()),
                            value_text,
                            value_order: position as u32,
                        },
                    );
                    references
                        .entry(data_node.clone())
                        .or_default()
                        .push(ReferenceRow {
                            from_node: data_node.clone(),
                            to_node: value_id.clone(),
                            reference_type: "field".into(),
                        });
                }
            }
            _ => {}
        }
    }

    options.cancellation.check()?;

    // Supertag catalog derivation.
    let mut graph = SupertagGraph::new();
    let mut rejected_edges = 0usize;
    for id in &order {
        let record = &staged[id];
        if record.doc_type() != Some(DocType::TagDef) {
            continue;
        }
        let tag_name = match record.name() {
            Some(n) => n.to_string(),
            None => {
                debug!(tag = %id, "skipping unnamed tagDef");
                continue;
            }
        };
        supertags.insert(
            id.clone(),
            SupertagRow {
                tag_id: id.clone(),
                tag_name: tag_name.clone(),
                normalized_name: NormalizedName::of(&tag_name),
                description: record.props.description.clone(),
                color: record.props.color.clone(),
            },
        );

        let fields = supertag_fields.entry(id.clone()).or_default();
        let mut field_order = 0u32;
        for tuple_id in &record.children {
            let tuple = match staged.get(tuple_id) {
                Some(t) if t.doc_type() == Some(DocType::Tuple) => t,
                _ => continue,
            };
            let label_id = match tuple.children.first() {
                Some(l) => l,
                None => continue,
            };
            let label = match staged.get(label_id) {
                Some(l) if l.doc_type() == Some(DocType::AttrDef) => l,
                _ => continue,
            };
            let field_name = match label.name() {
                Some(n) => n.to_string(),
                None => continue,
            };
            field_names.insert(label_id.clone(), field_name.clone());
            fields.insert(
                label_id.clone(),
                SupertagFieldRow {
                    tag_id: id.clone(),
                    field_name: field_name.clone(),
                    field_label_id: label_id.clone(),
                    field_order,
                    normalized_name: NormalizedName::of(&field_name),
                    description: label.props.description.clone(),
                    inferred_data_type: infer_data_type(&field_name),
                    target_supertag_id: label
                        .props
                        .target_supertag_id
                        .as_deref()
                        .and_then(|t| NodeId::new(t).ok()),
                    default_value_id: tuple.children.get(1).cloned(),
                },
            );
            field_order += 1;
        }

        if let Some(extends) = &record.props.extends {
            for parent in extends {
                let parent_id = match NodeId::new(parent.clone()) {
                    Ok(p) => p,
                    Err(_) => continue,
                };
                match graph.add_edge(id, &parent_id) {
                    Ok(()) => supertag_parents
                        .entry(id.clone())
                        .or_default()
                        .push(parent_id),
                    Err(e) => {
                        warn!(error = %e, child = %id, "rejecting inheritance edge");
                        rejected_edges += 1;
                    }
                }
            }
        }
    }
    if rejected_edges > 0 {
        warn!(rejected_edges, "supertag inheritance cycles rejected");
    }

    options.cancellation.check()?;

    // Delta against the previously committed state, by signature.
    let mut added = 0usize;
    let mut modified = 0usize;
    for (id, row) in &nodes {
        match txn.tables.nodes.get(id) {
            None => added += 1,
            Some(old) if old.signature != row.signature => modified += 1,
            Some(_) => {}
        }
    }
    let deleted = txn
        .tables
        .nodes
        .keys()
        .filter(|id| !nodes.contains_key(*id))
        .count();

    let report = IndexReport {
        added,
        modified,
        deleted,
        nodes_total: nodes.len(),
        supertags_total: supertags.len(),
        fields_total: field_values.values().map(BTreeMap::len).sum(),
        refs_total: references.values().map(Vec::len).sum(),
        tag_apps_total: tag_applications.values().map(Vec::len).sum(),
        skipped_records: skipped,
        duration_ms: 0,
        export_file: path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default(),
    };

    // Install the new state. Deleting a node implicitly drops its
    // outbound references, tag applications and anchored field values
    // because every derived table was rebuilt from this snapshot.
    txn.tables.nodes = nodes;
    txn.tables.references = references;
    txn.tables.tag_applications = tag_applications;
    txn.tables.field_values = field_values;
    txn.tables.field_names = field_names;
    txn.tables.supertags = supertags;
    txn.tables.supertag_fields = supertag_fields;
    txn.tables.supertag_parents = supertag_parents;
    txn.tables.export_file = Some(report.export_file.clone());
    txn.tables.last_indexed_ms = Some(chrono::Utc::now().timestamp_millis());

    // FTS rebuild from the new node names, then the atomic commit.
    {
        let mut fts = db.fts.lock();
        fts.rebuild(
            txn.tables
                .nodes
                .iter()
                .filter_map(|(id, row)| row.name.as_deref().map(|n| (id, n))),
        );
    }
    options.cancellation.check()?;
    txn.commit()?;
    db.fts.lock().flush().context("persisting fts index")?;

    if let Some(bar) = progress {
        bar.finish_and_clear();
    }
    crate::observability::record_index_run();

    let mut report = report;
    report.duration_ms = started.elapsed().as_millis() as u64;
    debug!(
        added = report.added,
        modified = report.modified,
        deleted = report.deleted,
        nodes = report.nodes_total,
        "index run complete"
    );
    Ok(report)
}

fn build_node_row(record: &StagedRecord, parent: Option<NodeId>) -> NodeRow {
    let signature = node_signature(
        record.name(),
        parent.as_ref(),
        record.props.doc_type.as_deref(),
        &record.children,
    );
    NodeRow {
        id: record.id.clone(),
        name: record.props.name.clone(),
        parent_id: parent,
        doc_type: record.doc_type(),
        created: record.props.created,
        updated: record.props.updated,
        done_at: record.props.done_at,
        flags: record.props.flags,
        entity_override: record.props.entity_override,
        signature,
        raw: record.raw.clone().into_bytes(),
    }
}

/// Normalized signature over the attributes that define "modified".
pub fn node_signature(
    name: Option<&str>,
    parent: Option<&NodeId>,
    doc_type: Option<&str>,
    children: &[NodeId],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(name.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(parent.map(NodeId::as_str).unwrap_or("").as_bytes());
    hasher.update([0u8]);
    hasher.update(doc_type.unwrap_or("").as_bytes());
    hasher.update([0u8]);
    for child in children {
        hasher.update(child.as_str().as_bytes());
        hasher.update([1u8]);
    }
    hasher.finalize().into()
}

/// Guard used by read surfaces that need an indexed store.
pub fn require_indexed(tables: &crate::store::Tables) -> Result<()> {
    if tables.export_file.is_none() {
        bail!(SupertagError::SyncRequired(
            "no snapshot has been indexed yet".into()
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nid(s: &str) -> NodeId {
        NodeId::new(s).unwrap()
    }

    #[test]
    fn signature_tracks_each_component() {
        let base = node_signature(Some("a"), None, None, &[]);
        assert_eq!(base, node_signature(Some("a"), None, None, &[]));
        assert_ne!(base, node_signature(Some("b"), None, None, &[]));
        assert_ne!(base, node_signature(Some("a"), Some(&nid("P1234567")), None, &[]));
        assert_ne!(base, node_signature(Some("a"), None, Some("tuple"), &[]));
        assert_ne!(
            base,
            node_signature(Some("a"), None, None, &[nid("C1234567")])
        );
    }

    #[test]
    fn signature_child_order_matters() {
        let ab = node_signature(None, None, None, &[nid("AAAAAAAA"), nid("BBBBBBBB")]);
        let ba = node_signature(None, None, None, &[nid("BBBBBBBB"), nid("AAAAAAAA")]);
        assert_ne!(ab, ba);
    }

    #[test]
    fn inline_reference_pattern() {
        let caps: Vec<_> = INLINE_REF_RE
            .captures_iter("see [[z8k2mD_4x]] and [[not valid!]] and [[other-01]]")
            .map(|c| c[1].to_string())
            .collect();
        assert_eq!(caps, vec!["z8k2mD_4x".to_string(), "other-01".to_string()]);
    }
}
