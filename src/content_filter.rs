// Content Filter
// Decides which nodes are worth embedding. Composable exclusions with
// conservative defaults: unnamed nodes, very short names (unless the
// node is an entity), import artifacts, reference-syntax fragments and
// system bookkeeping nodes are all skipped. Every switch only ever
// excludes, so enabling one never grows the selected set.

use serde::{Deserialize, Serialize};

use crate::store::{NodeRow, Tables};
use crate::types::NodeId;

pub const DEFAULT_MIN_NAME_LENGTH: usize = 3;

/// Prefix stamped on artifacts of epoch-zero imports.
const IMPORT_ARTIFACT_PREFIX: &str = "1970-01-01";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentFilter {
    /// Minimum name length; entities bypass this check.
    pub min_length: usize,
    pub exclude_import_artifacts: bool,
    pub exclude_reference_artifacts: bool,
    pub exclude_system_doc_types: bool,
    pub entities_only: bool,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            min_length: DEFAULT_MIN_NAME_LENGTH,
            exclude_import_artifacts: true,
            exclude_reference_artifacts: true,
            exclude_system_doc_types: true,
            entities_only: false,
        }
    }
}

/// Entity detection: an explicit override, or an odd flags word from
/// the source (its lowest bit marks library items).
pub fn is_entity(node: &NodeRow) -> bool {
    node.entity_override == Some(true) || node.flags.map(|f| f.rem_euclid(2) == 1).unwrap_or(false)
}

impl ContentFilter {
    pub fn selects(&self, node: &NodeRow) -> bool {
        let name = match node.name.as_deref() {
            Some(n) => n,
            None => return false,
        };

        let entity = is_entity(node);
        if self.entities_only && !entity {
            return false;
        }
        if !entity && name.chars().count() < self.min_length {
            return false;
        }
        if self.exclude_import_artifacts && name.starts_with(IMPORT_ARTIFACT_PREFIX) {
            return false;
        }
        if self.exclude_reference_artifacts && has_reference_artifact(name) {
            return false;
        }
        if self.exclude_system_doc_types
            && node.doc_type.as_ref().map(|d| d.is_system()).unwrap_or(false)
        {
            return false;
        }
        true
    }

    /// All selected node ids, in id order.
    pub fn select_ids(&self, tables: &Tables) -> Vec<NodeId> {
        tables
            .nodes
            .values()
            .filter(|node| self.selects(node))
            .map(|node| node.id.clone())
            .collect()
    }
}

/// `%[[%]]%`: text that still carries inline reference syntax.
fn has_reference_artifact(name: &str) -> bool {
    match name.find("[[") {
        Some(start) => name[start..].contains("]]"),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DocType;

    fn node(name: Option<&str>) -> NodeRow {
        NodeRow {
            id: NodeId::new("node0001").unwrap(),
            name: name.map(str::to_string),
            parent_id: None,
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
    fn unnamed_nodes_are_never_selected() {
        let filter = ContentFilter::default();
        assert!(!filter.selects(&node(None)));
        assert!(filter.selects(&node(Some("Quarterly planning"))));
    }

    #[test]
    fn short_names_are_skipped_unless_entity() {
        let filter = ContentFilter::default();
        assert!(!filter.selects(&node(Some("ab"))));

        let mut entity = node(Some("ab"));
        entity.entity_override = Some(true);
        assert!(filter.selects(&entity));

        let mut flagged = node(Some("ab"));
        flagged.flags = Some(3);
        assert!(filter.selects(&flagged));

        let mut even_flags = node(Some("ab"));
        even_flags.flags = Some(4);
        assert!(!filter.selects(&even_flags));
    }

    #[test]
    fn artifacts_are_excluded() {
        let filter = ContentFilter::default();
        assert!(!filter.selects(&node(Some("1970-01-01 import dump"))));
        assert!(!filter.selects(&node(Some("see [[z8k2mD4x]] for details"))));
        // An unclosed marker is not an artifact.
        assert!(filter.selects(&node(Some("array[[0"))));
    }

    #[test]
    fn system_doc_types_are_excluded() {
        let filter = ContentFilter::default();
        let mut tuple = node(Some("structural tuple"));
        tuple.doc_type = Some(DocType::Tuple);
        assert!(!filter.selects(&tuple));

        let mut plain = node(Some("a plain note"));
        plain.doc_type = Some(DocType::Other("note".into()));
        assert!(filter.selects(&plain));
    }

    #[test]
    fn entities_only_restricts() {
        let filter = ContentFilter {
            entities_only: true,
            ..ContentFilter::default()
        };
        assert!(!filter.selects(&node(Some("a regular note"))));
        let mut entity = node(Some("Jane Doe"));
        entity.entity_override = Some(true);
        assert!(filter.selects(&entity));
    }

    #[test]
    fn exclusions_are_monotone() {
        // Every additional exclusion selects a subset of the default.
        let nodes: Vec<NodeRow> = vec![
            node(Some("Quarterly planning")),
            node(Some("ab")),
            node(Some("1970-01-01 import")),
            node(Some("see [[x1y2z3w4]]")),
            {
                let mut n = node(Some("Jane Doe"));
                n.entity_override = Some(true);
                n
            },
        ];
        let base = ContentFilter::default();
        let stricter = ContentFilter {
            entities_only: true,
            ..ContentFilter::default()
        };
        let base_count = nodes.iter().filter(|n| base.selects(n)).count();
        let strict_count = nodes.iter().filter(|n| stricter.selects(n)).count();
        assert!(strict_count <= base_count);
        for n in &nodes {
            // Monotone per node, not just in aggregate.
            assert!(!stricter.selects(n) || base.selects(n));
        }
    }
}
