// Shared helpers for integration tests: snapshot construction in the
// exporter's wire format and workspace scaffolding in temp directories.

use serde_json::{json, Value};
use std::path::PathBuf;

use supertag::database::{Database, DatabasePaths};

/// Builds snapshot documents in the `{formatVersion, docs, editors,
/// workspaces}` wire shape.
pub struct SnapshotBuilder {
    docs: Vec<Value>,
}

#[allow(dead_code)]
impl SnapshotBuilder {
    pub fn new() -> Self {
        Self { docs: Vec::new() }
    }

    pub fn doc(mut self, value: Value) -> Self {
        self.docs.push(value);
        self
    }

    /// Plain content node.
    pub fn node(self, id: &str, name: &str, children: &[&str]) -> Self {
        self.doc(json!({
            "id": id,
            "props": {"name": name, "created": 1_700_000_000_000i64, "updated": 1_700_000_000_000i64},
            "children": children,
        }))
    }

    /// A supertag definition with its field-definition tuples.
    /// `fields` is (tuple_id, attr_id, field_name).
    pub fn tag_def(mut self, id: &str, name: &str, fields: &[(&str, &str, &str)]) -> Self {
        let children: Vec<&str> = fields.iter().map(|(tuple, _, _)| *tuple).collect();
        self.docs.push(json!({
            "id": id,
            "props": {"_docType": "tagDef", "name": name},
            "children": children,
        }));
        for (tuple_id, attr_id, field_name) in fields {
            self.docs.push(json!({
                "id": tuple_id,
                "props": {"_docType": "tuple"},
                "children": [attr_id],
            }));
            self.docs.push(json!({
                "id": attr_id,
                "props": {"_docType": "attrDef", "name": field_name},
            }));
        }
        self
    }

    /// Tag application carrier: a tuple under the data node pointing at
    /// the tagDef.
    pub fn tag_application(self, tuple_id: &str, tag_id: &str) -> Self {
        self.doc(json!({
            "id": tuple_id,
            "props": {"_docType": "tuple"},
            "children": [tag_id],
        }))
    }

    /// Field value carrier plus the value nodes themselves.
    pub fn field_values(mut self, tuple_id: &str, attr_id: &str, values: &[(&str, &str)]) -> Self {
        let mut children = vec![attr_id.to_string()];
        children.extend(values.iter().map(|(id, _)| id.to_string()));
        self.docs.push(json!({
            "id": tuple_id,
            "props": {"_docType": "tuple"},
            "children": children,
        }));
        for (value_id, value_name) in values {
            self.docs.push(json!({
                "id": value_id,
                "props": {"name": value_name},
            }));
        }
        self
    }

    pub fn build(&self) -> Value {
        json!({
            "formatVersion": 1,
            "docs": self.docs,
            "editors": [],
            "workspaces": {},
        })
    }

    /// Write as a dated export file and return its path.
    pub fn write(&self, dir: &std::path::Path, filename: &str) -> PathBuf {
        let path = dir.join(filename);
        std::fs::write(&path, serde_json::to_string(&self.build()).unwrap()).unwrap();
        path
    }
}

/// One node of the scenario-A corpus: three meetings with a Location
/// field valued Zurich/Berlin/Zurich.
#[allow(dead_code)]
pub fn meeting_snapshot() -> SnapshotBuilder {
    SnapshotBuilder::new()
        .tag_def(
            "tagMeeting01",
            "meeting",
            &[("tupleDefLoc01", "attrLocation1", "Location")],
        )
        .node("N1", "Team sync Zurich", &["tagTupN1", "valTupN1"])
        .tag_application("tagTupN1", "tagMeeting01")
        .field_values("valTupN1", "attrLocation1", &[("valN1", "Zurich")])
        .node("N2", "Client call Berlin", &["tagTupN2", "valTupN2"])
        .tag_application("tagTupN2", "tagMeeting01")
        .field_values("valTupN2", "attrLocation1", &[("valN2", "Berlin")])
        .node("N3", "Workshop Zurich", &["tagTupN3", "valTupN3"])
        .tag_application("tagTupN3", "tagMeeting01")
        .field_values("valTupN3", "attrLocation1", &[("valN3", "Zurich")])
}

#[allow(dead_code)]
pub fn open_db(dir: &std::path::Path) -> Database {
    Database::open(DatabasePaths::under(dir)).expect("open database")
}
