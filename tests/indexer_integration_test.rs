// Ingestion engine end-to-end: snapshot file in, queryable store out.

mod common;

use anyhow::Result;
use common::{meeting_snapshot, open_db, SnapshotBuilder};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use supertag::contracts::{CancellationToken, FixedClock};
use supertag::indexer::{index_snapshot, IndexOptions};
use supertag::query_engine::{QueryEngine, QueryOptions};
use supertag::query_parser::parse;
use supertag::schema::SchemaService;
use supertag::types::NodeId;

fn nid(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn engine(db: &supertag::database::Database) -> QueryEngine {
    QueryEngine::new(db, Arc::new(FixedClock(1_700_000_000_000)))
}

fn hit_ids(result: &supertag::query_engine::QueryResult) -> Vec<&str> {
    result.hits.iter().map(|h| h.id.as_str()).collect()
}

#[tokio::test]
async fn scenario_index_and_query_by_field() -> Result<()> {
    let dir = TempDir::new()?;
    let snapshot = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    let db = open_db(dir.path());

    let report = index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    assert_eq!(report.supertags_total, 1);
    assert_eq!(report.tag_apps_total, 3);
    assert!(report.added > 0);
    assert_eq!(report.deleted, 0);
    assert_eq!(report.export_file, "kb@2025-12-01.json");

    let query = parse("find meeting where Location = Zurich").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    assert_eq!(hit_ids(&result), vec!["N1", "N3"]);
    Ok(())
}

#[tokio::test]
async fn scenario_substring_filter() -> Result<()> {
    let dir = TempDir::new()?;
    let snapshot = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    let db = open_db(dir.path());
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;

    let query = parse("find meeting where Location ~ Zur").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    assert_eq!(hit_ids(&result), vec!["N1", "N3"]);

    // Uppercasing the needle does not change the result set.
    let query = parse("find meeting where Location ~ ZUR").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    assert_eq!(hit_ids(&result), vec!["N1", "N3"]);
    Ok(())
}

#[tokio::test]
async fn idempotent_ingestion() -> Result<()> {
    let dir = TempDir::new()?;
    let snapshot = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    let db = open_db(dir.path());

    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    let catalog_before =
        serde_json::to_string(&SchemaService::new(db.store.clone()).to_catalog_document())?;

    let second = index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    assert_eq!(second.added, 0);
    assert_eq!(second.modified, 0);
    assert_eq!(second.deleted, 0);

    let catalog_after =
        serde_json::to_string(&SchemaService::new(db.store.clone()).to_catalog_document())?;
    assert_eq!(catalog_before, catalog_after);
    Ok(())
}

#[tokio::test]
async fn scenario_delta_on_rename() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let first = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    index_snapshot(&db, &first, &IndexOptions::default()).await?;

    // Same corpus except N2's name.
    let second = SnapshotBuilder::new()
        .tag_def(
            "tagMeeting01",
            "meeting",
            &[("tupleDefLoc01", "attrLocation1", "Location")],
        )
        .node("N1", "Team sync Zurich", &["tagTupN1", "valTupN1"])
        .tag_application("tagTupN1", "tagMeeting01")
        .field_values("valTupN1", "attrLocation1", &[("valN1", "Zurich")])
        .node("N2", "Client call Berlin HQ", &["tagTupN2", "valTupN2"])
        .tag_application("tagTupN2", "tagMeeting01")
        .field_values("valTupN2", "attrLocation1", &[("valN2", "Berlin")])
        .node("N3", "Workshop Zurich", &["tagTupN3", "valTupN3"])
        .tag_application("tagTupN3", "tagMeeting01")
        .field_values("valTupN3", "attrLocation1", &[("valN3", "Zurich")])
        .write(dir.path(), "kb@2025-12-02.json");

    let report = index_snapshot(&db, &second, &IndexOptions::default()).await?;
    assert_eq!(
        (report.added, report.modified, report.deleted),
        (0, 1, 0)
    );

    // FTS reflects the new name.
    let hits = db.fts.lock().search_substring("berlin hq");
    assert_eq!(hits, vec![nid("N2")]);
    Ok(())
}

#[tokio::test]
async fn deletions_cascade() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let first = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    index_snapshot(&db, &first, &IndexOptions::default()).await?;
    assert!(db.store.snapshot().node(&nid("N3")).is_some());

    // N3 and its carriers are gone from the next snapshot.
    let second = SnapshotBuilder::new()
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
        .write(dir.path(), "kb@2025-12-02.json");

    let report = index_snapshot(&db, &second, &IndexOptions::default()).await?;
    assert!(report.deleted >= 1);

    let tables = db.store.snapshot();
    assert!(tables.node(&nid("N3")).is_none());
    assert!(tables.tags_of(&nid("N3")).is_empty());
    assert!(tables.field_values_of(&nid("N3")).next().is_none());
    assert_eq!(tables.nodes_with_tag(&nid("tagMeeting01")).len(), 2);
    Ok(())
}

#[tokio::test]
async fn malformed_records_are_skipped_not_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let snapshot = meeting_snapshot()
        .doc(json!({"this-record-has": "no id"}))
        .write(dir.path(), "kb@2025-12-01.json");

    let report = index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    assert_eq!(report.skipped_records, 1);
    assert!(report.nodes_total > 0);
    Ok(())
}

#[tokio::test]
async fn cancelled_index_rolls_back() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let first = meeting_snapshot().write(dir.path(), "kb@2025-12-01.json");
    index_snapshot(&db, &first, &IndexOptions::default()).await?;
    let nodes_before = db.store.snapshot().nodes.len();

    let second = SnapshotBuilder::new()
        .node("OTHER1", "something else entirely", &[])
        .write(dir.path(), "kb@2025-12-02.json");
    let cancelled = CancellationToken::new();
    cancelled.cancel();
    let options = IndexOptions {
        cancellation: cancelled,
        ..IndexOptions::default()
    };
    assert!(index_snapshot(&db, &second, &options).await.is_err());

    // The store still serves the previous committed state.
    assert_eq!(db.store.snapshot().nodes.len(), nodes_before);
    assert!(db.store.snapshot().node(&nid("N1")).is_some());
    Ok(())
}

#[tokio::test]
async fn inheritance_edges_and_cycles() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());

    // child extends parent; a second edge tries to close a cycle and
    // must be dropped while everything else indexes normally.
    let snapshot = SnapshotBuilder::new()
        .doc(json!({
            "id": "tagParent01",
            "props": {"_docType": "tagDef", "name": "item", "_extends": ["tagChild001"]},
        }))
        .doc(json!({
            "id": "tagChild001",
            "props": {"_docType": "tagDef", "name": "task", "_extends": ["tagParent01"]},
        }))
        .write(dir.path(), "kb@2025-12-01.json");

    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    let tables = db.store.snapshot();

    let edge_count: usize = tables.supertag_parents.values().map(Vec::len).sum();
    assert_eq!(edge_count, 1, "cycle-closing edge must be rejected");
    Ok(())
}
