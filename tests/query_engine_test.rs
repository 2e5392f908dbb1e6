// Query engine semantics over a hand-built store: ancestor resolution,
// ordering, paging, boolean groups and relative dates.

mod common;

use anyhow::Result;
use common::{open_db, SnapshotBuilder};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

use supertag::contracts::FixedClock;
use supertag::database::Database;
use supertag::indexer::{index_snapshot, IndexOptions};
use supertag::query_engine::{QueryEngine, QueryOptions, ResolutionMode};
use supertag::query_parser::parse;
use supertag::types::NodeId;

// 2026-01-10T00:00:00Z
const NOW_MS: i64 = 1_768_003_200_000;
const DAY_MS: i64 = 86_400_000;

fn nid(s: &str) -> NodeId {
    NodeId::new(s).unwrap()
}

fn engine(db: &Database) -> QueryEngine {
    QueryEngine::new(db, Arc::new(FixedClock(NOW_MS)))
}

async fn task_corpus(dir: &TempDir) -> Result<Database> {
    let db = open_db(dir.path());
    let snapshot = SnapshotBuilder::new()
        .tag_def(
            "tagTask0001",
            "task",
            &[
                ("tupDefStat01", "attrStatus01", "Status"),
                ("tupDefPrio01", "attrPrio0001", "Priority count"),
            ],
        )
        .doc(json!({
            "id": "T1",
            "props": {"name": "Ship release", "created": NOW_MS - 2 * DAY_MS, "updated": NOW_MS - DAY_MS},
            "children": ["tagTupT1", "valTupT1", "prioTupT1"],
        }))
        .tag_application("tagTupT1", "tagTask0001")
        .field_values("valTupT1", "attrStatus01", &[("valT1", "Done")])
        .field_values("prioTupT1", "attrPrio0001", &[("prioT1", "3")])
        .doc(json!({
            "id": "T2",
            "props": {"name": "Write docs", "created": NOW_MS - 30 * DAY_MS, "updated": NOW_MS - 10 * DAY_MS},
            "children": ["tagTupT2", "valTupT2", "prioTupT2"],
        }))
        .tag_application("tagTupT2", "tagTask0001")
        .field_values("valTupT2", "attrStatus01", &[("valT2", "Active")])
        .field_values("prioTupT2", "attrPrio0001", &[("prioT2", "10")])
        .doc(json!({
            "id": "T3",
            "props": {"name": "Refactor parser", "created": NOW_MS - 40 * DAY_MS, "updated": NOW_MS - 20 * DAY_MS},
            "children": ["tagTupT3"],
        }))
        .tag_application("tagTupT3", "tagTask0001")
        .write(dir.path(), "kb@2026-01-09.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    Ok(db)
}

fn ids(result: &supertag::query_engine::QueryResult) -> Vec<&str> {
    result.hits.iter().map(|h| h.id.as_str()).collect()
}

#[tokio::test]
async fn or_groups_and_date_clause() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;

    let query =
        parse("find task where (Status = Done or Status = Active) and created > 7d").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    // Only T1 is both status-matched and recent.
    assert_eq!(ids(&result), vec!["T1"]);
    Ok(())
}

#[tokio::test]
async fn negation_exists_and_is_empty() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;
    let e = engine(&db);
    let opts = QueryOptions::default();

    let query = parse("find task where Status exists").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["T1", "T2"]);

    let query = parse("find task where Status is empty").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["T3"]);

    let query = parse("find task where not Status = Done").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["T2", "T3"]);
    Ok(())
}

#[tokio::test]
async fn numeric_ordering_and_paging() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;
    let e = engine(&db);
    let opts = QueryOptions::default();

    // Numeric field: 10 > 3, so descending puts T2 first; T3 has no
    // value and sorts last.
    let query = parse("find task order by -\"Priority count\"").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["T2", "T1", "T3"]);

    let query = parse("find task order by -\"Priority count\" limit 1 offset 1").unwrap();
    let result = e.execute(&query, &opts)?;
    assert_eq!(ids(&result), vec!["T1"]);
    assert_eq!(result.total_matched, 3);
    Ok(())
}

#[tokio::test]
async fn unknown_tag_and_field_yield_empty_not_error() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;
    let e = engine(&db);
    let opts = QueryOptions::default();

    let query = parse("find nosuchtag").unwrap();
    assert!(e.execute(&query, &opts)?.hits.is_empty());

    let query = parse("find task where NoSuchField = x").unwrap();
    assert!(e.execute(&query, &opts)?.hits.is_empty());

    // is_empty on an unknown field is still false, not "everything".
    let query = parse("find task where NoSuchField is empty").unwrap();
    assert!(e.execute(&query, &opts)?.hits.is_empty());
    Ok(())
}

#[tokio::test]
async fn query_is_deterministic_for_fixed_store_and_clock() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;
    let e = engine(&db);
    let opts = QueryOptions::default();
    let query = parse("find task where created > 60d order by name").unwrap();

    let first = e.execute(&query, &opts)?;
    let second = e.execute(&query, &opts)?;
    assert_eq!(first, second);
    Ok(())
}

#[tokio::test]
async fn select_projects_fields() -> Result<()> {
    let dir = TempDir::new()?;
    let db = task_corpus(&dir).await?;
    let query = parse("find task where Status = Done select Status").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    assert_eq!(result.hits.len(), 1);
    assert_eq!(
        result.hits[0].fields.get("Status"),
        Some(&vec!["Done".to_string()])
    );
    Ok(())
}

#[tokio::test]
async fn default_limit_is_applied() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let mut builder = SnapshotBuilder::new();
    for i in 0..150 {
        builder = builder.node(&format!("BULK{i:04}"), &format!("bulk node {i}"), &[]);
    }
    let snapshot = builder.write(dir.path(), "kb@2026-01-09.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;

    let query = parse("find *").unwrap();
    let result = engine(&db).execute(&query, &QueryOptions::default())?;
    assert_eq!(result.hits.len(), 100);
    assert_eq!(result.total_matched, 150);
    Ok(())
}

#[tokio::test]
async fn ancestor_resolution_modes() -> Result<()> {
    // Five content fragments under three distinct tagged parents.
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let snapshot = SnapshotBuilder::new()
        .tag_def("tagDoc00001", "doc", &[])
        .node("P1", "Spec document", &["tagTupP1", "F1", "F2"])
        .tag_application("tagTupP1", "tagDoc00001")
        .node("P2", "Meeting notes", &["tagTupP2", "F3", "F4"])
        .tag_application("tagTupP2", "tagDoc00001")
        .node("P3", "Scratchpad", &["tagTupP3", "F5"])
        .tag_application("tagTupP3", "tagDoc00001")
        .node("F1", "alpha fragment", &[])
        .node("F2", "alpha fragment too", &[])
        .node("F3", "alpha again", &[])
        .node("F4", "alpha once more", &[])
        .node("F5", "alpha the last", &[])
        .write(dir.path(), "kb@2026-01-09.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;

    let tables = db.store.snapshot();
    let matches: Vec<NodeId> = vec![nid("F1"), nid("F2"), nid("F3"), nid("F4"), nid("F5")];

    let tagged = supertag::resolve_matches(&tables, &matches, ResolutionMode::Tagged);
    assert_eq!(tagged.len(), 3);
    let mut counts: Vec<usize> = tagged.iter().map(|r| r.match_count).collect();
    counts.sort_unstable();
    assert_eq!(counts, vec![1, 2, 2]);
    assert_eq!(tagged.iter().map(|r| r.match_count).sum::<usize>(), 5);
    // Best-covered ancestors first.
    assert!(tagged[0].match_count >= tagged[1].match_count);
    assert!(!tagged[0].tags.is_empty());

    let raw = supertag::resolve_matches(&tables, &matches, ResolutionMode::Raw);
    assert_eq!(raw.len(), 5);

    let named = supertag::resolve_matches(&tables, &matches, ResolutionMode::Named);
    // Fragments are themselves named, so they resolve to themselves.
    assert_eq!(named.len(), 5);
    Ok(())
}

#[tokio::test]
async fn fts_search_resolves_to_tagged_ancestors() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let snapshot = SnapshotBuilder::new()
        .tag_def("tagDoc00001", "doc", &[])
        .node("P1", "Spec document", &["tagTupP1", "F1", "F2"])
        .tag_application("tagTupP1", "tagDoc00001")
        .doc(json!({"id": "F1", "props": {}, "children": []}))
        .doc(json!({"id": "F2", "props": {"name": "zebra fragment"}, "children": []}))
        .write(dir.path(), "kb@2026-01-09.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;

    let hits = engine(&db).search_names(
        "zebra",
        ResolutionMode::Tagged,
        Default::default(),
        &QueryOptions::default(),
    )?;
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].id, nid("P1"));
    assert_eq!(hits[0].match_count, 1);
    Ok(())
}

#[tokio::test]
async fn parent_traversal_fields() -> Result<()> {
    let dir = TempDir::new()?;
    let db = open_db(dir.path());
    let snapshot = SnapshotBuilder::new()
        .tag_def("tagProj0001", "project", &[])
        .node("P1", "Apollo", &["tagTupP1", "C1"])
        .tag_application("tagTupP1", "tagProj0001")
        .node("C1", "kickoff note", &[])
        .write(dir.path(), "kb@2026-01-09.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;

    let e = engine(&db);
    let opts = QueryOptions::default();

    // The carrier tuple shares the parent, so filter it out by its
    // doc type to isolate the content child.
    let query = parse("find * where parent.name = Apollo and doc_type is empty").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["C1"]);

    let query = parse("find * where parent.tags ~ proj and doc_type is empty").unwrap();
    assert_eq!(ids(&e.execute(&query, &opts)?), vec!["C1"]);
    Ok(())
}
