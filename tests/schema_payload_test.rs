// Schema service and payload builder over an indexed corpus.

mod common;

use anyhow::Result;
use common::{open_db, SnapshotBuilder};
use pretty_assertions::assert_eq;
use serde_json::json;
use tempfile::TempDir;

use supertag::database::Database;
use supertag::indexer::{index_snapshot, IndexOptions};
use supertag::payload::{build_payload, parse_tag_list};
use supertag::schema::{from_catalog_document, SchemaService};
use supertag::types::{FieldDataType, NodeId};

async fn todo_corpus(dir: &TempDir) -> Result<Database> {
    let db = open_db(dir.path());
    let snapshot = SnapshotBuilder::new()
        .tag_def(
            "tagTodo0001",
            "todo",
            &[
                ("tupDefStat1", "attrStatus1", "Status"),
                ("tupDefDue01", "attrDueDate1", "Due Date"),
            ],
        )
        .tag_def("tagUrgent01", "urgent", &[("tupDefLink1", "attrLink01", "Link")])
        .write(dir.path(), "kb@2025-12-01.json");
    index_snapshot(&db, &snapshot, &IndexOptions::default()).await?;
    Ok(db)
}

#[tokio::test]
async fn scenario_payload_builder() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());

    let mut fields = serde_json::Map::new();
    fields.insert("status".into(), json!("active"));
    fields.insert("duedate".into(), json!("2025-12-31"));
    fields.insert("link".into(), json!("https://x"));

    let payload = build_payload(
        &service,
        &parse_tag_list("todo,urgent"),
        "Review PR",
        &fields,
    )?;

    assert_eq!(payload.name, "Review PR");
    let tag_ids: Vec<&str> = payload.supertags.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(tag_ids, vec!["tagTodo0001", "tagUrgent01"]);

    let children = payload.children.as_ref().expect("typed field children");
    assert_eq!(children.len(), 3);

    let by_attr = |attr: &str| {
        children
            .iter()
            .find(|c| c.attribute_id.as_deref() == Some(attr))
            .unwrap_or_else(|| panic!("no child for {attr}"))
    };

    let status = by_attr("attrStatus1");
    let status_value = &status.children.as_ref().unwrap()[0];
    assert_eq!(status_value.name.as_deref(), Some("active"));
    assert!(status_value.data_type.is_none());

    let due = by_attr("attrDueDate1");
    let due_value = &due.children.as_ref().unwrap()[0];
    assert_eq!(due_value.data_type.as_deref(), Some("date"));
    assert_eq!(due_value.name.as_deref(), Some("2025-12-31"));

    let link = by_attr("attrLink01");
    let link_value = &link.children.as_ref().unwrap()[0];
    assert_eq!(link_value.data_type.as_deref(), Some("url"));
    assert_eq!(link_value.name.as_deref(), Some("https://x"));
    Ok(())
}

#[tokio::test]
async fn unknown_fields_are_dropped_and_tags_deduped() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());

    let mut fields = serde_json::Map::new();
    fields.insert("status".into(), json!("active"));
    fields.insert("nosuchfield".into(), json!("dropped"));
    fields.insert("alsoempty".into(), json!("   "));

    let payload = build_payload(
        &service,
        &parse_tag_list("todo, todo ,todo"),
        "Dedup me",
        &fields,
    )?;

    assert_eq!(payload.supertags.len(), 1);
    let children = payload.children.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].attribute_id.as_deref(), Some("attrStatus1"));
    Ok(())
}

#[tokio::test]
async fn unknown_tag_fails_payload() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());
    let err = build_payload(
        &service,
        &parse_tag_list("nosuchtag"),
        "x",
        &serde_json::Map::new(),
    )
    .err()
    .expect("unknown tag must fail");
    assert_eq!(
        err.downcast_ref::<supertag::SupertagError>()
            .map(|e| e.kind_name()),
        Some("TagNotFound")
    );
    Ok(())
}

#[tokio::test]
async fn name_resolution_exact_then_normalized() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());

    assert_eq!(service.get_supertag("todo")?.id, NodeId::new("tagTodo0001")?);
    // Normalized fallback: different case still resolves.
    assert_eq!(service.get_supertag("ToDo")?.id, NodeId::new("tagTodo0001")?);
    assert!(service.get_supertag("nope").is_err());

    let found = service.search_supertags("urg");
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "urgent");
    Ok(())
}

#[tokio::test]
async fn field_resolution_and_inference_via_catalog() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());

    let todo = service.get_supertag("todo")?;
    let fields = service.fields(&todo.id);
    assert_eq!(fields.len(), 2);
    assert_eq!(fields[0].field_name, "Status");
    assert_eq!(fields[0].inferred_data_type, FieldDataType::Reference);
    assert_eq!(fields[1].field_name, "Due Date");
    assert_eq!(fields[1].inferred_data_type, FieldDataType::Date);

    let due = service
        .field_by_normalized_name(&todo.id, "Due date")
        .expect("normalized lookup");
    assert_eq!(due.field_label_id, NodeId::new("attrDueDate1")?);
    Ok(())
}

#[tokio::test]
async fn catalog_document_round_trips_and_is_stable() -> Result<()> {
    let dir = TempDir::new()?;
    let db = todo_corpus(&dir).await?;
    let service = SchemaService::new(db.store.clone());

    let doc = service.to_catalog_document();
    assert_eq!(doc.version, 1);
    assert_eq!(doc.supertags.len(), 2);

    let value = serde_json::to_value(&doc)?;
    let parsed = from_catalog_document(&value)?;
    assert_eq!(doc, parsed);

    // Serialization is stable across repeated export.
    let once = serde_json::to_string(&service.to_catalog_document())?;
    let twice = serde_json::to_string(&service.to_catalog_document())?;
    assert_eq!(once, twice);

    // Written catalog lands atomically at the configured path.
    let path = dir.path().join("schema.json");
    service.write_catalog(&path)?;
    let on_disk: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
    assert_eq!(on_disk["version"], 1);
    Ok(())
}
