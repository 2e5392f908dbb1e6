// Multi-workspace fan-out end to end: isolated stores per workspace,
// continue-on-error batch indexing.

mod common;

use anyhow::Result;
use common::meeting_snapshot;
use tempfile::TempDir;

use supertag::batch::{run_batch, WorkspaceSelection};
use supertag::contracts::CancellationToken;
use supertag::database::Database;
use supertag::indexer::IndexOptions;
use supertag::types::WorkspaceAlias;
use supertag::watcher::index_latest;
use supertag::workspace::{add_workspace, ConfigDocument, WorkspaceEntry};

fn entry(root: &TempDir, alias: &str) -> WorkspaceEntry {
    let base = root.path().join(alias);
    let export_dir = base.join("exports");
    std::fs::create_dir_all(&export_dir).unwrap();
    WorkspaceEntry {
        alias: WorkspaceAlias::new(alias).unwrap(),
        root_id: format!("root-{alias}"),
        nodeid: None,
        export_dir,
        db_path: base.join("store.stdb"),
        schema_cache_path: base.join("schema.json"),
        enabled: true,
        default: false,
        token: None,
        target: None,
    }
}

#[tokio::test]
async fn batch_index_isolates_stores_and_continues_on_error() -> Result<()> {
    let root = TempDir::new()?;
    let mut config = ConfigDocument::default();
    let good = entry(&root, "good");
    let empty = entry(&root, "empty");
    meeting_snapshot().write(&good.export_dir, "kb@2025-12-01.json");
    // `empty` has no snapshot at all, so its index run must fail
    // without stopping the batch.
    add_workspace(&mut config, good.clone())?;
    add_workspace(&mut config, empty.clone())?;

    let report = run_batch(
        &config,
        &WorkspaceSelection::All,
        &CancellationToken::new(),
        |workspace| async move {
            let db = Database::open(workspace.database_paths())?;
            index_latest(
                &db,
                &workspace.export_dir,
                &workspace.schema_cache_path,
                &IndexOptions::default(),
            )
            .await
        },
    )
    .await?;

    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].0.as_str(), "good");
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0.as_str(), "empty");

    // The failing workspace did not disturb its peer.
    let good_db = Database::open_existing(good.database_paths())?;
    assert!(good_db.stats().store.nodes > 0);
    assert!(good.schema_cache_path.exists());
    Ok(())
}

#[tokio::test]
async fn stats_observe_only_committed_state() -> Result<()> {
    // Atomicity as observed through stats: a failed index run (corrupt
    // snapshot) leaves the prior counts untouched.
    let root = TempDir::new()?;
    let workspace = entry(&root, "solo");
    meeting_snapshot().write(&workspace.export_dir, "kb@2025-12-01.json");

    let db = Database::open(workspace.database_paths())?;
    index_latest(
        &db,
        &workspace.export_dir,
        &workspace.schema_cache_path,
        &IndexOptions::default(),
    )
    .await?;
    let before = db.stats();

    std::fs::write(
        workspace.export_dir.join("kb@2025-12-02.json"),
        b"{\"formatVersion\": 1, \"docs\": truncated...",
    )?;
    let result = index_latest(
        &db,
        &workspace.export_dir,
        &workspace.schema_cache_path,
        &IndexOptions::default(),
    )
    .await;
    assert!(result.is_err());

    assert_eq!(db.stats().store, before.store);
    Ok(())
}
