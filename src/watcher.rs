// Export Watcher
// Debounced directory watch over the snapshot export directory. Only
// files matching `*@YYYY-MM-DD.json` count; any matching filesystem
// event re-arms a debounce timer, and on expiry the lexicographically
// greatest snapshot is indexed and the schema catalog regenerated.
//
// State machine: idle -> armed -> indexing -> idle. Events arriving
// while an index run is in flight queue up and re-arm the timer once
// the run completes; stop cancels from any state.

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::database::Database;
use crate::indexer::{index_snapshot, IndexOptions, IndexReport};
use crate::schema::SchemaService;

pub const DEFAULT_DEBOUNCE_MS: u64 = 1000;

static SNAPSHOT_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@\d{4}-\d{2}-\d{2}\.json$").expect("snapshot name regex"));

pub fn is_snapshot_file(name: &str) -> bool {
    SNAPSHOT_NAME_RE.is_match(name)
}

/// The lexicographically greatest matching snapshot in `dir`, which by
/// the date-stamped naming convention is the newest.
pub fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>> {
    let mut best: Option<(String, PathBuf)> = None;
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading export directory {}", dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_snapshot_file(&name) {
            continue;
        }
        if best.as_ref().map(|(b, _)| name > *b).unwrap_or(true) {
            best = Some((name, entry.path()));
        }
    }
    Ok(best.map(|(_, path)| path))
}

/// Index the newest snapshot and rewrite the schema catalog document.
pub async fn index_latest(
    db: &Database,
    export_dir: &Path,
    schema_cache_path: &Path,
    options: &IndexOptions,
) -> Result<IndexReport> {
    let path = latest_snapshot(export_dir)?.ok_or_else(|| {
        crate::errors::SupertagError::InvalidParameter(format!(
            "no snapshot matching *@YYYY-MM-DD.json in {}",
            export_dir.display()
        ))
    })?;
    let report = index_snapshot(db, &path, options).await?;
    SchemaService::new(db.store.clone()).write_catalog(schema_cache_path)?;
    Ok(report)
}

#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub export_dir: PathBuf,
    pub schema_cache_path: PathBuf,
    pub debounce_ms: u64,
}

impl WatcherConfig {
    pub fn new(export_dir: PathBuf, schema_cache_path: PathBuf) -> Self {
        Self {
            export_dir,
            schema_cache_path,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
        }
    }
}

#[derive(Debug)]
pub enum WatchEvent {
    Indexed(IndexReport),
    Error(String),
}

/// Running watcher handle. Dropping it (or calling [`stop`]) cancels
/// the timer and releases the filesystem watch.
///
/// [`stop`]: ExportWatcher::stop
pub struct ExportWatcher {
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
    _fs_watcher: RecommendedWatcher,
}

impl ExportWatcher {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(true);
        let _ = self.task.await;
    }
}

/// Start watching. Emitted events arrive on the returned receiver.
pub fn start(
    db: Arc<Database>,
    config: WatcherConfig,
) -> Result<(ExportWatcher, mpsc::UnboundedReceiver<WatchEvent>)> {
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (raw_tx, raw_rx) = mpsc::unbounded_channel::<()>();
    let (stop_tx, stop_rx) = watch::channel(false);

    let mut fs_watcher = notify::recommended_watcher(move |result: notify::Result<notify::Event>| {
        match result {
            Ok(event) => {
                let matches = event.paths.iter().any(|p| {
                    p.file_name()
                        .map(|n| is_snapshot_file(&n.to_string_lossy()))
                        .unwrap_or(false)
                });
                if matches {
                    let _ = raw_tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "filesystem watch error"),
        }
    })?;
    fs_watcher
        .watch(&config.export_dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("watching {}", config.export_dir.display()))?;

    let task = tokio::spawn(run_debounce_loop(db, config, raw_rx, stop_rx, event_tx));

    Ok((
        ExportWatcher {
            stop_tx,
            task,
            _fs_watcher: fs_watcher,
        },
        event_rx,
    ))
}

async fn run_debounce_loop(
    db: Arc<Database>,
    config: WatcherConfig,
    mut raw_rx: mpsc::UnboundedReceiver<()>,
    mut stop_rx: watch::Receiver<bool>,
    event_tx: mpsc::UnboundedSender<WatchEvent>,
) {
    let debounce = Duration::from_millis(config.debounce_ms);
    let mut deadline: Option<tokio::time::Instant> = None;

    loop {
        let timer = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = stop_rx.changed() => break,
            event = raw_rx.recv() => match event {
                None => break,
                Some(()) => {
                    // Every event re-arms the timer; K events within
                    // the window coalesce into one run.
                    deadline = Some(tokio::time::Instant::now() + debounce);
                    debug!("snapshot event, debounce re-armed");
                }
            },
            _ = timer => {
                deadline = None;
                match latest_snapshot(&config.export_dir) {
                    // The file may have been renamed away since the
                    // event; expiry re-checks before indexing.
                    Ok(None) => debug!("debounce expired with no snapshot present"),
                    Err(e) => {
                        let _ = event_tx.send(WatchEvent::Error(format!("{e:#}")));
                    }
                    Ok(Some(_)) => {
                        let options = IndexOptions::default();
                        match index_latest(&db, &config.export_dir, &config.schema_cache_path, &options).await {
                            Ok(report) => {
                                let _ = event_tx.send(WatchEvent::Indexed(report));
                            }
                            Err(e) => {
                                let _ = event_tx.send(WatchEvent::Error(format!("{e:#}")));
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_name_pattern() {
        assert!(is_snapshot_file("workspace@2025-12-31.json"));
        assert!(is_snapshot_file("My KB@2026-01-02.json"));
        assert!(!is_snapshot_file("workspace@2025-12-31.json.part"));
        assert!(!is_snapshot_file("workspace-2025-12-31.json"));
        assert!(!is_snapshot_file("workspace@2025-1-1.json"));
        assert!(!is_snapshot_file("notes.json"));
    }

    #[test]
    fn latest_is_lexicographic() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        std::fs::write(dir.path().join("kb@2025-11-30.json"), b"{}")?;
        std::fs::write(dir.path().join("kb@2025-12-02.json"), b"{}")?;
        std::fs::write(dir.path().join("kb@2025-12-01.json"), b"{}")?;
        std::fs::write(dir.path().join("ignored.json"), b"{}")?;

        let latest = latest_snapshot(dir.path())?.unwrap();
        assert_eq!(
            latest.file_name().unwrap().to_string_lossy(),
            "kb@2025-12-02.json"
        );
        Ok(())
    }

    #[test]
    fn empty_dir_has_no_latest() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        assert!(latest_snapshot(dir.path())?.is_none());
        Ok(())
    }
}
