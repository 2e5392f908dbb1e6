// Batch Fan-Out
// Runs one operation across many workspaces with continue-on-error
// semantics: a failing workspace is recorded and the batch moves on.
// Workspaces run sequentially; each gets its own database handle and
// the cancellation token is honored between workspaces.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::warn;

use crate::contracts::CancellationToken;
use crate::types::WorkspaceAlias;
use crate::workspace::{ConfigDocument, WorkspaceEntry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSelection {
    /// Every enabled workspace.
    All,
    /// The named subset (still restricted to enabled entries).
    Subset(Vec<WorkspaceAlias>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(WorkspaceAlias, T)>,
    pub failed: Vec<(WorkspaceAlias, String)>,
}

impl<T> BatchReport<T> {
    pub fn is_all_ok(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }
}

/// Fan an async operation across the selected workspaces.
pub async fn run_batch<T, F, Fut>(
    config: &ConfigDocument,
    selection: &WorkspaceSelection,
    cancellation: &CancellationToken,
    op: F,
) -> Result<BatchReport<T>>
where
    F: Fn(WorkspaceEntry) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let selected: Vec<WorkspaceEntry> = config
        .enabled_workspaces()
        .filter(|w| match selection {
            WorkspaceSelection::All => true,
            WorkspaceSelection::Subset(aliases) => aliases.contains(&w.alias),
        })
        .cloned()
        .collect();

    let mut report = BatchReport {
        succeeded: Vec::new(),
        failed: Vec::new(),
    };

    for workspace in selected {
        cancellation.check()?;
        let alias = workspace.alias.clone();
        match op(workspace).await {
            Ok(value) => report.succeeded.push((alias, value)),
            Err(e) => {
                warn!(workspace = %alias, error = %e, "batch operation failed; continuing");
                report.failed.push((alias, format!("{e:#}")));
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::add_workspace;
    use std::path::PathBuf;

    fn config_with(aliases: &[(&str, bool)]) -> ConfigDocument {
        let mut doc = ConfigDocument::default();
        for (alias, enabled) in aliases {
            let mut entry = WorkspaceEntry::with_defaults(
                WorkspaceAlias::new(*alias).unwrap(),
                format!("root-{alias}"),
                PathBuf::from("/tmp/exports"),
            );
            entry.enabled = *enabled;
            add_workspace(&mut doc, entry).unwrap();
        }
        doc
    }

    #[tokio::test]
    async fn continues_past_failures() -> Result<()> {
        let config = config_with(&[("a", true), ("b", true), ("c", true)]);
        let report = run_batch(
            &config,
            &WorkspaceSelection::All,
            &CancellationToken::new(),
            |w| async move {
                if w.alias.as_str() == "b" {
                    anyhow::bail!("boom");
                }
                Ok(w.alias.as_str().to_uppercase())
            },
        )
        .await?;

        assert_eq!(report.succeeded.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0.as_str(), "b");
        assert!(!report.is_all_ok());
        Ok(())
    }

    #[tokio::test]
    async fn disabled_workspaces_are_skipped() -> Result<()> {
        let config = config_with(&[("a", true), ("b", false)]);
        let report = run_batch(
            &config,
            &WorkspaceSelection::All,
            &CancellationToken::new(),
            |w| async move { Ok(w.alias.as_str().to_string()) },
        )
        .await?;
        assert_eq!(report.total(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn subset_selection() -> Result<()> {
        let config = config_with(&[("a", true), ("b", true)]);
        let report = run_batch(
            &config,
            &WorkspaceSelection::Subset(vec![WorkspaceAlias::new("b").unwrap()]),
            &CancellationToken::new(),
            |w| async move { Ok(w.alias.as_str().to_string()) },
        )
        .await?;
        assert_eq!(report.succeeded.len(), 1);
        assert_eq!(report.succeeded[0].0.as_str(), "b");
        Ok(())
    }

    #[tokio::test]
    async fn cancellation_stops_the_batch() {
        let config = config_with(&[("a", true)]);
        let token = CancellationToken::new();
        token.cancel();
        let result = run_batch(&config, &WorkspaceSelection::All, &token, |w| async move {
            Ok(w.alias.as_str().to_string())
        })
        .await;
        assert!(result.is_err());
    }
}
