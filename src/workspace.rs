// Workspaces
// Multi-workspace configuration and routing. The configuration lives in
// one TOML document (workspace entries, default alias, embedding sink
// settings); each workspace owns an isolated store, vector directory
// and schema cache. Resolution priority for choosing a workspace:
// explicit path override > explicit alias > configured default >
// single-db legacy path.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::database::DatabasePaths;
use crate::embeddings::EmbeddingConfig;
use crate::errors::SupertagError;
use crate::types::WorkspaceAlias;

pub const ENV_CONFIG: &str = "SUPERTAG_CONFIG";
pub const ENV_DATA_DIR: &str = "SUPERTAG_DATA_DIR";
pub const ENV_WORKSPACE: &str = "SUPERTAG_WORKSPACE";
pub const ENV_TOKEN: &str = "SUPERTAG_TOKEN";
pub const ENV_TARGET: &str = "SUPERTAG_TARGET";
pub const ENV_ENDPOINT: &str = "SUPERTAG_ENDPOINT";

/// One configured workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkspaceEntry {
    pub alias: WorkspaceAlias,
    pub root_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nodeid: Option<String>,
    pub export_dir: PathBuf,
    pub db_path: PathBuf,
    pub schema_cache_path: PathBuf,
    pub enabled: bool,
    #[serde(default)]
    pub default: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

impl WorkspaceEntry {
    /// Conventional entry under the data root.
    pub fn with_defaults(alias: WorkspaceAlias, root_id: String, export_dir: PathBuf) -> Self {
        let dir = data_root().join(alias.as_str());
        let paths = DatabasePaths::under(&dir);
        Self {
            alias,
            root_id,
            nodeid: None,
            export_dir,
            db_path: paths.db_path,
            schema_cache_path: paths.schema_cache_path,
            enabled: true,
            default: false,
            token: None,
            target: None,
        }
    }

    pub fn database_paths(&self) -> DatabasePaths {
        DatabasePaths {
            db_path: self.db_path.clone(),
            vector_dir: self
                .db_path
                .parent()
                .map(|p| p.join("vectors"))
                .unwrap_or_else(|| PathBuf::from("vectors")),
            schema_cache_path: self.schema_cache_path.clone(),
        }
    }

    /// Workspace token, with the environment taking precedence.
    pub fn effective_token(&self) -> Option<String> {
        std::env::var(ENV_TOKEN).ok().or_else(|| self.token.clone())
    }

    pub fn effective_target(&self) -> Option<String> {
        std::env::var(ENV_TARGET)
            .ok()
            .or_else(|| self.target.clone())
    }
}

/// The persisted configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigDocument {
    #[serde(default)]
    pub workspaces: Vec<WorkspaceEntry>,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_port: Option<u16>,
}

impl ConfigDocument {
    pub fn default_workspace(&self) -> Option<&WorkspaceEntry> {
        self.workspaces.iter().find(|w| w.default)
    }

    pub fn workspace(&self, alias: &str) -> Option<&WorkspaceEntry> {
        self.workspaces.iter().find(|w| w.alias.as_str() == alias)
    }

    pub fn enabled_workspaces(&self) -> impl Iterator<Item = &WorkspaceEntry> {
        self.workspaces.iter().filter(|w| w.enabled)
    }

    /// Embedding settings with environment overrides applied.
    pub fn effective_embedding(&self) -> EmbeddingConfig {
        let mut config = self.embedding.clone();
        if let Ok(endpoint) = std::env::var(ENV_ENDPOINT) {
            config.endpoint = endpoint;
        }
        config
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for workspace in &self.workspaces {
            if !seen.insert(workspace.alias.clone()) {
                bail!(SupertagError::ConfigInvalid(format!(
                    "duplicate workspace alias '{}'",
                    workspace.alias
                )));
            }
        }
        let defaults = self.workspaces.iter().filter(|w| w.default).count();
        if defaults > 1 {
            bail!(SupertagError::ConfigInvalid(
                "more than one default workspace".into()
            ));
        }
        Ok(())
    }
}

/// Where user state lives. Overridable for tests and portable setups.
pub fn data_root() -> PathBuf {
    if let Ok(dir) = std::env::var(ENV_DATA_DIR) {
        return PathBuf::from(dir);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".local/share/supertag")
}

pub fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var(ENV_CONFIG) {
        return PathBuf::from(path);
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    PathBuf::from(home).join(".config/supertag/config.toml")
}

/// Legacy single-database location used before workspaces existed.
pub fn legacy_db_path() -> PathBuf {
    data_root().join("supertag.stdb")
}

pub fn load_config(path: &Path) -> Result<ConfigDocument> {
    if !path.exists() {
        bail!(SupertagError::ConfigNotFound(path.display().to_string()));
    }
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let doc: ConfigDocument = toml::from_str(&text)
        .map_err(|e| SupertagError::ConfigInvalid(format!("{}: {e}", path.display())))?;
    doc.validate()?;
    Ok(doc)
}

/// Load the config, treating a missing file as empty. Surfaces that can
/// work without configuration (e.g. `workspace add`) use this.
pub fn load_or_default(path: &Path) -> Result<ConfigDocument> {
    if path.exists() {
        load_config(path)
    } else {
        Ok(ConfigDocument::default())
    }
}

pub fn save_config(path: &Path, doc: &ConfigDocument) -> Result<()> {
    doc.validate()?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(doc).context("encoding config document")?;
    let tmp = path.with_extension("toml.tmp");
    std::fs::write(&tmp, text.as_bytes())?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("installing config {}", path.display()))?;
    Ok(())
}

/// How a caller names the workspace to operate on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkspaceSelector {
    /// Explicit store path; bypasses configuration entirely.
    Path(PathBuf),
    Alias(String),
    Default,
}

impl WorkspaceSelector {
    /// Selector from CLI flags with the environment fallback applied.
    pub fn from_flag(alias: Option<String>) -> Self {
        match alias.or_else(|| std::env::var(ENV_WORKSPACE).ok()) {
            Some(alias) => WorkspaceSelector::Alias(alias),
            None => WorkspaceSelector::Default,
        }
    }
}

/// Resolve a selector against the configuration.
pub fn resolve(doc: &ConfigDocument, selector: &WorkspaceSelector) -> Result<WorkspaceEntry> {
    match selector {
        WorkspaceSelector::Path(path) => {
            let alias = WorkspaceAlias::new("adhoc")?;
            let parent = path.parent().unwrap_or_else(|| Path::new("."));
            Ok(WorkspaceEntry {
                alias,
                root_id: String::new(),
                nodeid: None,
                export_dir: parent.to_path_buf(),
                db_path: path.clone(),
                schema_cache_path: parent.join("schema.json"),
                enabled: true,
                default: false,
                token: None,
                target: None,
            })
        }
        WorkspaceSelector::Alias(alias) => doc
            .workspace(alias)
            .cloned()
            .ok_or_else(|| SupertagError::WorkspaceNotFound(alias.clone()).into()),
        WorkspaceSelector::Default => {
            if let Some(default) = doc.default_workspace() {
                return Ok(default.clone());
            }
            if doc.workspaces.len() == 1 {
                return Ok(doc.workspaces[0].clone());
            }
            // Single-db legacy fallback for unconfigured setups.
            let legacy = legacy_db_path();
            resolve(doc, &WorkspaceSelector::Path(legacy))
        }
    }
}

/// One-way legacy migration: copy the old single database into the
/// workspace layout. The old file is intentionally preserved.
pub fn migrate_legacy(entry: &WorkspaceEntry) -> Result<bool> {
    let legacy = legacy_db_path();
    if !legacy.exists() || entry.db_path == legacy {
        return Ok(false);
    }
    if entry.db_path.exists() {
        return Ok(false);
    }
    if let Some(parent) = entry.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(&legacy, &entry.db_path)
        .with_context(|| format!("copying legacy store to {}", entry.db_path.display()))?;
    info!(
        from = %legacy.display(),
        to = %entry.db_path.display(),
        "migrated legacy database (original preserved)"
    );
    Ok(true)
}

// Mutation helpers used by the `workspace` CLI commands.

pub fn add_workspace(doc: &mut ConfigDocument, entry: WorkspaceEntry) -> Result<()> {
    if doc.workspace(entry.alias.as_str()).is_some() {
        bail!(SupertagError::InvalidParameter(format!(
            "workspace '{}' already exists",
            entry.alias
        )));
    }
    let make_default = doc.workspaces.is_empty();
    let mut entry = entry;
    if make_default {
        entry.default = true;
    }
    doc.workspaces.push(entry);
    Ok(())
}

pub fn remove_workspace(doc: &mut ConfigDocument, alias: &str) -> Result<WorkspaceEntry> {
    let index = doc
        .workspaces
        .iter()
        .position(|w| w.alias.as_str() == alias)
        .ok_or_else(|| SupertagError::WorkspaceNotFound(alias.to_string()))?;
    Ok(doc.workspaces.remove(index))
}

pub fn set_default(doc: &mut ConfigDocument, alias: &str) -> Result<()> {
    if doc.workspace(alias).is_none() {
        bail!(SupertagError::WorkspaceNotFound(alias.to_string()));
    }
    for workspace in &mut doc.workspaces {
        workspace.default = workspace.alias.as_str() == alias;
    }
    Ok(())
}

pub fn set_enabled(doc: &mut ConfigDocument, alias: &str, enabled: bool) -> Result<()> {
    let workspace = doc
        .workspaces
        .iter_mut()
        .find(|w| w.alias.as_str() == alias)
        .ok_or_else(|| SupertagError::WorkspaceNotFound(alias.to_string()))?;
    workspace.enabled = enabled;
    Ok(())
}
