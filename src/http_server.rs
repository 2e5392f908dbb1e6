// HTTP Webhook Server
// Loopback-bound axum server exposing the query engine, schema service
// and embedding subsystem to local automations. Responses default to
// plain text (the write-sink paste shape); `?format=json` switches to
// JSON. CORS is open and there is no authentication; binding beyond
// loopback is the operator's explicit choice.

use anyhow::{Context, Result};
use axum::{
    extract::{Query as AxumQuery, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};

use crate::contracts::SystemClock;
use crate::database::DatabaseRegistry;
use crate::embedding_service::{embed_stats, semantic_search};
use crate::embeddings::RemoteEmbeddingProvider;
use crate::errors::{to_supertag_error, SupertagError};
use crate::content_filter::ContentFilter;
use crate::query_engine::{QueryEngine, QueryOptions, ResolutionMode};
use crate::query_parser::parse;
use crate::schema::SchemaService;
use crate::types::{NodeId, ValidatedLimit};
use crate::workspace::WorkspaceSelector;

pub const DEFAULT_PORT: u16 = 7119;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub pid_file: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            pid_file: None,
        }
    }
}

#[derive(Clone)]
struct AppState {
    registry: Arc<DatabaseRegistry>,
    started: Instant,
}

/// Serve until the process is stopped. The PID file (when configured)
/// is created on start and removed on graceful shutdown; a stale file
/// left by a dead process is cleaned up here.
pub async fn start_server(registry: Arc<DatabaseRegistry>, config: ServerConfig) -> Result<()> {
    if let Some(pid_file) = &config.pid_file {
        create_pid_file(pid_file)?;
    }

    let state = AppState {
        registry,
        started: Instant::now(),
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/workspaces", get(workspaces))
        .route("/help", get(help))
        .route("/search", post(search))
        .route("/stats", get(stats))
        .route("/tags", post(tags))
        .route("/nodes", post(nodes))
        .route("/refs", post(refs))
        .route("/semantic-search", post(semantic))
        .route("/embed-stats", get(embed_stats_endpoint))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state);

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding webhook listener on {addr}"))?;
    info!(%addr, "webhook server listening");

    let result = axum::serve(listener, app).await;

    if let Some(pid_file) = &config.pid_file {
        remove_pid_file(pid_file);
    }
    result.context("webhook server terminated")
}

/// Create the PID file, replacing a stale one whose process is gone.
pub fn create_pid_file(path: &Path) -> Result<()> {
    if path.exists() {
        let stale = std::fs::read_to_string(path)
            .ok()
            .and_then(|s| s.trim().parse::<u32>().ok())
            .map(|pid| !process_alive(pid))
            .unwrap_or(true);
        if stale {
            warn!(path = %path.display(), "removing stale pid file");
            let _ = std::fs::remove_file(path);
        } else {
            anyhow::bail!(SupertagError::InvalidParameter(format!(
                "webhook already running (pid file {})",
                path.display()
            )));
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    Ok(())
}

pub fn remove_pid_file(path: &Path) {
    let _ = std::fs::remove_file(path);
}

fn process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

// --- request plumbing ---

#[derive(Debug, Deserialize)]
struct FormatParams {
    #[serde(default)]
    format: Option<String>,
    #[serde(default)]
    workspace: Option<String>,
}

impl FormatParams {
    fn json(&self) -> bool {
        self.format.as_deref() == Some("json")
    }
}

/// Anyhow error carrier mapping to the documented status codes.
struct ApiError(anyhow::Error);

impl<E: Into<anyhow::Error>> From<E> for ApiError {
    fn from(e: E) -> Self {
        Self(e.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let kind = to_supertag_error(&self.0);
        crate::observability::record_error();
        let status =
            StatusCode::from_u16(kind.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = serde_json::json!({
            "error": kind.kind_name(),
            "message": kind.to_string(),
            "retryable": kind.retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult = std::result::Result<Response, ApiError>;

/// Text by default, JSON on request.
fn respond(json: bool, text: String, value: serde_json::Value) -> Response {
    if json {
        Json(value).into_response()
    } else {
        text.into_response()
    }
}

fn selector(workspace: &Option<String>) -> WorkspaceSelector {
    WorkspaceSelector::from_flag(workspace.clone())
}

// --- handlers ---

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    let counters = crate::observability::counters();
    Json(serde_json::json!({
        "status": "ok",
        "version": crate::VERSION,
        "uptime_secs": state.started.elapsed().as_secs(),
        "operations": counters.operations,
        "queries": counters.queries,
        "index_runs": counters.index_runs,
        "errors": counters.errors,
    }))
}

async fn workspaces(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
) -> ApiResult {
    let config = state.registry.config();
    let rows: Vec<serde_json::Value> = config
        .workspaces
        .iter()
        .map(|w| {
            serde_json::json!({
                "alias": w.alias.as_str(),
                "enabled": w.enabled,
                "default": w.default,
                "export_dir": w.export_dir,
            })
        })
        .collect();
    let text = config
        .workspaces
        .iter()
        .map(|w| {
            format!(
                "{}{}{}",
                w.alias,
                if w.default { " (default)" } else { "" },
                if w.enabled { "" } else { " [disabled]" }
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(respond(
        params.json(),
        text,
        serde_json::json!({ "workspaces": rows }),
    ))
}

async fn help(AxumQuery(params): AxumQuery<FormatParams>) -> ApiResult {
    let endpoints = [
        ("GET", "/health", "liveness and version"),
        ("GET", "/workspaces", "configured workspaces"),
        ("GET", "/help", "this overview"),
        ("POST", "/search", "full-text or query-language search"),
        ("GET", "/stats", "store statistics"),
        ("POST", "/tags", "supertags with node counts"),
        ("POST", "/nodes", "node details by id"),
        ("POST", "/refs", "references of a node"),
        ("POST", "/semantic-search", "embedding KNN search"),
        ("GET", "/embed-stats", "embedding coverage"),
    ];
    let text = endpoints
        .iter()
        .map(|(m, p, d)| format!("{m:5} {p:18} {d}"))
        .collect::<Vec<_>>()
        .join("\n");
    let json = serde_json::json!({
        "endpoints": endpoints
            .iter()
            .map(|(m, p, d)| serde_json::json!({"method": m, "path": p, "description": d}))
            .collect::<Vec<_>>()
    });
    Ok(respond(params.json(), text, json))
}

#[derive(Debug, Deserialize)]
struct SearchBody {
    /// Full query-language expression; wins over `q`.
    #[serde(default)]
    query: Option<String>,
    /// Full-text search over node names.
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    tag: Option<String>,
    #[serde(default)]
    mode: Option<String>,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    workspace: Option<String>,
}

fn resolution_from(mode: &Option<String>) -> ResolutionMode {
    match mode.as_deref() {
        Some("named") => ResolutionMode::Named,
        Some("raw") => ResolutionMode::Raw,
        _ => ResolutionMode::Tagged,
    }
}

async fn search(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
    Json(body): Json<SearchBody>,
) -> ApiResult {
    let workspace = body.workspace.clone().or(params.workspace.clone());
    let (_, db) = state.registry.database(&selector(&workspace))?;
    let engine = QueryEngine::new(&db, Arc::new(SystemClock));
    let opts = QueryOptions::default();
    let limit = body
        .limit
        .map(ValidatedLimit::clamped)
        .unwrap_or_default();

    if let Some(expr) = &body.query {
        let query = parse(expr).map_err(|e| SupertagError::InvalidFormat(e.to_string()))?;
        let result = engine.execute(&query, &opts)?;
        let text = result
            .hits
            .iter()
            .map(|h| format!("- {}", h.name.as_deref().unwrap_or(h.id.as_str())))
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(respond(params.json(), text, serde_json::to_value(&result)?));
    }

    if let Some(q) = &body.q {
        let query_text: String = q.chars().take(512).collect();
        if let Some(tag) = &body.tag {
            // Tag-scoped text search goes through the query language.
            let expr = format!("find {tag} where name ~ \"{query_text}\"");
            let query = parse(&expr).map_err(|e| SupertagError::InvalidFormat(e.to_string()))?;
            let result = engine.execute(&query, &opts)?;
            let text = result
                .hits
                .iter()
                .map(|h| format!("- {}", h.name.as_deref().unwrap_or(h.id.as_str())))
                .collect::<Vec<_>>()
                .join("\n");
            return Ok(respond(params.json(), text, serde_json::to_value(&result)?));
        }
        let hits = engine.search_names(&query_text, resolution_from(&body.mode), limit, &opts)?;
        let text = hits
            .iter()
            .map(|h| {
                format!(
                    "- {} ({} match{})",
                    h.name.as_deref().unwrap_or(h.id.as_str()),
                    h.match_count,
                    if h.match_count == 1 { "" } else { "es" }
                )
            })
            .collect::<Vec<_>>()
            .join("\n");
        return Ok(respond(params.json(), text, serde_json::to_value(&hits)?));
    }

    Err(SupertagError::MissingRequired("q or query".into()).into())
}

async fn stats(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
) -> ApiResult {
    let (entry, db) = state.registry.database(&selector(&params.workspace))?;
    let stats = db.stats();
    let text = format!(
        "workspace: {}\nnodes: {}\nreferences: {}\ntag applications: {}\nfield values: {}\nsupertags: {}\nlast export: {}",
        entry.alias,
        stats.store.nodes,
        stats.store.references,
        stats.store.tag_applications,
        stats.store.field_values,
        stats.store.supertags,
        stats.store.export_file.as_deref().unwrap_or("-"),
    );
    Ok(respond(params.json(), text, serde_json::to_value(&stats)?))
}

#[derive(Debug, Deserialize)]
struct TagsBody {
    #[serde(default)]
    workspace: Option<String>,
    #[serde(default)]
    search: Option<String>,
}

async fn tags(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
    Json(body): Json<TagsBody>,
) -> ApiResult {
    let workspace = body.workspace.clone().or(params.workspace.clone());
    let (_, db) = state.registry.database(&selector(&workspace))?;
    let service = SchemaService::new(db.store.clone());
    let tags = match &body.search {
        Some(q) => service.search_supertags(q),
        None => service.list_supertags(),
    };
    let tables = db.store.snapshot();
    let rows: Vec<serde_json::Value> = tags
        .iter()
        .map(|t| {
            serde_json::json!({
                "id": t.id.as_str(),
                "name": t.name,
                "nodes": tables.nodes_with_tag(&t.id).len(),
                "fields": t.fields.len(),
            })
        })
        .collect();
    let text = tags
        .iter()
        .map(|t| {
            format!(
                "#{} ({} nodes)",
                t.name,
                tables.nodes_with_tag(&t.id).len()
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(respond(params.json(), text, serde_json::json!({ "tags": rows })))
}

#[derive(Debug, Deserialize)]
struct NodeBody {
    id: String,
    #[serde(default)]
    depth: Option<usize>,
    #[serde(default)]
    workspace: Option<String>,
}

async fn nodes(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
    Json(body): Json<NodeBody>,
) -> ApiResult {
    let workspace = body.workspace.clone().or(params.workspace.clone());
    let (_, db) = state.registry.database(&selector(&workspace))?;
    let tables = db.store.snapshot();
    let id = NodeId::new(&body.id).map_err(|e| SupertagError::InvalidParameter(e.to_string()))?;
    let node = tables
        .node(&id)
        .ok_or_else(|| SupertagError::NodeNotFound(body.id.clone()))?;

    let depth = body.depth.unwrap_or(1).min(5);
    let detail = node_detail(&tables, node, depth);
    let text = render_node_text(&detail, 0);
    Ok(respond(params.json(), text, serde_json::to_value(&detail)?))
}

/// Expanded view of one node, shared with the MCP `node` tool.
#[derive(Debug, Serialize)]
pub struct NodeDetail {
    pub id: String,
    pub name: Option<String>,
    pub tags: Vec<String>,
    pub fields: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDetail>,
}

pub fn node_detail(
    tables: &crate::store::Tables,
    node: &crate::store::NodeRow,
    depth: usize,
) -> NodeDetail {
    let mut fields: HashMap<String, Vec<String>> = HashMap::new();
    for row in tables.field_values_of(&node.id) {
        if let Some(text) = &row.value_text {
            fields
                .entry(row.field_name.clone())
                .or_default()
                .push(text.clone());
        }
    }
    let children = if depth > 0 {
        tables
            .children_of(&node.id)
            .iter()
            .filter_map(|c| tables.node(c))
            .map(|c| node_detail(tables, c, depth - 1))
            .collect()
    } else {
        Vec::new()
    };
    NodeDetail {
        id: node.id.to_string(),
        name: node.name.clone(),
        tags: tables
            .tags_of(&node.id)
            .iter()
            .map(|t| t.tag_name.clone())
            .collect(),
        fields,
        children,
    }
}

fn render_node_text(detail: &NodeDetail, indent: usize) -> String {
    let pad = "  ".repeat(indent);
    let mut out = format!(
        "{pad}- {}{}",
        detail.name.as_deref().unwrap_or(&detail.id),
        if detail.tags.is_empty() {
            String::new()
        } else {
            format!(" #{}", detail.tags.join(" #"))
        }
    );
    for (field, values) in &detail.fields {
        out.push_str(&format!("\n{pad}  {}: {}", field, values.join(", ")));
    }
    for child in &detail.children {
        out.push('\n');
        out.push_str(&render_node_text(child, indent + 1));
    }
    out
}

async fn refs(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
    Json(body): Json<NodeBody>,
) -> ApiResult {
    let workspace = body.workspace.clone().or(params.workspace.clone());
    let (_, db) = state.registry.database(&selector(&workspace))?;
    let tables = db.store.snapshot();
    let id = NodeId::new(&body.id).map_err(|e| SupertagError::InvalidParameter(e.to_string()))?;
    if tables.node(&id).is_none() {
        return Err(SupertagError::NodeNotFound(body.id.clone()).into());
    }

    let outbound: Vec<serde_json::Value> = tables
        .outbound_refs(&id)
        .iter()
        .map(|r| {
            serde_json::json!({
                "to": r.to_node.as_str(),
                "type": r.reference_type,
                "name": tables.node(&r.to_node).and_then(|n| n.name.clone()),
            })
        })
        .collect();
    let inbound: Vec<serde_json::Value> = tables
        .derived
        .inbound_refs
        .get(&id)
        .map(|sources| {
            sources
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "from": s.as_str(),
                        "name": tables.node(s).and_then(|n| n.name.clone()),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    let text = format!(
        "outbound: {}\ninbound: {}",
        outbound.len(),
        inbound.len()
    );
    Ok(respond(
        params.json(),
        text,
        serde_json::json!({ "outbound": outbound, "inbound": inbound }),
    ))
}

#[derive(Debug, Deserialize)]
struct SemanticBody {
    q: String,
    #[serde(default)]
    limit: Option<usize>,
    #[serde(default)]
    workspace: Option<String>,
}

async fn semantic(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
    Json(body): Json<SemanticBody>,
) -> ApiResult {
    let workspace = body.workspace.clone().or(params.workspace.clone());
    let (_, db) = state.registry.database(&selector(&workspace))?;
    let provider = Arc::new(RemoteEmbeddingProvider::new(
        state.registry.config().effective_embedding(),
    )?);
    let limit = body
        .limit
        .map(ValidatedLimit::clamped)
        .unwrap_or_default();
    let hits = semantic_search(&db, provider, &body.q, limit, &Default::default()).await?;
    let text = hits
        .iter()
        .map(|h| {
            format!(
                "- {} ({:.3})",
                h.name.as_deref().unwrap_or(h.id.as_str()),
                h.score
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    Ok(respond(params.json(), text, serde_json::to_value(&hits)?))
}

async fn embed_stats_endpoint(
    State(state): State<AppState>,
    AxumQuery(params): AxumQuery<FormatParams>,
) -> ApiResult {
    let (_, db) = state.registry.database(&selector(&params.workspace))?;
    let stats = embed_stats(&db, &ContentFilter::default());
    let text = format!(
        "records: {}\ncandidates: {}\nstale: {}\ndimensions: {}",
        stats.records,
        stats.candidates,
        stats.stale,
        stats
            .dimensions
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".into()),
    );
    Ok(respond(params.json(), text, serde_json::to_value(&stats)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_file_lifecycle() -> Result<()> {
        let dir = tempfile::TempDir::new()?;
        let pid_path = dir.path().join("webhook.pid");

        create_pid_file(&pid_path)?;
        let written: u32 = std::fs::read_to_string(&pid_path)?.trim().parse()?;
        assert_eq!(written, std::process::id());

        // Our own live pid blocks a second start.
        assert!(create_pid_file(&pid_path).is_err());

        // A dead pid is stale and gets cleaned up.
        std::fs::write(&pid_path, "999999999")?;
        create_pid_file(&pid_path)?;

        remove_pid_file(&pid_path);
        assert!(!pid_path.exists());
        Ok(())
    }

    #[test]
    fn resolution_mode_parsing() {
        assert_eq!(resolution_from(&None), ResolutionMode::Tagged);
        assert_eq!(
            resolution_from(&Some("named".into())),
            ResolutionMode::Named
        );
        assert_eq!(resolution_from(&Some("raw".into())), ResolutionMode::Raw);
        assert_eq!(
            resolution_from(&Some("bogus".into())),
            ResolutionMode::Tagged
        );
    }
}
