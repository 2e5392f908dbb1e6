// MCP Server
// Tool dispatch for the stdio transport. Every tool is a thin wrapper
// over the query engine, schema service, payload builder or indexer;
// all responses are JSON and tool failures carry the error kind name
// in the JSON-RPC error `data`.

use anyhow::Result;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::contracts::SystemClock;
use crate::database::DatabaseRegistry;
use crate::errors::to_supertag_error;
use crate::http_server::node_detail;
use crate::indexer::IndexOptions;
use crate::mcp::types::{
    McpError, McpRequest, McpResponse, RequestId, ToolDefinition, METHOD_NOT_FOUND, PARSE_ERROR,
    SERVER_ERROR,
};
use crate::payload::{build_payload, parse_tag_list};
use crate::query_engine::{QueryEngine, QueryOptions, ResolutionMode};
use crate::query_parser::parse;
use crate::schema::SchemaService;
use crate::types::{NodeId, ValidatedLimit};
use crate::watcher::index_latest;
use crate::workspace::WorkspaceSelector;
use crate::write_sink::HttpWriteSink;
use crate::contracts::WriteSink;

pub struct McpServer {
    registry: Arc<DatabaseRegistry>,
}

impl McpServer {
    pub fn new(registry: Arc<DatabaseRegistry>) -> Self {
        Self { registry }
    }

    /// Handle one raw JSON-RPC line. `None` means no response should
    /// be written (notification or unparsable id).
    pub async fn handle_line(&self, line: &str) -> Option<McpResponse> {
        let request: McpRequest = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                return Some(McpResponse::failure(
                    RequestId::Number(0),
                    McpError {
                        code: PARSE_ERROR,
                        message: format!("invalid JSON-RPC request: {e}"),
                        data: None,
                    },
                ));
            }
        };
        let id = request.id.clone()?;
        Some(self.handle(id, &request.method, request.params).await)
    }

    pub async fn handle(&self, id: RequestId, method: &str, params: Value) -> McpResponse {
        match method {
            "initialize" => McpResponse::success(
                id,
                json!({
                    "protocolVersion": "2024-11-05",
                    "serverInfo": {"name": "supertag", "version": crate::VERSION},
                    "capabilities": {"tools": {}},
                }),
            ),
            "tools/list" => McpResponse::success(
                id,
                json!({ "tools": tool_definitions() }),
            ),
            "tools/call" => {
                let name = params
                    .get("name")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let args = params.get("arguments").cloned().unwrap_or(json!({}));
                match self.call_tool(&name, &args).await {
                    Ok(result) => McpResponse::success(
                        id,
                        json!({
                            "content": [{"type": "text", "text": result.to_string()}],
                        }),
                    ),
                    Err(e) => {
                        let kind = to_supertag_error(&e);
                        McpResponse::failure(
                            id,
                            McpError {
                                code: SERVER_ERROR,
                                message: kind.to_string(),
                                data: Some(json!({
                                    "kind": kind.kind_name(),
                                    "retryable": kind.retryable(),
                                })),
                            },
                        )
                    }
                }
            }
            other => McpResponse::failure(
                id,
                McpError {
                    code: METHOD_NOT_FOUND,
                    message: format!("unknown method '{other}'"),
                    data: None,
                },
            ),
        }
    }

    async fn call_tool(&self, name: &str, args: &Value) -> Result<Value> {
        let workspace = args
            .get("workspace")
            .and_then(Value::as_str)
            .map(str::to_string);
        let selector = WorkspaceSelector::from_flag(workspace);

        match name {
            "search" => {
                let (_, db) = self.registry.database(&selector)?;
                let engine = QueryEngine::new(&db, Arc::new(SystemClock));
                let opts = QueryOptions::default();
                if let Some(expr) = args.get("query").and_then(Value::as_str) {
                    let query = parse(expr).map_err(|e| {
                        crate::errors::SupertagError::InvalidFormat(e.to_string())
                    })?;
                    return Ok(serde_json::to_value(engine.execute(&query, &opts)?)?);
                }
                let q = required_str(args, "q")?;
                let limit = limit_from(args);
                let mode = match args.get("mode").and_then(Value::as_str) {
                    Some("named") => ResolutionMode::Named,
                    Some("raw") => ResolutionMode::Raw,
                    _ => ResolutionMode::Tagged,
                };
                Ok(serde_json::to_value(
                    engine.search_names(q, mode, limit, &opts)?,
                )?)
            }
            "tagged" => {
                let tag = required_str(args, "tag")?;
                let (_, db) = self.registry.database(&selector)?;
                let engine = QueryEngine::new(&db, Arc::new(SystemClock));
                let mut query = crate::builders::QueryBuilder::find(tag).build();
                query.limit = args
                    .get("limit")
                    .and_then(Value::as_u64)
                    .map(|n| n as usize);
                Ok(serde_json::to_value(
                    engine.execute(&query, &QueryOptions::default())?,
                )?)
            }
            "stats" => {
                let (entry, db) = self.registry.database(&selector)?;
                let mut value = serde_json::to_value(db.stats())?;
                if let Value::Object(map) = &mut value {
                    map.insert("workspace".into(), json!(entry.alias.as_str()));
                }
                Ok(value)
            }
            "supertags" => {
                let (_, db) = self.registry.database(&selector)?;
                let service = SchemaService::new(db.store.clone());
                let tags = match args.get("search").and_then(Value::as_str) {
                    Some(q) => service.search_supertags(q),
                    None => service.list_supertags(),
                };
                Ok(serde_json::to_value(tags)?)
            }
            "node" => {
                let id_text = required_str(args, "id")?;
                let depth = args
                    .get("depth")
                    .and_then(Value::as_u64)
                    .unwrap_or(1)
                    .min(5) as usize;
                let (_, db) = self.registry.database(&selector)?;
                let tables = db.store.snapshot();
                let id = NodeId::new(id_text).map_err(|e| {
                    crate::errors::SupertagError::InvalidParameter(e.to_string())
                })?;
                let node = tables.node(&id).ok_or_else(|| {
                    crate::errors::SupertagError::NodeNotFound(id_text.to_string())
                })?;
                Ok(serde_json::to_value(node_detail(&tables, node, depth))?)
            }
            "create" => {
                let tag = required_str(args, "tag")?;
                let node_name = required_str(args, "name")?;
                let fields = args
                    .get("fields")
                    .and_then(Value::as_object)
                    .cloned()
                    .unwrap_or_default();
                let dry_run = args
                    .get("dry_run")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);

                let (entry, db) = self.registry.database(&selector)?;
                let service = SchemaService::new(db.store.clone());
                let payload =
                    build_payload(&service, &parse_tag_list(tag), node_name, &fields)?;
                let payload_value = serde_json::to_value(&payload)?;

                if dry_run {
                    return Ok(json!({"dry_run": true, "payload": payload_value}));
                }
                let target = entry.effective_target().ok_or_else(|| {
                    crate::errors::SupertagError::MissingRequired(
                        "workspace target for create".into(),
                    )
                })?;
                let token = entry.effective_token().ok_or_else(|| {
                    crate::errors::SupertagError::ApiKeyMissing(
                        "workspace token for create".into(),
                    )
                })?;
                let sink = HttpWriteSink::new(target.clone(), Some(token))?;
                sink.post(&target, &payload_value).await?;
                Ok(json!({"posted": true, "payload": payload_value}))
            }
            "sync" => {
                let action = args
                    .get("action")
                    .and_then(Value::as_str)
                    .unwrap_or("status");
                match action {
                    "index" => {
                        let entry =
                            crate::workspace::resolve(self.registry.config(), &selector)?;
                        let db = crate::database::Database::open(entry.database_paths())?;
                        let report = index_latest(
                            &db,
                            &entry.export_dir,
                            &entry.schema_cache_path,
                            &IndexOptions::default(),
                        )
                        .await?;
                        Ok(serde_json::to_value(report)?)
                    }
                    "status" => {
                        let (entry, db) = self.registry.database(&selector)?;
                        let stats = db.stats();
                        Ok(json!({
                            "workspace": entry.alias.as_str(),
                            "nodes": stats.store.nodes,
                            "export_file": stats.store.export_file,
                            "last_indexed_ms": stats.store.last_indexed_ms,
                        }))
                    }
                    other => Err(crate::errors::SupertagError::InvalidParameter(format!(
                        "sync action '{other}'"
                    ))
                    .into()),
                }
            }
            other => Err(crate::errors::SupertagError::InvalidParameter(format!(
                "unknown tool '{other}'"
            ))
            .into()),
        }
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| {
        anyhow::Error::new(crate::errors::SupertagError::MissingRequired(
            key.to_string(),
        ))
    })
}

fn limit_from(args: &Value) -> ValidatedLimit {
    args.get("limit")
        .and_then(Value::as_u64)
        .map(|n| ValidatedLimit::clamped(n as usize))
        .unwrap_or_default()
}

fn tool_definitions() -> Vec<ToolDefinition> {
    fn workspace_prop() -> Value {
        json!({"type": "string", "description": "workspace alias"})
    }
    vec![
        ToolDefinition {
            name: "search".into(),
            description: "Full-text or query-language search over the indexed workspace".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "q": {"type": "string", "description": "full-text search over node names"},
                    "query": {"type": "string", "description": "query-language expression, e.g. find task where Status = Done"},
                    "mode": {"type": "string", "enum": ["tagged", "named", "raw"]},
                    "limit": {"type": "integer"},
                    "workspace": workspace_prop(),
                },
            }),
        },
        ToolDefinition {
            name: "tagged".into(),
            description: "List nodes carrying a supertag".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tag": {"type": "string"},
                    "limit": {"type": "integer"},
                    "workspace": workspace_prop(),
                },
                "required": ["tag"],
            }),
        },
        ToolDefinition {
            name: "stats".into(),
            description: "Store statistics for a workspace".into(),
            input_schema: json!({
                "type": "object",
                "properties": {"workspace": workspace_prop()},
            }),
        },
        ToolDefinition {
            name: "supertags".into(),
            description: "List or search the supertag catalog".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "search": {"type": "string"},
                    "workspace": workspace_prop(),
                },
            }),
        },
        ToolDefinition {
            name: "node".into(),
            description: "Expand one node by id with fields and children".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "id": {"type": "string"},
                    "depth": {"type": "integer", "maximum": 5},
                    "workspace": workspace_prop(),
                },
                "required": ["id"],
            }),
        },
        ToolDefinition {
            name: "create".into(),
            description: "Build (and optionally post) a write payload for a new tagged node".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "tag": {"type": "string", "description": "supertag name, or comma-separated names"},
                    "name": {"type": "string"},
                    "fields": {"type": "object"},
                    "dry_run": {"type": "boolean"},
                    "workspace": workspace_prop(),
                },
                "required": ["tag", "name"],
            }),
        },
        ToolDefinition {
            name: "sync".into(),
            description: "Index the newest snapshot or report sync status".into(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "action": {"type": "string", "enum": ["index", "status"]},
                    "workspace": workspace_prop(),
                },
            }),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::ConfigDocument;

    fn server() -> McpServer {
        McpServer::new(Arc::new(DatabaseRegistry::new(ConfigDocument::default())))
    }

    #[tokio::test]
    async fn initialize_and_list_tools() {
        let server = server();
        let response = server
            .handle(RequestId::Number(1), "initialize", json!({}))
            .await;
        assert!(response.error.is_none());

        let response = server
            .handle(RequestId::Number(2), "tools/list", json!({}))
            .await;
        let tools = response.result.unwrap();
        let names: Vec<&str> = tools["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        assert_eq!(
            names,
            vec!["search", "tagged", "stats", "supertags", "node", "create", "sync"]
        );
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let server = server();
        let response = server
            .handle(RequestId::Number(3), "bogus/method", json!({}))
            .await;
        assert_eq!(response.error.unwrap().code, METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let server = server();
        let line = r#"{"jsonrpc": "2.0", "method": "notifications/initialized"}"#;
        assert!(server.handle_line(line).await.is_none());
    }

    #[tokio::test]
    async fn tool_errors_carry_kind_in_data() {
        let server = server();
        let response = server
            .handle(
                RequestId::Number(4),
                "tools/call",
                json!({"name": "tagged", "arguments": {}}),
            )
            .await;
        let error = response.error.unwrap();
        assert_eq!(error.code, SERVER_ERROR);
        assert_eq!(error.data.unwrap()["kind"], "MissingRequired");
    }
}
