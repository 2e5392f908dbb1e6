// MCP (AI-tool RPC) surface
// stdio JSON-RPC server exposing thin tools over the query engine,
// schema service and indexer.

pub mod server;
pub mod types;

pub use server::McpServer;
pub use types::{McpError, McpRequest, McpResponse, RequestId, ToolDefinition};
