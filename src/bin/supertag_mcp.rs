//! Supertag MCP Server - STDIO transport
//!
//! Line-oriented JSON-RPC over stdin/stdout; logging goes to stderr so
//! stdout stays clean for the protocol.

use anyhow::Result;
use clap::Parser;
use std::io::{BufRead, Write};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use supertag::database::DatabaseRegistry;
use supertag::mcp::McpServer;
use supertag::workspace::{config_path, load_or_default};

#[derive(Parser)]
#[command(name = "supertag-mcp", version, about = "Supertag MCP server (stdio)")]
struct Args {
    /// Configuration file (defaults to the standard location)
    #[arg(short, long)]
    config: Option<std::path::PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // stdout carries the protocol; logs go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("supertag=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config_file = args.config.unwrap_or_else(config_path);
    let config = load_or_default(&config_file)?;
    eprintln!(
        "supertag-mcp v{} ({} workspaces configured)",
        supertag::VERSION,
        config.workspaces.len()
    );

    let runtime = tokio::runtime::Runtime::new()?;
    let server = McpServer::new(Arc::new(DatabaseRegistry::new(config)));

    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Some(response) = runtime.block_on(server.handle_line(&line)) {
            serde_json::to_writer(&mut stdout, &response)?;
            stdout.write_all(b"\n")?;
            stdout.flush()?;
        }
    }
    Ok(())
}
