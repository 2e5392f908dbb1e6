// Supertag CLI - index, query and maintain note-graph workspaces
use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;

use supertag::aggregation::{aggregate, AggregateSpec, DateField, GroupBy, Period};
use supertag::batch::{run_batch, WorkspaceSelection};
use supertag::content_filter::ContentFilter;
use supertag::contracts::{CancellationToken, SystemClock, WriteSink};
use supertag::database::{Database, DatabaseRegistry};
use supertag::embedding_service::{
    embed_stats, generate as generate_embeddings, maintain, semantic_search, GenerateOptions,
};
use supertag::embeddings::RemoteEmbeddingProvider;
use supertag::errors::to_supertag_error;
use supertag::indexer::{index_snapshot, IndexOptions, IndexReport};
use supertag::observability::init_logging_with_level;
use supertag::payload::{build_payload, parse_tag_list};
use supertag::query_engine::{QueryEngine, QueryOptions, ResolutionMode};
use supertag::query_parser::parse as parse_query;
use supertag::schema::SchemaService;
use supertag::types::{NodeId, ValidatedLimit, WorkspaceAlias};
use supertag::watcher::{index_latest, start as start_watcher, WatchEvent, WatcherConfig};
use supertag::workspace::{
    add_workspace, config_path, data_root, legacy_db_path, load_or_default, migrate_legacy,
    remove_workspace, resolve, save_config, set_default, set_enabled, ConfigDocument,
    WorkspaceEntry, WorkspaceSelector,
};
use supertag::write_sink::HttpWriteSink;

#[derive(Parser)]
#[command(
    name = "supertag",
    version,
    about = "Personal-knowledge indexing and query system for note-graph exports"
)]
struct Cli {
    /// Verbose logging
    #[arg(long, global = true)]
    verbose: bool,

    /// Errors only
    #[arg(long, short, global = true)]
    quiet: bool,

    /// Workspace alias (env: SUPERTAG_WORKSPACE)
    #[arg(long, short, global = true)]
    workspace: Option<String>,

    /// Explicit store path, bypassing configuration
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    fn selector(&self) -> WorkspaceSelector {
        match &self.db_path {
            Some(path) => WorkspaceSelector::Path(path.clone()),
            None => WorkspaceSelector::from_flag(self.workspace.clone()),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Snapshot ingestion and monitoring
    Sync {
        #[command(subcommand)]
        command: SyncCommand,
    },
    /// Full-text and semantic search
    Search(SearchArgs),
    /// Node inspection
    Nodes {
        #[command(subcommand)]
        command: NodesCommand,
    },
    /// Supertag inspection
    Tags {
        #[command(subcommand)]
        command: TagsCommand,
    },
    /// Field inspection
    Fields {
        #[command(subcommand)]
        command: FieldsCommand,
    },
    /// Run a query-language expression
    Query {
        expr: String,
        #[arg(long)]
        json: bool,
    },
    /// Group-by aggregation over a tag
    Aggregate(AggregateArgs),
    /// Store, embedding and filter statistics
    Stats {
        #[arg(long)]
        db: bool,
        #[arg(long)]
        embed: bool,
        #[arg(long)]
        filter: bool,
    },
    /// Workspace configuration
    Workspace {
        #[command(subcommand)]
        command: WorkspaceCommand,
    },
    /// Embedding generation and semantic search
    Embed {
        #[command(subcommand)]
        command: EmbedCommand,
    },
    /// Schema catalog operations
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
    /// Build (and post) a write payload for a new tagged node
    Create(CreateArgs),
    /// Show the resolved configuration and data paths
    Paths,
    /// One-way migration of the legacy single database
    Migrate,
    /// Run the local HTTP webhook server
    Serve {
        #[arg(long, default_value_t = supertag::http_server::DEFAULT_PORT)]
        port: u16,
    },
}

#[derive(Subcommand)]
enum SyncCommand {
    /// Index the newest snapshot (or all workspaces with --all)
    Index {
        #[arg(long)]
        all: bool,
        /// Incremental sync via the local API; falls back to a full
        /// re-index when the API is unavailable
        #[arg(long)]
        delta: bool,
        /// Index a specific snapshot file instead of the newest
        #[arg(long)]
        file: Option<PathBuf>,
    },
    /// Watch the export directory and re-index on new snapshots
    Monitor {
        #[arg(long)]
        watch: bool,
        #[arg(long, default_value_t = supertag::watcher::DEFAULT_DEBOUNCE_MS)]
        debounce_ms: u64,
    },
    /// Report indexing status
    Status {
        #[arg(long)]
        all: bool,
    },
    /// Delete old snapshots from the export directory
    Cleanup {
        #[arg(long, default_value_t = 3)]
        keep: usize,
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Args)]
struct SearchArgs {
    q: String,
    /// Restrict to nodes carrying this supertag
    #[arg(long)]
    tag: Option<String>,
    /// Field filter, `F=V` (exact) or `F~V` (substring)
    #[arg(long)]
    field: Option<String>,
    /// Embedding KNN instead of full-text
    #[arg(long)]
    semantic: bool,
    /// Return raw matches without ancestor resolution
    #[arg(long)]
    raw: bool,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum NodesCommand {
    /// Expand one node by id
    Show {
        id: String,
        #[arg(long, default_value_t = 1)]
        depth: usize,
    },
    /// References of a node (both directions)
    Refs { id: String },
    /// Recently updated nodes
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[derive(Subcommand)]
enum TagsCommand {
    /// All supertags
    List,
    /// Largest supertags by node count
    Top {
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// One supertag with its resolved fields
    Show { name: String },
}

#[derive(Subcommand)]
enum FieldsCommand {
    /// Field definitions, optionally restricted to one tag
    List {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Distinct values of a field
    Values { field: String },
    /// Search field names
    Search { q: String },
}

#[derive(Args)]
struct AggregateArgs {
    #[arg(long)]
    tag: String,
    #[arg(long)]
    group_by: Option<String>,
    /// Time bucket instead of a field: day|week|month|quarter|year
    #[arg(long)]
    period: Option<String>,
    /// Bucket over `created` (default) or `updated`
    #[arg(long)]
    date_field: Option<String>,
    #[arg(long)]
    top: Option<usize>,
    #[arg(long)]
    show_percent: bool,
    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    List,
    Add {
        alias: String,
        root_id: String,
        export_dir: PathBuf,
    },
    Update {
        alias: String,
        #[arg(long)]
        export_dir: Option<PathBuf>,
        #[arg(long)]
        token: Option<String>,
        #[arg(long)]
        target: Option<String>,
    },
    Remove { alias: String },
    SetDefault { alias: String },
    Enable { alias: String },
    Disable { alias: String },
    Show { alias: String },
}

#[derive(Subcommand)]
enum EmbedCommand {
    /// Show the effective embedding configuration
    Config,
    /// Generate embeddings for changed nodes
    Generate {
        #[arg(long)]
        entities_only: bool,
        #[arg(long)]
        batch_size: Option<usize>,
    },
    /// KNN search
    Search {
        q: String,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    Stats,
    /// Drop vectors for deleted nodes
    Maintain,
}

#[derive(Subcommand)]
enum SchemaCommand {
    /// Regenerate the schema catalog document
    Sync,
    List,
    Show { name: String },
    Search { q: String },
}

#[derive(Args)]
struct CreateArgs {
    /// Supertag name, or comma-separated names
    tags: String,
    name: String,
    /// Field values as `name=value`; repeatable
    #[arg(long = "field", short = 'f')]
    fields: Vec<String>,
    /// Field values as one JSON object
    #[arg(long)]
    json: Option<String>,
    /// Plain child nodes; repeatable
    #[arg(long = "child", short = 'c')]
    children: Vec<String>,
    /// Print the payload without posting
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    if init_logging_with_level(cli.verbose, cli.quiet).is_err() {
        eprintln!("error: failed to initialize logging");
        return std::process::ExitCode::from(1);
    }

    match run(&cli).await {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            let kind = to_supertag_error(&e);
            eprintln!("error: {kind}");
            if let Some(suggestion) = kind.suggestion() {
                eprintln!("hint: {suggestion}");
            }
            std::process::ExitCode::from(kind.exit_code() as u8)
        }
    }
}

fn load_config() -> Result<ConfigDocument> {
    load_or_default(&config_path())
}

fn open_database(cli: &Cli, config: &ConfigDocument) -> Result<(WorkspaceEntry, Database)> {
    let entry = resolve(config, &cli.selector())?;
    let db = Database::open_existing(entry.database_paths())?;
    Ok((entry, db))
}

async fn run(cli: &Cli) -> Result<()> {
    let config = load_config()?;
    match &cli.command {
        Command::Sync { command } => run_sync(cli, &config, command).await,
        Command::Search(args) => run_search(cli, &config, args).await,
        Command::Nodes { command } => run_nodes(cli, &config, command),
        Command::Tags { command } => run_tags(cli, &config, command),
        Command::Fields { command } => run_fields(cli, &config, command),
        Command::Query { expr, json } => run_query(cli, &config, expr, *json),
        Command::Aggregate(args) => run_aggregate(cli, &config, args),
        Command::Stats { db, embed, filter } => run_stats(cli, &config, *db, *embed, *filter),
        Command::Workspace { command } => run_workspace(&config, command),
        Command::Embed { command } => run_embed(cli, &config, command).await,
        Command::Schema { command } => run_schema(cli, &config, command),
        Command::Create(args) => run_create(cli, &config, args).await,
        Command::Paths => run_paths(cli, &config),
        Command::Migrate => run_migrate(cli, &config),
        Command::Serve { port } => {
            let registry = Arc::new(DatabaseRegistry::new(config));
            let server_config = supertag::http_server::ServerConfig {
                port: *port,
                pid_file: Some(data_root().join("webhook.pid")),
            };
            supertag::http_server::start_server(registry, server_config).await
        }
    }
}

fn print_report(alias: &str, report: &IndexReport) {
    println!(
        "[{alias}] indexed {} in {}ms: +{} ~{} -{} ({} nodes, {} supertags, {} field values)",
        report.export_file,
        report.duration_ms,
        report.added,
        report.modified,
        report.deleted,
        report.nodes_total,
        report.supertags_total,
        report.fields_total,
    );
    if report.skipped_records > 0 {
        println!("[{alias}] skipped {} malformed records", report.skipped_records);
    }
}

async fn run_sync(cli: &Cli, config: &ConfigDocument, command: &SyncCommand) -> Result<()> {
    match command {
        SyncCommand::Index { all, delta, file } => {
            if *delta {
                tracing::warn!("local API delta sync unavailable; running a full re-index");
            }
            let options = IndexOptions {
                show_progress: !cli.quiet,
                ..IndexOptions::default()
            };
            if *all {
                let report = run_batch(
                    config,
                    &WorkspaceSelection::All,
                    &CancellationToken::new(),
                    |entry| {
                        let options = options.clone();
                        async move {
                            let db = Database::open(entry.database_paths())?;
                            index_latest(
                                &db,
                                &entry.export_dir,
                                &entry.schema_cache_path,
                                &options,
                            )
                            .await
                        }
                    },
                )
                .await?;
                for (alias, r) in &report.succeeded {
                    print_report(alias.as_str(), r);
                }
                for (alias, error) in &report.failed {
                    eprintln!("[{alias}] failed: {error}");
                }
                if !report.is_all_ok() {
                    anyhow::bail!("{} of {} workspaces failed", report.failed.len(), report.total());
                }
                return Ok(());
            }

            let entry = resolve(config, &cli.selector())?;
            let db = Database::open(entry.database_paths())?;
            let report = supertag::with_trace_id("sync-index", async {
                match file {
                    Some(path) => {
                        let r = index_snapshot(&db, path, &options).await?;
                        SchemaService::new(db.store.clone())
                            .write_catalog(&entry.schema_cache_path)?;
                        Ok(r)
                    }
                    None => {
                        index_latest(&db, &entry.export_dir, &entry.schema_cache_path, &options)
                            .await
                    }
                }
            })
            .await?;
            print_report(entry.alias.as_str(), &report);
            Ok(())
        }
        SyncCommand::Monitor { watch, debounce_ms } => {
            let entry = resolve(config, &cli.selector())?;
            let db = Arc::new(Database::open(entry.database_paths())?);
            if !*watch {
                let report = index_latest(
                    &db,
                    &entry.export_dir,
                    &entry.schema_cache_path,
                    &IndexOptions::default(),
                )
                .await?;
                print_report(entry.alias.as_str(), &report);
                return Ok(());
            }

            let mut watcher_config =
                WatcherConfig::new(entry.export_dir.clone(), entry.schema_cache_path.clone());
            watcher_config.debounce_ms = *debounce_ms;
            let (watcher, mut events) = start_watcher(db, watcher_config)?;
            println!("watching {} (ctrl-c to stop)", entry.export_dir.display());

            loop {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => break,
                    event = events.recv() => match event {
                        None => break,
                        Some(WatchEvent::Indexed(report)) => print_report(entry.alias.as_str(), &report),
                        Some(WatchEvent::Error(reason)) => eprintln!("watch error: {reason}"),
                    }
                }
            }
            watcher.stop().await;
            Ok(())
        }
        SyncCommand::Status { all } => {
            if *all {
                for entry in config.enabled_workspaces() {
                    match Database::open_existing(entry.database_paths()) {
                        Ok(db) => print_status(entry, &db),
                        Err(_) => println!("[{}] not indexed yet", entry.alias),
                    }
                }
                return Ok(());
            }
            let (entry, db) = open_database(cli, config)?;
            print_status(&entry, &db);
            Ok(())
        }
        SyncCommand::Cleanup { keep, dry_run } => {
            let entry = resolve(config, &cli.selector())?;
            let mut snapshots: Vec<PathBuf> = std::fs::read_dir(&entry.export_dir)?
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| {
                    p.file_name()
                        .map(|n| supertag::watcher::is_snapshot_file(&n.to_string_lossy()))
                        .unwrap_or(false)
                })
                .collect();
            snapshots.sort();
            let delete_count = snapshots.len().saturating_sub(*keep);
            for path in snapshots.into_iter().take(delete_count) {
                if *dry_run {
                    println!("would delete {}", path.display());
                } else {
                    std::fs::remove_file(&path)?;
                    println!("deleted {}", path.display());
                }
            }
            Ok(())
        }
    }
}

fn print_status(entry: &WorkspaceEntry, db: &Database) {
    let stats = db.stats();
    println!(
        "[{}] {} nodes, {} supertags, export {}, embeddings {}",
        entry.alias,
        stats.store.nodes,
        stats.store.supertags,
        stats.store.export_file.as_deref().unwrap_or("-"),
        stats.embeddings,
    );
}

async fn run_search(cli: &Cli, config: &ConfigDocument, args: &SearchArgs) -> Result<()> {
    let (_entry, db) = open_database(cli, config)?;
    let limit = args.limit.map(ValidatedLimit::clamped).unwrap_or_default();

    if args.semantic {
        let provider = Arc::new(RemoteEmbeddingProvider::new(config.effective_embedding())?);
        let hits = semantic_search(&db, provider, &args.q, limit, &Default::default()).await?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&hits)?);
        } else {
            for hit in hits {
                println!(
                    "{:.3}  {}",
                    hit.score,
                    hit.name.as_deref().unwrap_or(hit.id.as_str())
                );
            }
        }
        return Ok(());
    }

    let engine = QueryEngine::new(&db, Arc::new(SystemClock));
    let opts = QueryOptions::default();

    // Tag or field filters route through the query language.
    if args.tag.is_some() || args.field.is_some() {
        let target = args.tag.as_deref().unwrap_or("*");
        let mut expr = format!("find {target} where name ~ \"{}\"", args.q);
        if let Some(field) = &args.field {
            let (name, op, value) = split_field_filter(field)?;
            expr.push_str(&format!(" and \"{name}\" {op} \"{value}\""));
        }
        expr.push_str(&format!(" limit {}", limit.get()));
        let query = parse_query(&expr)
            .map_err(|e| supertag::SupertagError::InvalidFormat(e.to_string()))?;
        let result = engine.execute(&query, &opts)?;
        if args.json {
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else {
            for hit in &result.hits {
                println!(
                    "{}  {}",
                    hit.id,
                    hit.name.as_deref().unwrap_or("(unnamed)")
                );
            }
            eprintln!("{} of {} matches shown", result.hits.len(), result.total_matched);
        }
        return Ok(());
    }

    let mode = if args.raw {
        ResolutionMode::Raw
    } else {
        ResolutionMode::Tagged
    };
    let hits = engine.search_names(&args.q, mode, limit, &opts)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&hits)?);
    } else {
        for hit in hits {
            println!(
                "{:>3}x  {}  {}",
                hit.match_count,
                hit.id,
                hit.name.as_deref().unwrap_or("(unnamed)")
            );
        }
    }
    Ok(())
}

/// `F=V` or `F~V`.
fn split_field_filter(filter: &str) -> Result<(String, &'static str, String)> {
    for (symbol, op) in [("~", "~"), ("=", "=")] {
        if let Some((name, value)) = filter.split_once(symbol) {
            if !name.is_empty() {
                return Ok((name.trim().to_string(), op, value.trim().to_string()));
            }
        }
    }
    anyhow::bail!(supertag::SupertagError::InvalidParameter(format!(
        "field filter '{filter}' must be F=V or F~V"
    )))
}

fn run_nodes(cli: &Cli, config: &ConfigDocument, command: &NodesCommand) -> Result<()> {
    let (_, db) = open_database(cli, config)?;
    let tables = db.store.snapshot();
    match command {
        NodesCommand::Show { id, depth } => {
            let id = NodeId::new(id.clone())
                .map_err(|e| supertag::SupertagError::InvalidParameter(e.to_string()))?;
            let node = tables
                .node(&id)
                .ok_or_else(|| supertag::SupertagError::NodeNotFound(id.to_string()))?;
            let detail = supertag::http_server::node_detail(&tables, node, (*depth).min(5));
            println!("{}", serde_json::to_string_pretty(&detail)?);
        }
        NodesCommand::Refs { id } => {
            let id = NodeId::new(id.clone())
                .map_err(|e| supertag::SupertagError::InvalidParameter(e.to_string()))?;
            for r in tables.outbound_refs(&id) {
                println!(
                    "-> {} [{}] {}",
                    r.to_node,
                    r.reference_type,
                    tables
                        .node(&r.to_node)
                        .and_then(|n| n.name.as_deref())
                        .unwrap_or("")
                );
            }
            if let Some(sources) = tables.derived.inbound_refs.get(&id) {
                for s in sources {
                    println!(
                        "<- {} {}",
                        s,
                        tables.node(s).and_then(|n| n.name.as_deref()).unwrap_or("")
                    );
                }
            }
        }
        NodesCommand::Recent { limit } => {
            let engine = QueryEngine::new(&db, Arc::new(SystemClock));
            let expr = format!("find * order by -updated limit {}", (*limit).min(1000).max(1));
            let query = parse_query(&expr)
                .map_err(|e| supertag::SupertagError::InvalidFormat(e.to_string()))?;
            let result = engine.execute(&query, &QueryOptions::default())?;
            for hit in result.hits {
                println!(
                    "{}  {}",
                    hit.id,
                    hit.name.as_deref().unwrap_or("(unnamed)")
                );
            }
        }
    }
    Ok(())
}

fn run_tags(cli: &Cli, config: &ConfigDocument, command: &TagsCommand) -> Result<()> {
    let (_, db) = open_database(cli, config)?;
    let service = SchemaService::new(db.store.clone());
    let tables = db.store.snapshot();
    match command {
        TagsCommand::List => {
            for tag in service.list_supertags() {
                println!(
                    "#{}  {} nodes, {} fields",
                    tag.name,
                    tables.nodes_with_tag(&tag.id).len(),
                    tag.fields.len()
                );
            }
        }
        TagsCommand::Top { limit } => {
            let mut tags = service.list_supertags();
            tags.sort_by_key(|t| std::cmp::Reverse(tables.nodes_with_tag(&t.id).len()));
            for tag in tags.into_iter().take(*limit) {
                println!("{:>6}  #{}", tables.nodes_with_tag(&tag.id).len(), tag.name);
            }
        }
        TagsCommand::Show { name } => {
            let tag = service.get_supertag(name)?;
            println!("#{} ({})", tag.name, tag.id);
            if let Some(description) = &tag.description {
                println!("  {description}");
            }
            for field in service.all_fields(&tag.id) {
                let own = field.tag_id == tag.id;
                println!(
                    "  {}{}: {}",
                    field.field_name,
                    if own { "" } else { " (inherited)" },
                    field.inferred_data_type,
                );
            }
        }
    }
    Ok(())
}

fn run_fields(cli: &Cli, config: &ConfigDocument, command: &FieldsCommand) -> Result<()> {
    let (_, db) = open_database(cli, config)?;
    let service = SchemaService::new(db.store.clone());
    let tables = db.store.snapshot();
    match command {
        FieldsCommand::List { tag } => match tag {
            Some(name) => {
                let tag = service.get_supertag(name)?;
                for field in service.all_fields(&tag.id) {
                    println!("{}  ({})", field.field_name, field.inferred_data_type);
                }
            }
            None => {
                for (id, name) in &tables.field_names {
                    println!("{name}  [{id}]");
                }
            }
        },
        FieldsCommand::Values { field } => {
            let wanted = supertag::NormalizedName::of(field);
            let mut values: Vec<String> = tables
                .field_values
                .values()
                .flat_map(|m| m.values())
                .filter(|row| supertag::NormalizedName::of(&row.field_name) == wanted)
                .filter_map(|row| row.value_text.clone())
                .collect();
            values.sort();
            values.dedup();
            for value in values {
                println!("{value}");
            }
        }
        FieldsCommand::Search { q } => {
            let needle = q.to_lowercase();
            for (id, name) in &tables.field_names {
                if name.to_lowercase().contains(&needle) {
                    println!("{name}  [{id}]");
                }
            }
        }
    }
    Ok(())
}

fn run_query(cli: &Cli, config: &ConfigDocument, expr: &str, json: bool) -> Result<()> {
    let (_, db) = open_database(cli, config)?;
    let engine = QueryEngine::new(&db, Arc::new(SystemClock));
    let query =
        parse_query(expr).map_err(|e| supertag::SupertagError::InvalidFormat(e.to_string()))?;
    let result = engine.execute(&query, &QueryOptions::default())?;
    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        for hit in &result.hits {
            let mut line = format!(
                "{}  {}",
                hit.id,
                hit.name.as_deref().unwrap_or("(unnamed)")
            );
            if !hit.tags.is_empty() {
                line.push_str(&format!("  #{}", hit.tags.join(" #")));
            }
            for (field, values) in &hit.fields {
                line.push_str(&format!("  {field}={}", values.join(",")));
            }
            println!("{line}");
        }
        eprintln!("{} of {} matches shown", result.hits.len(), result.total_matched);
    }
    Ok(())
}

fn run_aggregate(cli: &Cli, config: &ConfigDocument, args: &AggregateArgs) -> Result<()> {
    let (_, db) = open_database(cli, config)?;
    let engine = QueryEngine::new(&db, Arc::new(SystemClock));

    let group_by = match (&args.group_by, &args.period) {
        (Some(field), None) => GroupBy::Field(field.clone()),
        (None, Some(period)) => {
            let period = Period::parse(period).ok_or_else(|| {
                supertag::SupertagError::InvalidParameter(format!("period '{period}'"))
            })?;
            let date_field = match args.date_field.as_deref() {
                None | Some("created") => DateField::Created,
                Some("updated") => DateField::Updated,
                Some(other) => {
                    anyhow::bail!(supertag::SupertagError::InvalidParameter(format!(
                        "date field '{other}'"
                    )))
                }
            };
            GroupBy::TimeBucket { period, date_field }
        }
        _ => anyhow::bail!(supertag::SupertagError::MissingRequired(
            "exactly one of --group-by or --period".into()
        )),
    };

    let spec = AggregateSpec {
        group_by,
        second_group: None,
        show_percent: args.show_percent,
        top: args.top,
    };
    let query = parse_query(&format!("find {}", args.tag))
        .map_err(|e| supertag::SupertagError::InvalidFormat(e.to_string()))?;
    let result = aggregate(&engine, &query, &spec, &QueryOptions::default())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }
    for warning in &result.warnings {
        eprintln!("warning: {warning}");
    }
    for group in &result.groups {
        match group.percent {
            Some(p) => println!("{:>6}  {:>5.1}%  {}", group.count, p, group.key),
            None => println!("{:>6}  {}", group.count, group.key),
        }
    }
    println!("total: {}", result.total);
    Ok(())
}

fn run_stats(cli: &Cli, config: &ConfigDocument, db_only: bool, embed: bool, filter: bool) -> Result<()> {
    let (entry, db) = open_database(cli, config)?;
    let all = !db_only && !embed && !filter;

    if db_only || all {
        let stats = db.stats();
        println!("workspace: {}", entry.alias);
        println!("store: {} bytes", stats.store_bytes);
        println!("nodes: {}", stats.store.nodes);
        println!("references: {}", stats.store.references);
        println!("tag applications: {}", stats.store.tag_applications);
        println!("field values: {}", stats.store.field_values);
        println!("supertags: {}", stats.store.supertags);
        println!("supertag fields: {}", stats.store.supertag_fields);
        println!("fts names: {}", stats.fts_nodes);
    }
    if embed || all {
        let stats = embed_stats(&db, &ContentFilter::default());
        println!("embeddings: {} records, {} stale", stats.records, stats.stale);
    }
    if filter || all {
        let stats = embed_stats(&db, &ContentFilter::default());
        println!("filter candidates: {}", stats.candidates);
    }
    Ok(())
}

fn run_workspace(config: &ConfigDocument, command: &WorkspaceCommand) -> Result<()> {
    let path = config_path();
    let mut config = config.clone();
    match command {
        WorkspaceCommand::List => {
            for w in &config.workspaces {
                println!(
                    "{}{}{}  export={}",
                    w.alias,
                    if w.default { " (default)" } else { "" },
                    if w.enabled { "" } else { " [disabled]" },
                    w.export_dir.display(),
                );
            }
            return Ok(());
        }
        WorkspaceCommand::Add {
            alias,
            root_id,
            export_dir,
        } => {
            let entry = WorkspaceEntry::with_defaults(
                WorkspaceAlias::new(alias.clone())?,
                root_id.clone(),
                export_dir.clone(),
            );
            add_workspace(&mut config, entry)?;
            println!("added workspace '{alias}'");
        }
        WorkspaceCommand::Update {
            alias,
            export_dir,
            token,
            target,
        } => {
            let entry = config
                .workspaces
                .iter_mut()
                .find(|w| w.alias.as_str() == alias)
                .ok_or_else(|| supertag::SupertagError::WorkspaceNotFound(alias.clone()))?;
            if let Some(dir) = export_dir {
                entry.export_dir = dir.clone();
            }
            if let Some(token) = token {
                entry.token = Some(token.clone());
            }
            if let Some(target) = target {
                entry.target = Some(target.clone());
            }
            println!("updated workspace '{alias}'");
        }
        WorkspaceCommand::Remove { alias } => {
            remove_workspace(&mut config, alias)?;
            println!("removed workspace '{alias}' (its data directory is preserved)");
        }
        WorkspaceCommand::SetDefault { alias } => {
            set_default(&mut config, alias)?;
            println!("default workspace is now '{alias}'");
        }
        WorkspaceCommand::Enable { alias } => {
            set_enabled(&mut config, alias, true)?;
            println!("enabled '{alias}'");
        }
        WorkspaceCommand::Disable { alias } => {
            set_enabled(&mut config, alias, false)?;
            println!("disabled '{alias}'");
        }
        WorkspaceCommand::Show { alias } => {
            let entry = config
                .workspace(alias)
                .ok_or_else(|| supertag::SupertagError::WorkspaceNotFound(alias.clone()))?;
            println!("{}", toml::to_string_pretty(entry)?);
            return Ok(());
        }
    }
    save_config(&path, &config)
}

async fn run_embed(cli: &Cli, config: &ConfigDocument, command: &EmbedCommand) -> Result<()> {
    match command {
        EmbedCommand::Config => {
            let embedding = config.effective_embedding();
            println!("endpoint: {}", embedding.endpoint);
            println!("model: {}", embedding.model);
            println!("batch size: {}", embedding.max_batch_size);
            println!(
                "api key: {}",
                if embedding.api_key.is_some() { "configured" } else { "none" }
            );
            Ok(())
        }
        EmbedCommand::Generate {
            entities_only,
            batch_size,
        } => {
            let (_, db) = open_database(cli, config)?;
            let provider = Arc::new(RemoteEmbeddingProvider::new(config.effective_embedding())?);
            let options = GenerateOptions {
                filter: ContentFilter {
                    entities_only: *entities_only,
                    ..ContentFilter::default()
                },
                batch_size: *batch_size,
                ..GenerateOptions::default()
            };
            let report = generate_embeddings(&db, provider, &options).await?;
            println!(
                "selected {}, embedded {}, unchanged {}, batches {}{}",
                report.selected,
                report.embedded,
                report.skipped_unchanged,
                report.batches,
                if report.cancelled { " (cancelled)" } else { "" },
            );
            Ok(())
        }
        EmbedCommand::Search { q, limit, json } => {
            let (_, db) = open_database(cli, config)?;
            let provider = Arc::new(RemoteEmbeddingProvider::new(config.effective_embedding())?);
            let limit = limit.map(ValidatedLimit::clamped).unwrap_or_default();
            let hits = semantic_search(&db, provider, q, limit, &Default::default()).await?;
            if *json {
                println!("{}", serde_json::to_string_pretty(&hits)?);
            } else {
                for hit in hits {
                    println!(
                        "{:.3}  {}",
                        hit.score,
                        hit.name.as_deref().unwrap_or(hit.id.as_str())
                    );
                }
            }
            Ok(())
        }
        EmbedCommand::Stats => {
            let (_, db) = open_database(cli, config)?;
            let stats = embed_stats(&db, &ContentFilter::default());
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
        EmbedCommand::Maintain => {
            let (_, db) = open_database(cli, config)?;
            let removed = maintain(&db)?;
            println!("removed {removed} orphaned vectors");
            Ok(())
        }
    }
}

fn run_schema(cli: &Cli, config: &ConfigDocument, command: &SchemaCommand) -> Result<()> {
    let (entry, db) = open_database(cli, config)?;
    let service = SchemaService::new(db.store.clone());
    match command {
        SchemaCommand::Sync => {
            service.write_catalog(&entry.schema_cache_path)?;
            println!("schema catalog written to {}", entry.schema_cache_path.display());
        }
        SchemaCommand::List => {
            let doc = service.to_catalog_document();
            for tag in &doc.supertags {
                println!("#{}  {} fields", tag.name, tag.fields.len());
            }
        }
        SchemaCommand::Show { name } => {
            let tag = service.get_supertag(name)?;
            println!("{}", serde_json::to_string_pretty(&tag)?);
        }
        SchemaCommand::Search { q } => {
            for tag in service.search_supertags(q) {
                println!("#{}", tag.name);
            }
        }
    }
    Ok(())
}

async fn run_create(cli: &Cli, config: &ConfigDocument, args: &CreateArgs) -> Result<()> {
    let (entry, db) = open_database(cli, config)?;
    let service = SchemaService::new(db.store.clone());

    let mut fields = serde_json::Map::new();
    if let Some(json_text) = &args.json {
        let parsed: serde_json::Value = serde_json::from_str(json_text)
            .map_err(|e| supertag::SupertagError::InvalidFormat(format!("--json: {e}")))?;
        match parsed {
            serde_json::Value::Object(map) => fields.extend(map),
            _ => anyhow::bail!(supertag::SupertagError::InvalidFormat(
                "--json must be an object".into()
            )),
        }
    }
    for field in &args.fields {
        let (name, value) = field.split_once('=').ok_or_else(|| {
            supertag::SupertagError::InvalidParameter(format!("--field '{field}' must be name=value"))
        })?;
        fields.insert(name.trim().to_string(), json!(value.trim()));
    }

    let tags = parse_tag_list(&args.tags);
    let mut payload = build_payload(&service, &tags, &args.name, &fields)?;

    // Plain child nodes append after the typed field children.
    if !args.children.is_empty() {
        let children = payload.children.get_or_insert_with(Vec::new);
        for child in &args.children {
            children.push(supertag::PayloadChild {
                name: Some(child.clone()),
                ..Default::default()
            });
        }
    }

    let payload_value = serde_json::to_value(&payload)?;
    let token = entry.effective_token();
    let target = entry.effective_target();

    if args.dry_run || token.is_none() || target.is_none() {
        if !args.dry_run {
            eprintln!("no token/target configured; printing payload instead of posting");
        }
        println!("{}", serde_json::to_string_pretty(&payload_value)?);
        return Ok(());
    }

    let target = target.expect("checked above");
    let sink = HttpWriteSink::new(target.clone(), token)?;
    sink.post(&target, &payload_value).await?;
    println!("created '{}'", args.name);
    Ok(())
}

fn run_paths(cli: &Cli, config: &ConfigDocument) -> Result<()> {
    println!("config: {}", config_path().display());
    println!("data root: {}", data_root().display());
    println!("legacy db: {}", legacy_db_path().display());
    if let Ok(entry) = resolve(config, &cli.selector()) {
        println!("workspace: {}", entry.alias);
        println!("store: {}", entry.db_path.display());
        println!("schema cache: {}", entry.schema_cache_path.display());
        println!("export dir: {}", entry.export_dir.display());
    }
    Ok(())
}

fn run_migrate(cli: &Cli, config: &ConfigDocument) -> Result<()> {
    let entry = resolve(config, &cli.selector())?;
    if migrate_legacy(&entry)? {
        println!(
            "migrated legacy database into '{}' (original preserved at {})",
            entry.alias,
            legacy_db_path().display()
        );
    } else {
        println!("nothing to migrate");
    }
    Ok(())
}
