// Supertag - personal-knowledge indexing and query system
// Root library module

pub mod aggregation;
pub mod batch;
pub mod builders;
pub mod content_filter;
pub mod contracts;
pub mod database;
pub mod embedding_service;
pub mod embeddings;
pub mod errors;
pub mod fts;
pub mod http_server;
pub mod indexer;
pub mod observability;
pub mod payload;
pub mod query_engine;
pub mod query_parser;
pub mod schema;
pub mod snapshot;
pub mod store;
pub mod types;
pub mod vector_store;
pub mod watcher;
pub mod workspace;
pub mod write_sink;

// MCP (AI-tool RPC) surface
pub mod mcp;

// Re-export key types
pub use observability::{init_logging, init_logging_with_level, with_trace_id};

pub use contracts::{
    CancellationToken, Clock, FixedClock, RecordingWriteSink, SystemClock, WriteSink,
};

pub use errors::{to_supertag_error, ErrorCategory, SupertagError};

// Re-export validated types
pub use types::{
    DocType, FieldDataType, NodeId, NormalizedName, ValidatedLimit, WorkspaceAlias,
};

// Storage and indexes
pub use database::{Database, DatabasePaths, DatabaseStats};
pub use fts::FtsIndex;
pub use store::{
    FieldValueRow, NodeRow, ReferenceRow, Store, StoreStats, StoreTxn, SupertagFieldRow,
    SupertagRow, Tables, TagApplicationRow,
};
pub use vector_store::{DistanceMetric, EmbeddingRecord, VectorStore};

// Ingestion
pub use indexer::{index_snapshot, initialize_schema, IndexOptions, IndexReport};
pub use snapshot::{RawRecord, RecordItem, SnapshotReader};
pub use watcher::{index_latest, latest_snapshot, ExportWatcher, WatchEvent, WatcherConfig};

// Schema catalog
pub use schema::{
    catalog_from_tables, from_catalog_document, infer_data_type, CatalogDocument, SchemaService,
    Supertag, SupertagGraph,
};

// Query layer
pub use builders::{AggregateBuilder, QueryBuilder};
pub use query_engine::{
    resolve_matches, QueryEngine, QueryHit, QueryOptions, QueryResult, ResolutionMode,
    ResolvedMatch,
};
pub use query_parser::{parse as parse_query, ParseError, Query};

// Embedding subsystem
pub use content_filter::ContentFilter;
pub use embedding_service::{
    build_embed_text, embed_stats, generate as generate_embeddings, semantic_search, EmbedStats,
    GenerateOptions, GenerateReport, SemanticHit,
};
pub use embeddings::{
    EmbeddingConfig, EmbeddingProvider, HashEmbeddingProvider, RemoteEmbeddingProvider,
};

// Workspaces
pub use batch::{run_batch, BatchReport, WorkspaceSelection};
pub use workspace::{
    config_path, load_config, resolve as resolve_workspace, save_config, ConfigDocument,
    WorkspaceEntry, WorkspaceSelector,
};

pub use payload::{build_payload, parse_tag_list, NodePayload, PayloadChild};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
