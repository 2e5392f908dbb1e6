// Error Model
// Closed set of user-visible error kinds. Every kind carries a category,
// a human message, an optional suggestion, an optional doc reference and
// a retryability flag. Internals bubble anyhow::Error; surfaces downcast
// to SupertagError to decide exit codes and HTTP statuses.

use thiserror::Error;

/// Coarse grouping used for log fields and the CLI one-line cause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Workspace,
    Input,
    NotFound,
    Database,
    Sync,
    Api,
    Auth,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Config => "config",
            ErrorCategory::Workspace => "workspace",
            ErrorCategory::Input => "input",
            ErrorCategory::NotFound => "not-found",
            ErrorCategory::Database => "database",
            ErrorCategory::Sync => "sync",
            ErrorCategory::Api => "api",
            ErrorCategory::Auth => "auth",
            ErrorCategory::Internal => "internal",
        }
    }
}

/// The closed set of failure kinds surfaced to users.
#[derive(Debug, Clone, Error)]
pub enum SupertagError {
    #[error("configuration file not found: {0}")]
    ConfigNotFound(String),

    #[error("configuration invalid: {0}")]
    ConfigInvalid(String),

    #[error("workspace not found: {0}")]
    WorkspaceNotFound(String),

    #[error("API key missing: {0}")]
    ApiKeyMissing(String),

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("missing required argument: {0}")]
    MissingRequired(String),

    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("node not found: {0}")]
    NodeNotFound(String),

    #[error("supertag not found: {0}")]
    TagNotFound(String),

    #[error("database not found at {0}")]
    DatabaseNotFound(String),

    #[error("database corrupt: {0}")]
    DatabaseCorrupt(String),

    #[error("database is locked by another writer")]
    DatabaseLocked,

    #[error("store is out of date: {0}")]
    SyncRequired(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("rate limited by remote service: {0}")]
    RateLimited(String),

    #[error("operation timed out: {0}")]
    Timeout(String),

    #[error("network error: {0}")]
    NetworkError(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("authentication expired: {0}")]
    AuthExpired(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("local API unavailable: {0}")]
    LocalApiUnavailable(String),

    #[error("mutations not supported: {0}")]
    MutationsNotSupported(String),

    #[error("validation failed: {0:?}")]
    ValidationErrors(Vec<String>),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("corrupt snapshot: {0}")]
    CorruptSnapshot(String),

    #[error("supertag inheritance cycle: {child} -> {parent}")]
    CycleDetected { child: String, parent: String },

    #[error("unknown field: {0}")]
    FieldUnknown(String),

    #[error("unknown error: {0}")]
    UnknownError(String),
}

impl SupertagError {
    /// Stable kind name used on the wire (HTTP error body, RPC `data`).
    pub fn kind_name(&self) -> &'static str {
        match self {
            SupertagError::ConfigNotFound(_) => "ConfigNotFound",
            SupertagError::ConfigInvalid(_) => "ConfigInvalid",
            SupertagError::WorkspaceNotFound(_) => "WorkspaceNotFound",
            SupertagError::ApiKeyMissing(_) => "ApiKeyMissing",
            SupertagError::InvalidParameter(_) => "InvalidParameter",
            SupertagError::MissingRequired(_) => "MissingRequired",
            SupertagError::InvalidFormat(_) => "InvalidFormat",
            SupertagError::NodeNotFound(_) => "NodeNotFound",
            SupertagError::TagNotFound(_) => "TagNotFound",
            SupertagError::DatabaseNotFound(_) => "DatabaseNotFound",
            SupertagError::DatabaseCorrupt(_) => "DatabaseCorrupt",
            SupertagError::DatabaseLocked => "DatabaseLocked",
            SupertagError::SyncRequired(_) => "SyncRequired",
            SupertagError::ApiError(_) => "ApiError",
            SupertagError::RateLimited(_) => "RateLimited",
            SupertagError::Timeout(_) => "Timeout",
            SupertagError::NetworkError(_) => "NetworkError",
            SupertagError::AuthFailed(_) => "AuthFailed",
            SupertagError::AuthExpired(_) => "AuthExpired",
            SupertagError::PermissionDenied(_) => "PermissionDenied",
            SupertagError::LocalApiUnavailable(_) => "LocalApiUnavailable",
            SupertagError::MutationsNotSupported(_) => "MutationsNotSupported",
            SupertagError::ValidationErrors(_) => "ValidationErrors",
            SupertagError::InternalError(_) => "InternalError",
            SupertagError::CorruptSnapshot(_) => "CorruptSnapshot",
            SupertagError::CycleDetected { .. } => "CycleDetected",
            SupertagError::FieldUnknown(_) => "FieldUnknown",
            SupertagError::UnknownError(_) => "UnknownError",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            SupertagError::ConfigNotFound(_) | SupertagError::ConfigInvalid(_) => {
                ErrorCategory::Config
            }
            SupertagError::WorkspaceNotFound(_) => ErrorCategory::Workspace,
            SupertagError::ApiKeyMissing(_)
            | SupertagError::AuthFailed(_)
            | SupertagError::AuthExpired(_)
            | SupertagError::PermissionDenied(_) => ErrorCategory::Auth,
            SupertagError::InvalidParameter(_)
            | SupertagError::MissingRequired(_)
            | SupertagError::InvalidFormat(_)
            | SupertagError::ValidationErrors(_)
            | SupertagError::FieldUnknown(_) => ErrorCategory::Input,
            SupertagError::NodeNotFound(_)
            | SupertagError::TagNotFound(_)
            | SupertagError::DatabaseNotFound(_) => ErrorCategory::NotFound,
            SupertagError::DatabaseCorrupt(_)
            | SupertagError::DatabaseLocked
            | SupertagError::CycleDetected { .. } => ErrorCategory::Database,
            SupertagError::SyncRequired(_) | SupertagError::CorruptSnapshot(_) => {
                ErrorCategory::Sync
            }
            SupertagError::ApiError(_)
            | SupertagError::RateLimited(_)
            | SupertagError::Timeout(_)
            | SupertagError::NetworkError(_)
            | SupertagError::LocalApiUnavailable(_)
            | SupertagError::MutationsNotSupported(_) => ErrorCategory::Api,
            SupertagError::InternalError(_) | SupertagError::UnknownError(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Whether a caller may retry the same operation unchanged.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            SupertagError::DatabaseLocked
                | SupertagError::RateLimited(_)
                | SupertagError::Timeout(_)
                | SupertagError::NetworkError(_)
                | SupertagError::LocalApiUnavailable(_)
                | SupertagError::TagNotFound(_)
        )
    }

    /// One-line remediation hint for the CLI, when we have one.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            SupertagError::ConfigNotFound(_) => {
                Some("run `supertag workspace add` to create a configuration")
            }
            SupertagError::WorkspaceNotFound(_) => {
                Some("run `supertag workspace list` to see configured aliases")
            }
            SupertagError::ApiKeyMissing(_) => {
                Some("set SUPERTAG_TOKEN or add a token to the workspace entry")
            }
            SupertagError::DatabaseNotFound(_) | SupertagError::SyncRequired(_) => {
                Some("run `supertag sync index` first")
            }
            SupertagError::DatabaseLocked => {
                Some("another index run is in progress; retry in a moment")
            }
            SupertagError::TagNotFound(_) => {
                Some("run `supertag tags list` to see known supertags")
            }
            SupertagError::RateLimited(_) => Some("wait and retry; the limit is per second"),
            SupertagError::CorruptSnapshot(_) => {
                Some("re-export the workspace and index the fresh snapshot")
            }
            SupertagError::LocalApiUnavailable(_) => {
                Some("delta sync needs the local API; falling back to full index works")
            }
            _ => None,
        }
    }

    /// Pointer into the user docs, for kinds that have a dedicated page.
    pub fn doc_ref(&self) -> Option<&'static str> {
        match self.category() {
            ErrorCategory::Config | ErrorCategory::Workspace => Some("docs/workspaces.md"),
            ErrorCategory::Sync => Some("docs/sync.md"),
            ErrorCategory::Auth => Some("docs/auth.md"),
            _ => None,
        }
    }

    /// HTTP status for the webhook surface.
    pub fn http_status(&self) -> u16 {
        match self {
            SupertagError::NodeNotFound(_)
            | SupertagError::TagNotFound(_)
            | SupertagError::WorkspaceNotFound(_)
            | SupertagError::DatabaseNotFound(_)
            | SupertagError::ConfigNotFound(_) => 404,
            SupertagError::DatabaseLocked => 409,
            SupertagError::RateLimited(_) => 429,
            SupertagError::NetworkError(_)
            | SupertagError::Timeout(_)
            | SupertagError::LocalApiUnavailable(_) => 503,
            SupertagError::AuthFailed(_)
            | SupertagError::AuthExpired(_)
            | SupertagError::PermissionDenied(_) => 403,
            SupertagError::InternalError(_) | SupertagError::UnknownError(_) => 500,
            _ => 400,
        }
    }

    /// CLI exit code. Usage mistakes are 2, everything else user-visible
    /// is 1; success paths never construct an error.
    pub fn exit_code(&self) -> i32 {
        match self {
            SupertagError::InvalidParameter(_) | SupertagError::MissingRequired(_) => 2,
            _ => 1,
        }
    }
}

/// Map any error chain to the closed set, defaulting to UnknownError.
pub fn to_supertag_error(err: &anyhow::Error) -> SupertagError {
    if let Some(known) = err.downcast_ref::<SupertagError>() {
        return known.clone();
    }
    SupertagError::UnknownError(format!("{err:#}"))
}
