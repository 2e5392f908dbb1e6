// Centralized Observability Infrastructure
// Structured logging, process-wide operation counters and trace helpers.
// Initialized once at surface startup; components only use the `tracing`
// macros and the counters below.

use anyhow::Result;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for coarse metrics
static OPERATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);
static QUERY_COUNTER: AtomicU64 = AtomicU64::new(0);
static INDEX_COUNTER: AtomicU64 = AtomicU64::new(0);
static EMBED_BATCH_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure.
/// This should be called once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
///
/// Quiet always wins over RUST_LOG so `--quiet` reliably silences the
/// process; otherwise RUST_LOG overrides the flag-derived default.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("supertag=debug,info")
    } else {
        EnvFilter::new("supertag=warn,error")
    };

    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                debug!("supertag observability initialized");
            }
            Ok(())
        }
        // Already initialized, which is fine in test environments
        Err(_) => Ok(()),
    }
}

/// Counter groups exposed through `stats` surfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub operations: u64,
    pub errors: u64,
    pub queries: u64,
    pub index_runs: u64,
    pub embed_batches: u64,
}

pub fn counters() -> CounterSnapshot {
    CounterSnapshot {
        operations: OPERATION_COUNTER.load(Ordering::Relaxed),
        errors: ERROR_COUNTER.load(Ordering::Relaxed),
        queries: QUERY_COUNTER.load(Ordering::Relaxed),
        index_runs: INDEX_COUNTER.load(Ordering::Relaxed),
        embed_batches: EMBED_BATCH_COUNTER.load(Ordering::Relaxed),
    }
}

pub fn record_query() {
    QUERY_COUNTER.fetch_add(1, Ordering::Relaxed);
    OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub fn record_index_run() {
    INDEX_COUNTER.fetch_add(1, Ordering::Relaxed);
    OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub fn record_embed_batch() {
    EMBED_BATCH_COUNTER.fetch_add(1, Ordering::Relaxed);
    OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
}

pub fn record_error() {
    ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
}

/// Run a future inside a span carrying a fresh trace id and log the
/// outcome with its duration. Errors also bump the error counter.
pub async fn with_trace_id<F, T>(operation: &str, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    let trace_id = Uuid::new_v4();
    let start = Instant::now();
    let span = tracing::info_span!("op", %trace_id, operation);
    let _guard = span.enter();

    OPERATION_COUNTER.fetch_add(1, Ordering::Relaxed);
    debug!(operation, %trace_id, "operation started");

    match fut.await {
        Ok(value) => {
            info!(
                operation,
                %trace_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "operation completed"
            );
            Ok(value)
        }
        Err(e) => {
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
            error!(
                operation,
                %trace_id,
                elapsed_ms = start.elapsed().as_millis() as u64,
                error = %e,
                "operation failed"
            );
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_trace_id_passes_value_and_counts() {
        init_logging().unwrap();
        let before = counters();
        let out = with_trace_id("test-op", async { Ok::<_, anyhow::Error>(7) })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert!(counters().operations > before.operations);
    }

    #[tokio::test]
    async fn with_trace_id_counts_errors() {
        init_logging().unwrap();
        let before = counters();
        let res: Result<()> =
            with_trace_id("failing-op", async { Err(anyhow::anyhow!("boom")) }).await;
        assert!(res.is_err());
        assert!(counters().errors > before.errors);
    }
}
