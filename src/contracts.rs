// Contract-First Seams
// Traits for the external collaborators and cross-cutting concerns the
// core depends on: the wall clock (injected so relative-date queries are
// deterministic), cooperative cancellation, and the opaque write sink.
// Implementations live in their own modules; tests substitute fakes.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Injected time source.
///
/// # Postconditions
/// - `now_ms` is monotone non-decreasing for a fixed implementation
///   observing real time; `FixedClock` may return any constant.
/// - `today` is derived from the same instant as `now_ms`.
pub trait Clock: Send + Sync {
    /// Current instant as epoch milliseconds.
    fn now_ms(&self) -> i64;

    /// Current civil date in UTC.
    fn today(&self) -> NaiveDate {
        let ms = self.now_ms();
        Utc.timestamp_millis_opt(ms)
            .single()
            .map(|dt: DateTime<Utc>| dt.date_naive())
            .unwrap_or_else(|| NaiveDate::from_ymd_opt(1970, 1, 1).expect("epoch date"))
    }
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        Utc::now().timestamp_millis()
    }
}

/// Clock pinned to a fixed instant, for deterministic query tests.
#[derive(Debug, Clone, Copy)]
pub struct FixedClock(pub i64);

impl Clock for FixedClock {
    fn now_ms(&self) -> i64 {
        self.0
    }
}

/// Cooperative cancellation signal.
///
/// Long operations check this at natural boundaries (per record batch,
/// per embedding batch, per workspace); in-flight work completes before
/// the loop exits. Cloning shares the same flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Error out when cancelled, for `?`-style early exits.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            anyhow::bail!("operation cancelled");
        }
        Ok(())
    }
}

/// Per-request budget the write sink enforces.
pub const WRITE_SINK_MAX_NODES: usize = 100;
pub const WRITE_SINK_MAX_CHARS: usize = 5000;

/// Opaque mutation sink for the remote note-graph write API.
///
/// # Preconditions
/// - `payload` is a JSON document produced by the payload builder.
/// - Serialized payload is at most [`WRITE_SINK_MAX_CHARS`] characters
///   and contains at most [`WRITE_SINK_MAX_NODES`] nodes.
///
/// # Postconditions
/// - At most one call per second reaches the remote API; callers may be
///   delayed to honor this.
/// - The core never reads back from the sink; nothing in the store
///   depends on the sink's acknowledgment.
#[async_trait]
pub trait WriteSink: Send + Sync {
    async fn post(&self, target: &str, payload: &serde_json::Value) -> Result<()>;
}

/// Sink that records payloads in memory. Used by tests and `--dry-run`.
#[derive(Debug, Default)]
pub struct RecordingWriteSink {
    pub posts: parking_lot::Mutex<Vec<(String, serde_json::Value)>>,
}

#[async_trait]
impl WriteSink for RecordingWriteSink {
    async fn post(&self, target: &str, payload: &serde_json::Value) -> Result<()> {
        self.posts
            .lock()
            .push((target.to_string(), payload.clone()));
        Ok(())
    }
}
