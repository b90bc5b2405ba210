//! Loop status reporting and access checks.
//!
//! The admin surface is wired by the host; this module provides the data
//! it serves: a per-loop status snapshot and the authentication seam for
//! incoming changefeed requests.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use silt_core::{Hlc, Ident, Schema};
use tokio::sync::watch;

/// Point-in-time status of one resolver loop.
#[derive(Debug, Clone, Serialize)]
pub struct LoopStatus {
    pub source: Ident,
    pub schema: Schema,
    /// The durable consistent point.
    pub committed: Hlc,
    /// The highest resolved timestamp seen.
    pub proposed: Hlc,
    /// Milliseconds between the wall clock and the committed point.
    pub lag_ms: i64,
    /// The most recent round failure, if the loop is retrying.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl LoopStatus {
    pub fn new(source: Ident, schema: Schema) -> Self {
        Self {
            source,
            schema,
            committed: Hlc::ZERO,
            proposed: Hlc::ZERO,
            lag_ms: 0,
            error: None,
        }
    }

    /// Wall-clock lag of a consistent point, in milliseconds. Zero for the
    /// unset point.
    pub fn lag_ms(committed: Hlc) -> i64 {
        if committed.is_zero() {
            return 0;
        }
        let now_ns = chrono::Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(i64::MAX);
        (now_ns.saturating_sub(committed.nanos())) / 1_000_000
    }
}

/// Aggregates the status of every running loop for the admin handler.
#[derive(Default)]
pub struct StatusBoard {
    loops: DashMap<String, watch::Receiver<LoopStatus>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, source: &Ident, schema: &Schema, status: watch::Receiver<LoopStatus>) {
        let key = format!("{}:{}", source.folded(), schema.raw().to_lowercase());
        self.loops.insert(key, status);
    }

    /// A snapshot of every loop, in registration-key order.
    pub fn snapshot(&self) -> Vec<LoopStatus> {
        let mut statuses: Vec<LoopStatus> = self
            .loops
            .iter()
            .map(|entry| entry.value().borrow().clone())
            .collect();
        statuses.sort_by(|a, b| {
            (a.source.folded(), a.schema.raw()).cmp(&(b.source.folded(), b.schema.raw()))
        });
        statuses
    }

    /// True when every loop is error-free.
    pub fn healthy(&self) -> bool {
        self.loops
            .iter()
            .all(|entry| entry.value().borrow().error.is_none())
    }
}

/// Access checks for incoming changefeed requests. Authentication backends
/// are host concerns; the sink only asks yes or no.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// May a request bearing `token` write into `schema`?
    async fn check(&self, schema: &Schema, token: Option<&str>) -> silt_core::Result<bool>;
}

/// Accepts every request. The default for closed networks and tests.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrivialAuthenticator;

#[async_trait]
impl Authenticator for TrivialAuthenticator {
    async fn check(&self, _schema: &Schema, _token: Option<&str>) -> silt_core::Result<bool> {
        Ok(true)
    }
}
