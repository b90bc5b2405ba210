//! Dead-letter queues.
//!
//! Rows that cannot be applied - unresolvable conflicts, script failures,
//! data-value errors - are persisted for out-of-band inspection instead of
//! wedging the pipeline.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use silt_core::{Hlc, Result, SiltError, Table};
use std::sync::Arc;
use tracing::warn;

/// One dead-lettered row.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    /// The queue the row was routed to.
    pub queue: String,
    /// The target table the row was destined for.
    pub table: Table,
    /// Source commit timestamp.
    pub time: Hlc,
    /// Primary-key components.
    pub key: Value,
    /// Previous row state, if known.
    pub before: Option<Value>,
    /// The row that could not be applied.
    pub proposed: Option<Value>,
    /// Why the row landed here.
    pub error: String,
}

/// A named dead-letter queue.
#[async_trait]
pub trait Dlq: Send + Sync + std::fmt::Debug {
    async fn enqueue(&self, letter: DeadLetter) -> Result<()>;
}

/// Registry of configured dead-letter queues. Routing to an unknown name is
/// a configuration error: the queue table must exist before traffic flows.
#[derive(Default)]
pub struct DlqSet {
    queues: DashMap<String, Arc<dyn Dlq>>,
}

impl DlqSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, dlq: Arc<dyn Dlq>) {
        self.queues.insert(name.into(), dlq);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Dlq>> {
        self.queues
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| SiltError::config(format!("no dead-letter queue named {name:?}")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }
}

/// In-memory queue for tests and dry runs.
#[derive(Default, Debug)]
pub struct MemoryDlq {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDlq {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<DeadLetter> {
        std::mem::take(&mut self.letters.lock())
    }

    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }
}

#[async_trait]
impl Dlq for MemoryDlq {
    async fn enqueue(&self, letter: DeadLetter) -> Result<()> {
        warn!(
            queue = %letter.queue,
            table = %letter.table,
            time = %letter.time,
            error = %letter.error,
            "dead-lettered mutation"
        );
        metrics::counter!("silt_mutations_dlqed_total", "queue" => letter.queue.clone())
            .increment(1);
        self.letters.lock().push(letter);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgDlq;

#[cfg(feature = "postgres")]
mod pg {
    use super::{DeadLetter, Dlq};
    use crate::target::TargetConn;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use silt_core::Result;
    use std::sync::Arc;
    use tokio::sync::OnceCell;

    /// Dead-letter queue backed by a table in the staging database:
    /// `_silt.dlq_<name> (time DECIMAL, tbl STRING, key JSONB,
    /// before JSONB, proposed JSONB, error STRING)`.
    pub struct PgDlq {
        conn: Arc<dyn TargetConn>,
        table: String,
        ready: OnceCell<()>,
    }

    impl std::fmt::Debug for PgDlq {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("PgDlq").field("table", &self.table).finish()
        }
    }

    impl PgDlq {
        pub fn new(conn: Arc<dyn TargetConn>, name: &str) -> Self {
            Self {
                conn,
                table: format!("\"_silt\".\"dlq_{}\"", name.replace('"', "")),
                ready: OnceCell::new(),
            }
        }

        async fn ensure_table(&self) -> Result<()> {
            self.ready
                .get_or_try_init(|| async {
                    let ddl = format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            time DECIMAL NOT NULL,
                            tbl TEXT NOT NULL,
                            key JSONB NOT NULL,
                            before JSONB,
                            proposed JSONB,
                            error TEXT NOT NULL
                        )",
                        self.table
                    );
                    self.conn.execute(&ddl, &[]).await.map(|_| ())
                })
                .await
                .copied()
        }
    }

    #[async_trait]
    impl Dlq for PgDlq {
        async fn enqueue(&self, letter: DeadLetter) -> Result<()> {
            self.ensure_table().await?;
            let sql = format!(
                "INSERT INTO {} (time, tbl, key, before, proposed, error)
                 VALUES ($1, $2, $3, $4, $5, $6)",
                self.table
            );
            let params: Vec<Value> = vec![
                json!(letter.time.to_decimal()),
                json!(letter.table.to_string()),
                letter.key,
                letter.before.unwrap_or(Value::Null),
                letter.proposed.unwrap_or(Value::Null),
                json!(letter.error),
            ];
            metrics::counter!("silt_mutations_dlqed_total", "queue" => letter.queue.clone())
                .increment(1);
            self.conn.execute(&sql, &params).await?;
            Ok(())
        }
    }
}
