//! Durable staging for deferred mutations.
//!
//! In deferred mode, ingress batches are persisted here and applied later
//! by the resolver loop. Staging is append-only and idempotent on the
//! natural key `(mutation key, HLC)`: the upstream redelivers on failure,
//! and duplicate inserts must be no-ops.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use silt_core::{Hlc, Mutation, Result, Schema, Table};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Staged-mutation store for one target table.
#[async_trait]
pub trait Stager: Send + Sync {
    /// Persist a batch. Atomic per call; duplicate `(key, time)` rows are
    /// no-ops. Returns the number of newly staged mutations.
    async fn store(&self, muts: &[Mutation]) -> Result<u64>;

    /// Mutations with `low < time <= high`, ordered by HLC, ties broken by
    /// key bytes.
    async fn drain(&self, low_exclusive: Hlc, high_inclusive: Hlc) -> Result<Vec<Mutation>>;

    /// Delete rows with `time <= before`. Safe once the consistent point
    /// has passed them. Returns the number of rows removed.
    async fn retire(&self, before_inclusive: Hlc) -> Result<u64>;
}

/// In-memory stager keyed `(time, key-bytes)`.
pub struct MemoryStager {
    rows: Mutex<BTreeMap<(Hlc, String), Mutation>>,
}

impl MemoryStager {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

impl Default for MemoryStager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Stager for MemoryStager {
    async fn store(&self, muts: &[Mutation]) -> Result<u64> {
        let mut rows = self.rows.lock();
        let mut staged = 0;
        for mutation in muts {
            let slot = (mutation.time, mutation.key_text());
            if let std::collections::btree_map::Entry::Vacant(entry) = rows.entry(slot) {
                entry.insert(mutation.clone());
                staged += 1;
            }
        }
        Ok(staged)
    }

    async fn drain(&self, low_exclusive: Hlc, high_inclusive: Hlc) -> Result<Vec<Mutation>> {
        let rows = self.rows.lock();
        Ok(rows
            .iter()
            .filter(|((time, _), _)| *time > low_exclusive && *time <= high_inclusive)
            .map(|(_, mutation)| mutation.clone())
            .collect())
    }

    async fn retire(&self, before_inclusive: Hlc) -> Result<u64> {
        let mut rows = self.rows.lock();
        let keep = rows.split_off(&(before_inclusive, "\u{10FFFF}".to_string()));
        let removed = rows.len() as u64;
        *rows = keep;
        Ok(removed)
    }
}

/// Factory handing out one [`Stager`] per target table and remembering
/// which tables carry staged data for each schema.
pub struct Stagers {
    stagers: DashMap<Table, Arc<dyn Stager>>,
    backend: Backend,
}

enum Backend {
    Memory,
    #[cfg(feature = "postgres")]
    Postgres(Arc<dyn crate::target::TargetConn>),
}

impl Stagers {
    /// A factory producing in-memory stagers.
    pub fn memory() -> Self {
        Self {
            stagers: DashMap::new(),
            backend: Backend::Memory,
        }
    }

    /// A factory producing stagers backed by the staging database.
    #[cfg(feature = "postgres")]
    pub fn postgres(conn: Arc<dyn crate::target::TargetConn>) -> Self {
        Self {
            stagers: DashMap::new(),
            backend: Backend::Postgres(conn),
        }
    }

    /// The stager for a target table, created on first use.
    pub fn get(&self, table: &Table) -> Arc<dyn Stager> {
        if let Some(entry) = self.stagers.get(table) {
            return Arc::clone(entry.value());
        }
        let stager: Arc<dyn Stager> = match &self.backend {
            Backend::Memory => Arc::new(MemoryStager::new()),
            #[cfg(feature = "postgres")]
            Backend::Postgres(conn) => Arc::new(pg::PgStager::new(Arc::clone(conn), table)),
        };
        trace!(table = %table, "created stager");
        self.stagers
            .entry(table.clone())
            .or_insert(stager)
            .value()
            .clone()
    }

    /// Tables with a stager in the given schema, in name order.
    pub fn tables_in(&self, schema: &Schema) -> Vec<Table> {
        let mut tables: Vec<Table> = self
            .stagers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|table| table.schema() == schema)
            .collect();
        tables.sort();
        tables
    }
}

#[cfg(feature = "postgres")]
mod pg {
    use super::Stager;
    use crate::target::TargetConn;
    use async_trait::async_trait;
    use serde_json::json;
    use silt_core::{Hlc, Mutation, Result, SiltError, Table};
    use std::sync::Arc;
    use tokio::sync::OnceCell;

    /// Stager backed by a staging table
    /// `_silt.stg_<schema>_<table> (key TEXT, time DECIMAL, mut JSONB,
    /// PRIMARY KEY (key, time))`.
    pub struct PgStager {
        conn: Arc<dyn TargetConn>,
        staging_table: String,
        ready: OnceCell<()>,
    }

    impl PgStager {
        pub fn new(conn: Arc<dyn TargetConn>, target: &Table) -> Self {
            let staging_table = format!(
                "\"_silt\".\"stg_{}_{}\"",
                target.schema().raw().replace('"', ""),
                target.name().raw().replace('"', "")
            );
            Self {
                conn,
                staging_table,
                ready: OnceCell::new(),
            }
        }

        async fn ensure_table(&self) -> Result<()> {
            self.ready
                .get_or_try_init(|| async {
                    let ddl = format!(
                        "CREATE TABLE IF NOT EXISTS {} (
                            key TEXT NOT NULL,
                            time DECIMAL NOT NULL,
                            mut JSONB NOT NULL,
                            PRIMARY KEY (key, time)
                        )",
                        self.staging_table
                    );
                    self.conn.execute(&ddl, &[]).await.map(|_| ())
                })
                .await
                .copied()
        }
    }

    #[async_trait]
    impl Stager for PgStager {
        async fn store(&self, muts: &[Mutation]) -> Result<u64> {
            if muts.is_empty() {
                return Ok(0);
            }
            self.ensure_table().await?;

            // One multi-row insert per batch; duplicates fall out via the
            // primary key.
            let mut placeholders = Vec::with_capacity(muts.len());
            let mut params = Vec::with_capacity(muts.len() * 3);
            for (idx, mutation) in muts.iter().enumerate() {
                let base = idx * 3;
                placeholders.push(format!(
                    "(${}, ${}::DECIMAL, ${})",
                    base + 1,
                    base + 2,
                    base + 3
                ));
                params.push(json!(mutation.key_text()));
                params.push(json!(mutation.time.to_decimal()));
                params.push(serde_json::to_value(mutation)?);
            }
            let sql = format!(
                "INSERT INTO {} (key, time, mut) VALUES {} ON CONFLICT (key, time) DO NOTHING",
                self.staging_table,
                placeholders.join(", ")
            );
            let staged = self.conn.execute(&sql, &params).await?;
            metrics::counter!("silt_mutations_staged_total").increment(staged);
            Ok(staged)
        }

        async fn drain(&self, low_exclusive: Hlc, high_inclusive: Hlc) -> Result<Vec<Mutation>> {
            self.ensure_table().await?;
            let rows = self
                .conn
                .query(
                    &format!(
                        "SELECT mut FROM {}
                         WHERE time > $1::DECIMAL AND time <= $2::DECIMAL
                         ORDER BY time, key",
                        self.staging_table
                    ),
                    &[
                        json!(low_exclusive.to_decimal()),
                        json!(high_inclusive.to_decimal()),
                    ],
                )
                .await?;

            rows.into_iter()
                .map(|row| {
                    let raw = row
                        .get("mut")
                        .cloned()
                        .ok_or_else(|| SiltError::fatal("staging row missing mut column"))?;
                    Ok(serde_json::from_value(raw)?)
                })
                .collect()
        }

        async fn retire(&self, before_inclusive: Hlc) -> Result<u64> {
            self.ensure_table().await?;
            Ok(self
                .conn
                .execute(
                    &format!("DELETE FROM {} WHERE time <= $1::DECIMAL", self.staging_table),
                    &[json!(before_inclusive.to_decimal())],
                )
                .await?)
        }
    }
}
