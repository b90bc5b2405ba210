//! The resolved-timestamp advancement loop.
//!
//! One loop runs per (source, target-schema). Resolved markers from the
//! upstream are queued onto the loop, which drains every staged table in
//! `(committed, h]`, applies the mutations under a single target
//! transaction, and then advances the durable consistent-point memo to
//! exactly `h`. A failed round leaves the committed point untouched and
//! retries after backoff; the staging store is unchanged, and apply is
//! idempotent, so retries are safe.

use crate::apply::{partition_by_key, Appliers, ApplyStats};
use crate::config::SinkConfig;
use crate::health::LoopStatus;
use crate::memo::{memo_key, Memo};
use crate::retry::with_retries;
use crate::stage::Stagers;
use crate::target::TargetConn;
use silt_core::{Hlc, Ident, Mutation, Result, Schema, SiltError, Table};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Feeds resolved markers to a [`ResolverLoop`].
#[derive(Clone)]
pub struct ResolverHandle {
    marks: mpsc::UnboundedSender<Hlc>,
}

impl ResolverHandle {
    /// Enqueue a resolved timestamp.
    pub fn mark(&self, resolved: Hlc) -> Result<()> {
        self.marks
            .send(resolved)
            .map_err(|_| SiltError::transient("resolver loop is gone"))
    }
}

/// The per-(source, schema) resolver.
pub struct ResolverLoop {
    source: Ident,
    schema: Schema,
    config: SinkConfig,
    stagers: Arc<Stagers>,
    appliers: Arc<Appliers>,
    conn: Arc<dyn TargetConn>,
    memo: Arc<dyn Memo>,
    cancel: CancellationToken,
    marks: mpsc::UnboundedReceiver<Hlc>,
    committed: watch::Sender<Hlc>,
    proposed: watch::Sender<Hlc>,
    status: watch::Sender<LoopStatus>,
}

impl ResolverLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: Ident,
        schema: Schema,
        config: SinkConfig,
        stagers: Arc<Stagers>,
        appliers: Arc<Appliers>,
        conn: Arc<dyn TargetConn>,
        memo: Arc<dyn Memo>,
        cancel: CancellationToken,
    ) -> (Self, ResolverHandle) {
        let (marks_tx, marks_rx) = mpsc::unbounded_channel();
        let (committed, _) = watch::channel(Hlc::ZERO);
        let (proposed, _) = watch::channel(Hlc::ZERO);
        let (status, _) = watch::channel(LoopStatus::new(source.clone(), schema.clone()));
        (
            Self {
                source,
                schema,
                config,
                stagers,
                appliers,
                conn,
                memo,
                cancel,
                marks: marks_rx,
                committed,
                proposed,
                status,
            },
            ResolverHandle { marks: marks_tx },
        )
    }

    /// The last durably committed consistent point.
    pub fn committed(&self) -> watch::Receiver<Hlc> {
        self.committed.subscribe()
    }

    /// The highest resolved timestamp seen so far.
    pub fn proposed(&self) -> watch::Receiver<Hlc> {
        self.proposed.subscribe()
    }

    /// Loop status for the health surface.
    pub fn status(&self) -> watch::Receiver<LoopStatus> {
        self.status.subscribe()
    }

    /// Drive the loop until cancellation. Returns an error only when a
    /// round exhausts its retry budget or hits an invariant violation;
    /// the supervisor restarts the loop after backoff.
    pub async fn run(mut self) -> Result<()> {
        let key = memo_key(&self.source, &self.schema);
        let mut committed = self
            .memo
            .get(&key)
            .await?
            .unwrap_or(Hlc::ZERO);
        let mut proposed = committed;
        self.committed.send_replace(committed);
        self.publish_status(committed, proposed, None);
        info!(source = %self.source, schema = %self.schema, %committed, "resolver loop started");

        loop {
            let mark = tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!(source = %self.source, "resolver loop canceled");
                    return Ok(());
                }
                mark = self.marks.recv() => match mark {
                    Some(mark) => mark,
                    None => return Ok(()),
                },
            };

            // Coalesce queued markers; only the newest matters.
            let mut newest = mark;
            while let Ok(next) = self.marks.try_recv() {
                if next > newest {
                    newest = next;
                }
            }
            if newest <= proposed {
                continue;
            }
            proposed = newest;
            self.proposed.send_replace(proposed);
            self.publish_status(committed, proposed, None);

            match self.advance(committed, proposed, &key).await {
                Ok(()) => {
                    committed = proposed;
                    self.committed.send_replace(committed);
                    self.publish_status(committed, proposed, None);
                }
                Err(err) => {
                    if self.cancel.is_cancelled() {
                        return Ok(());
                    }
                    warn!(source = %self.source, schema = %self.schema, error = %err, "resolver round failed");
                    self.publish_status(committed, proposed, Some(err.to_string()));
                    return Err(err);
                }
            }
        }
    }

    /// One Pending -> Draining -> Applying -> Committed round, retried
    /// under the loop's budget.
    async fn advance(&self, low: Hlc, high: Hlc, key: &str) -> Result<()> {
        let deadline = self.config.drain_timeout() + self.config.apply_timeout();
        let stats = with_retries("resolver_round", &self.config, deadline, &self.cancel, || {
            self.round(low, high, key)
        })
        .await?;
        debug!(
            source = %self.source,
            schema = %self.schema,
            %high,
            applied = stats.applied,
            dropped = stats.dropped,
            dlqed = stats.dlqed,
            "consistent point advanced"
        );
        Ok(())
    }

    async fn round(&self, low: Hlc, high: Hlc, key: &str) -> Result<ApplyStats> {
        // Draining: collect staged mutations per table in (low, high].
        let tables = self.stagers.tables_in(&self.schema);
        let mut drained: Vec<(Table, Vec<Mutation>)> = Vec::with_capacity(tables.len());
        for table in tables {
            let muts = self.stagers.get(&table).drain(low, high).await?;
            if !muts.is_empty() {
                drained.push((table, muts));
            }
        }

        // Applying: one target transaction spans every table in the
        // schema for this round.
        let mut stats = ApplyStats::default();
        if !drained.is_empty() {
            let tx = self.conn.begin().await?;
            for (table, muts) in &drained {
                let applier = self.appliers.get(table);
                for partition in partition_by_key(muts.clone(), self.config.apply_workers) {
                    if partition.is_empty() {
                        continue;
                    }
                    match applier.apply(tx.as_ref(), &partition).await {
                        Ok(part) => stats.merge(part),
                        Err(err) => {
                            tx.rollback().await?;
                            return Err(err);
                        }
                    }
                }
            }
            tx.commit().await?;
        }

        // Committed: only now does the durable consistent point move.
        self.memo.put(key, high).await?;
        metrics::gauge!(
            "silt_resolver_committed_nanos",
            "source" => self.source.raw().to_string(),
            "schema" => self.schema.raw().to_string()
        )
        .set(high.nanos() as f64);

        // Staged rows at or below the consistent point are retired; a
        // failure here is harmless and cleaned up by the next round.
        for (table, _) in &drained {
            if let Err(err) = self.stagers.get(table).retire(high).await {
                warn!(table = %table, error = %err, "failed to retire staged rows");
            }
        }
        Ok(stats)
    }

    fn publish_status(&self, committed: Hlc, proposed: Hlc, error: Option<String>) {
        self.status.send_replace(LoopStatus {
            source: self.source.clone(),
            schema: self.schema.clone(),
            committed,
            proposed,
            lag_ms: LoopStatus::lag_ms(committed),
            error,
        });
    }
}
