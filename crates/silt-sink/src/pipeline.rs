//! The event pipeline.
//!
//! Ingress hands batches of mutations to an [`Events`] implementation:
//!
//! - [`SerialEvents`] (immediate mode) applies inside one target
//!   transaction per ingress batch.
//! - [`DeferredEvents`] persists into the staging store; the resolver loop
//!   applies later, when the upstream reports a resolved timestamp.
//! - [`ScriptEvents`] wraps either of the above and routes every mutation
//!   through the user script: per-source dispatch fan-out, delete routing,
//!   and per-target map/filter.

use crate::apply::{Appliers, ApplyStats};
use crate::config::SinkConfig;
use crate::script::UserScript;
use crate::stage::Stagers;
use crate::target::{TargetConn, TargetTx};
use async_trait::async_trait;
use silt_core::{Ident, Mutation, Result, SiltError, Table};
use std::sync::Arc;
use tracing::trace;

/// Creates one [`Batch`] per ingress request.
#[async_trait]
pub trait Events: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn Batch>>;
}

/// One ingress batch in flight.
///
/// `target` is the ingress-declared destination; it may be absent for
/// sources that rely entirely on dispatch routing.
#[async_trait]
pub trait Batch: Send {
    async fn on_data(
        &mut self,
        source: &Ident,
        target: Option<&Table>,
        muts: Vec<Mutation>,
    ) -> Result<()>;

    /// Push any buffered writes down. The default is a no-op for
    /// implementations that write in `on_data`.
    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn commit(&mut self) -> Result<ApplyStats>;

    async fn rollback(&mut self) -> Result<()>;
}

fn require_target<'a>(source: &Ident, target: Option<&'a Table>) -> Result<&'a Table> {
    target.ok_or_else(|| SiltError::NoDeleteTarget(source.raw().to_string()))
}

// ----------------------------------------------------------------------
// Immediate mode
// ----------------------------------------------------------------------

/// Immediate mode: one target transaction per ingress batch.
pub struct SerialEvents {
    conn: Arc<dyn TargetConn>,
    appliers: Arc<Appliers>,
}

impl SerialEvents {
    pub fn new(conn: Arc<dyn TargetConn>, appliers: Arc<Appliers>) -> Self {
        Self { conn, appliers }
    }
}

#[async_trait]
impl Events for SerialEvents {
    async fn begin(&self) -> Result<Box<dyn Batch>> {
        let tx = self.conn.begin().await?;
        Ok(Box::new(SerialBatch {
            appliers: Arc::clone(&self.appliers),
            tx: Some(tx),
            stats: ApplyStats::default(),
        }))
    }
}

struct SerialBatch {
    appliers: Arc<Appliers>,
    tx: Option<Box<dyn TargetTx>>,
    stats: ApplyStats,
}

impl SerialBatch {
    fn tx(&self) -> Result<&dyn TargetTx> {
        self.tx
            .as_deref()
            .ok_or_else(|| SiltError::fatal("batch used after commit or rollback"))
    }
}

#[async_trait]
impl Batch for SerialBatch {
    async fn on_data(
        &mut self,
        source: &Ident,
        target: Option<&Table>,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        let target = require_target(source, target)?;
        let applier = self.appliers.get(target);
        let stats = applier.apply(self.tx()?, &muts).await?;
        self.stats.merge(stats);
        Ok(())
    }

    async fn commit(&mut self) -> Result<ApplyStats> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| SiltError::fatal("commit without open transaction"))?;
        tx.commit().await?;
        Ok(self.stats)
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Deferred mode
// ----------------------------------------------------------------------

/// Deferred mode: `on_data` returns once the mutations are durably staged.
/// The upstream redelivers on failure; staging is idempotent, so
/// redelivery is safe.
pub struct DeferredEvents {
    stagers: Arc<Stagers>,
    config: SinkConfig,
}

impl DeferredEvents {
    pub fn new(stagers: Arc<Stagers>, config: SinkConfig) -> Self {
        Self { stagers, config }
    }
}

#[async_trait]
impl Events for DeferredEvents {
    async fn begin(&self) -> Result<Box<dyn Batch>> {
        Ok(Box::new(DeferredBatch {
            stagers: Arc::clone(&self.stagers),
            store_timeout: self.config.store_timeout(),
        }))
    }
}

struct DeferredBatch {
    stagers: Arc<Stagers>,
    store_timeout: std::time::Duration,
}

#[async_trait]
impl Batch for DeferredBatch {
    async fn on_data(
        &mut self,
        source: &Ident,
        target: Option<&Table>,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        let target = require_target(source, target)?;
        let stager = self.stagers.get(target);
        let staged = tokio::time::timeout(self.store_timeout, stager.store(&muts))
            .await
            .map_err(|_| SiltError::timeout(format!("staging for {target}")))??;
        trace!(target = %target, staged, total = muts.len(), "staged batch");
        metrics::counter!("silt_mutations_staged_total", "table" => target.to_string())
            .increment(staged);
        Ok(())
    }

    async fn commit(&mut self) -> Result<ApplyStats> {
        // Staging writes are already durable; the consistent point moves
        // only when the resolver applies.
        Ok(ApplyStats::default())
    }

    async fn rollback(&mut self) -> Result<()> {
        // Staged rows are idempotent on (key, time); redelivery after a
        // partial failure re-stages harmlessly.
        Ok(())
    }
}

// ----------------------------------------------------------------------
// Script routing
// ----------------------------------------------------------------------

/// Wraps an [`Events`] implementation with user-script routing.
pub struct ScriptEvents {
    inner: Arc<dyn Events>,
    script: Arc<UserScript>,
    depth_limit: usize,
}

impl ScriptEvents {
    pub fn new(inner: Arc<dyn Events>, script: Arc<UserScript>, config: &SinkConfig) -> Self {
        Self {
            inner,
            script,
            depth_limit: config.dispatch_depth_limit,
        }
    }
}

#[async_trait]
impl Events for ScriptEvents {
    async fn begin(&self) -> Result<Box<dyn Batch>> {
        let delegate = self.inner.begin().await?;
        Ok(Box::new(ScriptBatch {
            delegate,
            script: Arc::clone(&self.script),
            depth_limit: self.depth_limit,
        }))
    }
}

struct ScriptBatch {
    delegate: Box<dyn Batch>,
    script: Arc<UserScript>,
    depth_limit: usize,
}

impl ScriptBatch {
    /// Apply the per-target map callback, then hand the survivors to the
    /// delegate. Filtering compacts in place, preserving arrival order.
    async fn send_to_target(
        &mut self,
        source: &Ident,
        target: &Table,
        mut muts: Vec<Mutation>,
    ) -> Result<()> {
        let map = self
            .script
            .targets
            .get(target)
            .and_then(|cfg| cfg.map.clone());
        if let Some(map) = map {
            let mut kept = 0;
            for idx in 0..muts.len() {
                let mutation = muts[idx].clone();
                match map(mutation).await.map_err(into_script_error)? {
                    Some(replacement) => {
                        muts[kept] = replacement;
                        kept += 1;
                    }
                    None => {}
                }
            }
            if kept == 0 {
                return Ok(());
            }
            muts.truncate(kept);
        }
        self.delegate.on_data(source, Some(target), muts).await
    }

    /// Fan a routing map out, optionally re-dispatching for recursive
    /// sources. A mutation that dispatches back to itself is delivered
    /// rather than re-dispatched, and the depth limit caps runaway
    /// expansion.
    async fn route(
        &mut self,
        source: &Ident,
        cfg_recurse: bool,
        routing: crate::script::TableRouting,
        depth: usize,
    ) -> Result<()> {
        for (dest, muts) in routing {
            if !cfg_recurse || depth >= self.depth_limit {
                self.send_to_target(source, &dest, muts).await?;
                continue;
            }
            let dispatch = self
                .script
                .sources
                .get(source)
                .and_then(|cfg| cfg.dispatch.clone());
            let Some(dispatch) = dispatch else {
                self.send_to_target(source, &dest, muts).await?;
                continue;
            };
            let mut deliver: Vec<Mutation> = Vec::new();
            for mutation in muts {
                let nested = dispatch(mutation.clone()).await.map_err(into_script_error)?;
                if is_self_route(&nested, &dest, &mutation) {
                    deliver.push(mutation);
                } else {
                    Box::pin(self.route(source, true, nested, depth + 1)).await?;
                }
            }
            if !deliver.is_empty() {
                self.send_to_target(source, &dest, deliver).await?;
            }
        }
        Ok(())
    }
}

/// True when a dispatch result routes the input mutation, unchanged, to
/// the one table it was already bound for.
fn is_self_route(
    routing: &crate::script::TableRouting,
    dest: &Table,
    mutation: &Mutation,
) -> bool {
    routing.len() == 1
        && routing
            .get(dest)
            .is_some_and(|muts| muts.len() == 1 && muts[0] == *mutation)
}

fn into_script_error(err: SiltError) -> SiltError {
    match err {
        err @ SiltError::Script(_) => err,
        other => SiltError::script(other.to_string()),
    }
}

#[async_trait]
impl Batch for ScriptBatch {
    async fn on_data(
        &mut self,
        source: &Ident,
        target: Option<&Table>,
        muts: Vec<Mutation>,
    ) -> Result<()> {
        let (deletes_to, dispatch, recurse) = match self.script.sources.get(source) {
            Some(cfg) => (cfg.deletes_to.clone(), cfg.dispatch.clone(), cfg.recurse),
            None => (None, None, false),
        };

        let Some(dispatch) = dispatch else {
            let target = require_target(source, target)?;
            return self.send_to_target(source, target, muts).await;
        };

        for mutation in muts {
            // Deletes bypass dispatch: they go to the configured delete
            // table, or the ingress-declared target.
            if mutation.is_delete() {
                let dest = match (&deletes_to, target) {
                    (Some(dest), _) => dest.clone(),
                    (None, Some(target)) => target.clone(),
                    (None, None) => {
                        return Err(SiltError::NoDeleteTarget(source.raw().to_string()))
                    }
                };
                self.send_to_target(source, &dest, vec![mutation]).await?;
                continue;
            }

            let routing = dispatch(mutation).await.map_err(into_script_error)?;
            if routing.is_empty() {
                continue;
            }
            self.route(source, recurse, routing, 1).await?;
        }
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        self.delegate.flush().await
    }

    async fn commit(&mut self) -> Result<ApplyStats> {
        self.delegate.commit().await
    }

    async fn rollback(&mut self) -> Result<()> {
        self.delegate.rollback().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dlq::DlqSet;
    use crate::schema::{columns, SchemaWatcher};
    use crate::script::{dispatch_fn, map_fn, ScriptBuilder, SourceConfig, TargetConfig};
    use crate::stage::Stagers;
    use crate::testing::RecordingConn;
    use serde_json::json;
    use silt_core::{Hlc, Schema, TableMap};

    fn table(name: &str) -> Table {
        Table::new(Schema::new("public"), name)
    }

    fn watcher_for(tables: &[(&str, &[(&str, bool)])]) -> Arc<SchemaWatcher> {
        let watcher = Arc::new(SchemaWatcher::new());
        let mut map = TableMap::new();
        for (name, cols) in tables {
            map.insert(table(name), columns(cols));
        }
        watcher.seed(map);
        watcher
    }

    fn serial_events(conn: &RecordingConn, script: Arc<UserScript>) -> Arc<dyn Events> {
        let watcher = watcher_for(&[
            ("t1", &[("id", true), ("msg", false)]),
            ("some_table", &[("id", true), ("passthrough", false)]),
        ]);
        let appliers = Arc::new(Appliers::new(watcher, script, Arc::new(DlqSet::new())));
        Arc::new(SerialEvents::new(Arc::new(conn.clone()), appliers))
    }

    fn mutation(key: i64, data: serde_json::Value) -> Mutation {
        Mutation::insert(json!([key]), data, Hlc::new(10, 0))
    }

    #[tokio::test]
    async fn test_serial_batch_is_one_transaction() {
        let conn = RecordingConn::new();
        let script = Arc::new(UserScript::empty());
        let events = serial_events(&conn, script);

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("t1")),
                vec![mutation(1, json!({"msg": "a"}))],
            )
            .await
            .unwrap();
        let stats = batch.commit().await.unwrap();

        assert_eq!(stats.applied, 1);
        assert_eq!(conn.events(), vec!["begin", "commit"]);
        assert_eq!(conn.statements().len(), 1);
    }

    #[tokio::test]
    async fn test_serial_batch_rollback() {
        let conn = RecordingConn::new();
        let events = serial_events(&conn, Arc::new(UserScript::empty()));

        let mut batch = events.begin().await.unwrap();
        batch.rollback().await.unwrap();

        assert_eq!(conn.events(), vec!["begin", "rollback"]);
    }

    #[tokio::test]
    async fn test_deferred_batch_stages_without_transaction() {
        let stagers = Arc::new(Stagers::memory());
        let events = DeferredEvents::new(Arc::clone(&stagers), SinkConfig::default());

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("t1")),
                vec![mutation(1, json!({"msg": "a"})), mutation(2, json!({"msg": "b"}))],
            )
            .await
            .unwrap();
        let stats = batch.commit().await.unwrap();

        assert_eq!(stats, ApplyStats::default());
        let staged = stagers
            .get(&table("t1"))
            .drain(Hlc::ZERO, Hlc::new(99, 0))
            .await
            .unwrap();
        assert_eq!(staged.len(), 2);
    }

    #[tokio::test]
    async fn test_script_routes_deletes_to_configured_table() {
        let stagers = Arc::new(Stagers::memory());
        let inner = Arc::new(DeferredEvents::new(Arc::clone(&stagers), SinkConfig::default()));
        let script = Arc::new(
            ScriptBuilder::new()
                .configure_source(
                    "src",
                    SourceConfig::passthrough(table("some_table")).with_deletes_to(table("t1")),
                )
                .build()
                .unwrap(),
        );
        let events = ScriptEvents::new(inner, script, &SinkConfig::default());

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("ignored")),
                vec![Mutation::delete(json!([1]), Hlc::new(5, 0))],
            )
            .await
            .unwrap();
        batch.commit().await.unwrap();

        let staged = stagers
            .get(&table("t1"))
            .drain(Hlc::ZERO, Hlc::new(99, 0))
            .await
            .unwrap();
        assert_eq!(staged.len(), 1);
        assert!(staged[0].is_delete());
    }

    #[tokio::test]
    async fn test_script_delete_without_any_target_fails() {
        let inner = Arc::new(DeferredEvents::new(
            Arc::new(Stagers::memory()),
            SinkConfig::default(),
        ));
        let script = Arc::new(
            ScriptBuilder::new()
                .configure_source(
                    "src",
                    SourceConfig::new().with_dispatch(dispatch_fn(|_: Mutation| async move {
                        Ok(crate::script::TableRouting::new())
                    })),
                )
                .build()
                .unwrap(),
        );
        let events = ScriptEvents::new(inner, script, &SinkConfig::default());

        let mut batch = events.begin().await.unwrap();
        let err = batch
            .on_data(
                &Ident::new("src"),
                None,
                vec![Mutation::delete(json!([1]), Hlc::new(5, 0))],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SiltError::NoDeleteTarget(_)));
    }

    #[tokio::test]
    async fn test_script_empty_routing_drops_mutation() {
        let stagers = Arc::new(Stagers::memory());
        let inner = Arc::new(DeferredEvents::new(Arc::clone(&stagers), SinkConfig::default()));
        let script = Arc::new(
            ScriptBuilder::new()
                .configure_source(
                    "src",
                    SourceConfig::new().with_dispatch(dispatch_fn(|_: Mutation| async move {
                        Ok(crate::script::TableRouting::new())
                    })),
                )
                .build()
                .unwrap(),
        );
        let events = ScriptEvents::new(inner, script, &SinkConfig::default());

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("t1")),
                vec![mutation(1, json!({"msg": "x"}))],
            )
            .await
            .unwrap();
        batch.commit().await.unwrap();

        assert!(stagers
            .get(&table("t1"))
            .drain(Hlc::ZERO, Hlc::new(99, 0))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_target_map_filters_and_rewrites_in_order() {
        let stagers = Arc::new(Stagers::memory());
        let inner = Arc::new(DeferredEvents::new(Arc::clone(&stagers), SinkConfig::default()));
        let script = Arc::new(
            ScriptBuilder::new()
                .configure_table(
                    table("t1"),
                    TargetConfig::new().with_map(map_fn(|mut m: Mutation| async move {
                        let keep = m.data.as_ref().unwrap()["keep"].as_bool().unwrap();
                        if !keep {
                            return Ok(None);
                        }
                        if let Some(serde_json::Value::Object(obj)) = m.data.as_mut() {
                            obj.insert("mapped".to_string(), json!(true));
                        }
                        Ok(Some(m))
                    })),
                )
                .build()
                .unwrap(),
        );
        let events = ScriptEvents::new(inner, script, &SinkConfig::default());

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("t1")),
                vec![
                    mutation(1, json!({"keep": true})),
                    mutation(2, json!({"keep": false})),
                    mutation(3, json!({"keep": true})),
                ],
            )
            .await
            .unwrap();

        let staged = stagers
            .get(&table("t1"))
            .drain(Hlc::ZERO, Hlc::new(99, 0))
            .await
            .unwrap();
        assert_eq!(staged.len(), 2);
        for m in &staged {
            assert_eq!(m.data.as_ref().unwrap()["mapped"], json!(true));
        }
    }

    #[tokio::test]
    async fn test_recursive_dispatch_is_depth_bounded() {
        let stagers = Arc::new(Stagers::memory());
        let inner = Arc::new(DeferredEvents::new(Arc::clone(&stagers), SinkConfig::default()));
        // Every dispatch rewrites the mutation, so recursion only stops at
        // the depth limit.
        let script = Arc::new(
            ScriptBuilder::new()
                .configure_source(
                    "src",
                    SourceConfig::new()
                        .with_recurse(true)
                        .with_dispatch(dispatch_fn(|mut m: Mutation| async move {
                            if let Some(serde_json::Value::Object(obj)) = m.data.as_mut() {
                                let depth = obj["depth"].as_i64().unwrap();
                                obj.insert("depth".to_string(), json!(depth + 1));
                            }
                            let mut routing = crate::script::TableRouting::new();
                            routing.insert(
                                Table::new(Schema::new("public"), "t1"),
                                vec![m],
                            );
                            Ok(routing)
                        })),
                )
                .build()
                .unwrap(),
        );
        let cfg = SinkConfig {
            dispatch_depth_limit: 3,
            ..Default::default()
        };
        let events = ScriptEvents::new(inner, script, &cfg);

        let mut batch = events.begin().await.unwrap();
        batch
            .on_data(
                &Ident::new("src"),
                Some(&table("t1")),
                vec![mutation(1, json!({"depth": 0}))],
            )
            .await
            .unwrap();

        let staged = stagers
            .get(&table("t1"))
            .drain(Hlc::ZERO, Hlc::new(99, 0))
            .await
            .unwrap();
        assert_eq!(staged.len(), 1);
        // Dispatched once at the top, then re-dispatched until depth 3.
        assert_eq!(staged[0].data.as_ref().unwrap()["depth"], json!(3));
    }
}
