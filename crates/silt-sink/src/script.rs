//! The user-script capability surface.
//!
//! The script evaluation engine is an external collaborator; the sink
//! consumes a fixed surface from it. Per source, a dispatch callback fans a
//! mutation out to zero or more target tables; per target, a map callback
//! may rewrite or discard mutations and a merger resolves CAS conflicts.
//! Callbacks are async capabilities and are treated as blocking I/O: the
//! evaluator may serialize them behind a work queue.

use crate::applycfg::ApplyConfig;
use crate::merge::Merger;
use futures::future::BoxFuture;
use silt_core::{Ident, IdentMap, Mutation, Result, SiltError, Table, TableMap};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

/// The fan-out a dispatch callback returns: target tables to the mutations
/// bound for them. An empty routing drops the mutation.
pub type TableRouting = TableMap<Vec<Mutation>>;

/// Per-source dispatch callback.
pub type DispatchFn =
    Arc<dyn Fn(Mutation) -> BoxFuture<'static, Result<TableRouting>> + Send + Sync>;

/// Per-target map callback. `None` discards the mutation.
pub type MapFn =
    Arc<dyn Fn(Mutation) -> BoxFuture<'static, Result<Option<Mutation>>> + Send + Sync>;

/// Wrap an async closure as a [`DispatchFn`].
pub fn dispatch_fn<F, Fut>(f: F) -> DispatchFn
where
    F: Fn(Mutation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TableRouting>> + Send + 'static,
{
    Arc::new(move |mutation| -> BoxFuture<'static, Result<TableRouting>> {
        Box::pin(f(mutation))
    })
}

/// Wrap an async closure as a [`MapFn`].
pub fn map_fn<F, Fut>(f: F) -> MapFn
where
    F: Fn(Mutation) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<Mutation>>> + Send + 'static,
{
    Arc::new(move |mutation| -> BoxFuture<'static, Result<Option<Mutation>>> {
        Box::pin(f(mutation))
    })
}

/// Configuration for one replication source.
pub struct SourceConfig {
    // NOTE: `dispatch` is a boxed closure and cannot derive `Debug`; the
    // manual impl below reports it by presence only.
    /// The table deletions are routed to. Falls back to the
    /// ingress-declared target when unset.
    pub deletes_to: Option<Table>,
    /// Fan a mutation out across target tables. When unset, mutations pass
    /// through to the ingress-declared target.
    pub dispatch: Option<DispatchFn>,
    /// Allow dispatched mutations to be re-dispatched, up to the
    /// configured depth limit.
    pub recurse: bool,
}

impl SourceConfig {
    pub fn new() -> Self {
        Self {
            deletes_to: None,
            dispatch: None,
            recurse: false,
        }
    }

    /// A source that routes everything, deletes included, to one table.
    pub fn passthrough(target: Table) -> Self {
        let route_to = target.clone();
        Self {
            deletes_to: Some(target),
            dispatch: Some(dispatch_fn(move |mutation: Mutation| {
                let route_to = route_to.clone();
                async move {
                    let mut routing = TableRouting::new();
                    routing.insert(route_to, vec![mutation]);
                    Ok(routing)
                }
            })),
            recurse: false,
        }
    }

    pub fn with_deletes_to(mut self, table: Table) -> Self {
        self.deletes_to = Some(table);
        self
    }

    pub fn with_dispatch(mut self, dispatch: DispatchFn) -> Self {
        self.dispatch = Some(dispatch);
        self
    }

    pub fn with_recurse(mut self, recurse: bool) -> Self {
        self.recurse = recurse;
        self
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SourceConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceConfig")
            .field("deletes_to", &self.deletes_to)
            .field("dispatch", &self.dispatch.is_some())
            .field("recurse", &self.recurse)
            .finish()
    }
}

/// Configuration for one target table.
pub struct TargetConfig {
    /// Rewrite or discard mutations bound for this table.
    pub map: Option<MapFn>,
    /// Resolves CAS conflicts. The standard three-way merger runs when
    /// unset.
    pub merger: Option<Arc<dyn Merger>>,
    /// Default dead-letter queue for rows this table cannot apply.
    pub dlq: Option<String>,
    /// Apply tuning.
    pub apply: ApplyConfig,
}

impl TargetConfig {
    pub fn new() -> Self {
        Self {
            map: None,
            merger: None,
            dlq: None,
            apply: ApplyConfig::default(),
        }
    }

    pub fn with_map(mut self, map: MapFn) -> Self {
        self.map = Some(map);
        self
    }

    pub fn with_merger(mut self, merger: Arc<dyn Merger>) -> Self {
        self.merger = Some(merger);
        self
    }

    pub fn with_dlq(mut self, dlq: impl Into<String>) -> Self {
        self.dlq = Some(dlq.into());
        self
    }

    pub fn with_apply(mut self, apply: ApplyConfig) -> Self {
        self.apply = apply;
        self
    }
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TargetConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TargetConfig")
            .field("map", &self.map.is_some())
            .field("merger", &self.merger.is_some())
            .field("dlq", &self.dlq)
            .field("apply", &self.apply)
            .finish()
    }
}

/// Everything a loaded user script contributes.
#[derive(Debug)]
pub struct UserScript {
    pub sources: IdentMap<SourceConfig>,
    pub targets: TableMap<TargetConfig>,
    /// Host-provided option bag populated through `set_option`.
    pub options: HashMap<String, String>,
}

impl UserScript {
    /// An empty script: everything passes through untouched.
    pub fn empty() -> Self {
        Self {
            sources: IdentMap::new(),
            targets: TableMap::new(),
            options: HashMap::new(),
        }
    }
}

/// Builder mirroring the evaluator's registration surface:
/// `configure_source`, `configure_table`, `set_option`.
pub struct ScriptBuilder {
    sources: IdentMap<SourceConfig>,
    targets: TableMap<TargetConfig>,
    options: HashMap<String, String>,
}

impl ScriptBuilder {
    pub fn new() -> Self {
        Self {
            sources: IdentMap::new(),
            targets: TableMap::new(),
            options: HashMap::new(),
        }
    }

    pub fn configure_source(mut self, name: impl Into<Ident>, cfg: SourceConfig) -> Self {
        self.sources.insert(name.into(), cfg);
        self
    }

    pub fn configure_table(mut self, table: Table, cfg: TargetConfig) -> Self {
        self.targets.insert(table, cfg);
        self
    }

    pub fn set_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Validate and freeze the script.
    pub fn build(self) -> Result<UserScript> {
        for (name, source) in self.sources.iter() {
            if source.dispatch.is_none() && source.deletes_to.is_none() {
                return Err(SiltError::config(format!(
                    "source {name} declares neither a dispatch function nor a delete target"
                )));
            }
        }
        Ok(UserScript {
            sources: self.sources,
            targets: self.targets,
            options: self.options,
        })
    }
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::new()
    }
}
