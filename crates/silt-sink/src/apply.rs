//! The apply engine: staged mutations become target-database writes.
//!
//! Each [`Applier`] owns one target table. It resolves incoming JSON
//! properties against the cached schema snapshot, honors the table's
//! [`ApplyConfig`] (ignore filter, deadlines, expression templates, extras
//! overflow, compare-and-set), and turns the surviving rows into
//! parameterized SQL. CAS losers become three-way conflicts for the
//! table's merger.

use crate::applycfg::ApplyConfig;
use crate::dlq::{DeadLetter, DlqSet};
use crate::merge::{Conflict, Merger, PropertyBag, Resolution, StandardMerger};
use crate::schema::{SchemaWatcher, TableSchema};
use crate::script::UserScript;
use crate::target::TargetTx;
use dashmap::DashMap;
use serde_json::Value;
use silt_core::{Ident, Mutation, Result, SiltError, Table};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::{debug, trace};

/// Outcome counts for one apply call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    /// Rows written to the target, including merger-resolved rewrites.
    pub applied: u64,
    /// Rows discarded by deadlines or merge resolutions.
    pub dropped: u64,
    /// Rows routed to a dead-letter queue.
    pub dlqed: u64,
}

impl ApplyStats {
    pub fn merge(&mut self, other: ApplyStats) {
        self.applied += other.applied;
        self.dropped += other.dropped;
        self.dlqed += other.dlqed;
    }
}

/// Split a batch into per-key partitions for worker fanout.
///
/// Mutations for the same key always land in the same partition and keep
/// their relative order, so per-key HLC ordering survives parallel apply.
pub fn partition_by_key(muts: Vec<Mutation>, partitions: usize) -> Vec<Vec<Mutation>> {
    let partitions = partitions.max(1);
    let mut out: Vec<Vec<Mutation>> = (0..partitions).map(|_| Vec::new()).collect();
    for mutation in muts {
        let mut hasher = DefaultHasher::new();
        mutation.key_text().hash(&mut hasher);
        let slot = (hasher.finish() % partitions as u64) as usize;
        out[slot].push(mutation);
    }
    out
}

/// Applies mutations to one target table.
pub struct Applier {
    table: Table,
    cfg: ApplyConfig,
    merger: Arc<dyn Merger>,
    dlq_name: Option<String>,
    dlqs: Arc<DlqSet>,
    watcher: Arc<SchemaWatcher>,
}

/// A mutation's data resolved against the target schema: the column bag to
/// write, or a reason not to.
enum ResolvedUpsert {
    Row(PropertyBag),
    /// Dropped by a deadline.
    Expired,
}

impl Applier {
    pub fn new(
        table: Table,
        cfg: ApplyConfig,
        merger: Option<Arc<dyn Merger>>,
        dlq_name: Option<String>,
        dlqs: Arc<DlqSet>,
        watcher: Arc<SchemaWatcher>,
    ) -> Self {
        Self {
            table,
            cfg,
            merger: merger.unwrap_or_else(|| Arc::new(StandardMerger::new())),
            dlq_name,
            dlqs,
            watcher,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// Apply a batch inside the caller's transaction.
    ///
    /// Mutations for the same key must arrive in HLC order; the batch is
    /// processed as ordered runs of deletes and upserts so that order is
    /// preserved. A schema mismatch is retried once against a fresh
    /// snapshot before failing the batch.
    pub async fn apply(&self, tx: &dyn TargetTx, muts: &[Mutation]) -> Result<ApplyStats> {
        let snapshot = self.watcher.snapshot();
        match self.apply_once(tx, muts, &snapshot).await {
            Err(SiltError::SchemaMismatch(first)) => {
                debug!(table = %self.table, error = %first, "schema mismatch, retrying with fresh snapshot");
                let snapshot = self.watcher.snapshot();
                self.apply_once(tx, muts, &snapshot).await
            }
            other => other,
        }
    }

    async fn apply_once(
        &self,
        tx: &dyn TargetTx,
        muts: &[Mutation],
        snapshot: &silt_core::TableMap<TableSchema>,
    ) -> Result<ApplyStats> {
        let schema = snapshot
            .get(&self.table)
            .ok_or_else(|| SiltError::schema_mismatch(format!("unknown table {}", self.table)))?;

        let mut stats = ApplyStats::default();
        let mut deletes: Vec<&Mutation> = Vec::new();
        let mut upserts: Vec<&Mutation> = Vec::new();

        for mutation in muts {
            if mutation.is_delete() {
                if !upserts.is_empty() {
                    self.flush_upserts(tx, schema, &mut upserts, &mut stats).await?;
                }
                deletes.push(mutation);
            } else {
                if !deletes.is_empty() {
                    self.flush_deletes(tx, schema, &mut deletes, &mut stats).await?;
                }
                upserts.push(mutation);
            }
        }
        if !upserts.is_empty() {
            self.flush_upserts(tx, schema, &mut upserts, &mut stats).await?;
        }
        if !deletes.is_empty() {
            self.flush_deletes(tx, schema, &mut deletes, &mut stats).await?;
        }

        metrics::counter!("silt_mutations_applied_total", "table" => self.table.to_string())
            .increment(stats.applied);
        metrics::counter!("silt_mutations_dropped_total", "table" => self.table.to_string())
            .increment(stats.dropped);
        Ok(stats)
    }

    // ------------------------------------------------------------------
    // Deletes
    // ------------------------------------------------------------------

    async fn flush_deletes(
        &self,
        tx: &dyn TargetTx,
        schema: &TableSchema,
        run: &mut Vec<&Mutation>,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        let pk_cols = schema.pk_columns();
        let mut params: Vec<Value> = Vec::new();
        let mut tuples: Vec<String> = Vec::new();

        for mutation in run.drain(..) {
            match self.key_components(mutation, pk_cols.len()) {
                Ok(components) => {
                    let base = params.len();
                    let placeholders: Vec<String> = (0..components.len())
                        .map(|i| format!("${}", base + i + 1))
                        .collect();
                    tuples.push(format!("({})", placeholders.join(", ")));
                    params.extend(components);
                }
                Err(err) => {
                    self.dead_letter_or_fail(mutation, err, stats).await?;
                }
            }
        }
        if tuples.is_empty() {
            return Ok(());
        }

        let pk_list: Vec<String> = pk_cols.iter().map(|c| c.name.quoted()).collect();
        let sql = format!(
            "DELETE FROM {} WHERE ({}) IN ({})",
            self.table.quoted(),
            pk_list.join(", "),
            tuples.join(", ")
        );
        trace!(table = %self.table, rows = tuples.len(), "delete batch");
        tx.execute(&sql, &params).await?;
        stats.applied += tuples.len() as u64;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Upserts
    // ------------------------------------------------------------------

    async fn flush_upserts(
        &self,
        tx: &dyn TargetTx,
        schema: &TableSchema,
        run: &mut Vec<&Mutation>,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        // CAS tables apply row by row: the conditional upsert reports
        // per-row predicate failures that become merge conflicts.
        if !self.cfg.cas.is_empty() {
            for mutation in run.drain(..) {
                self.apply_cas_row(tx, schema, mutation, stats).await?;
            }
            return Ok(());
        }

        // Plain upserts batch as long as consecutive rows share a column
        // list; batching never reorders, so per-key order holds.
        let mut pending: Vec<PropertyBag> = Vec::new();
        let mut pending_cols: Vec<Ident> = Vec::new();

        for mutation in run.drain(..) {
            let bag = match self.resolve_upsert(schema, mutation) {
                Ok(ResolvedUpsert::Row(bag)) => bag,
                Ok(ResolvedUpsert::Expired) => {
                    stats.dropped += 1;
                    continue;
                }
                Err(err @ SiltError::SchemaMismatch(_)) => return Err(err),
                Err(err) => {
                    self.dead_letter_or_fail(mutation, err, stats).await?;
                    continue;
                }
            };
            let cols: Vec<Ident> = bag.iter().map(|(c, _)| c.clone()).collect();
            if !pending.is_empty() && cols != pending_cols {
                self.execute_upsert(tx, schema, &pending_cols, &pending).await?;
                stats.applied += pending.len() as u64;
                pending.clear();
            }
            pending_cols = cols;
            pending.push(bag);
        }
        if !pending.is_empty() {
            self.execute_upsert(tx, schema, &pending_cols, &pending).await?;
            stats.applied += pending.len() as u64;
        }
        Ok(())
    }

    async fn apply_cas_row(
        &self,
        tx: &dyn TargetTx,
        schema: &TableSchema,
        mutation: &Mutation,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        let bag = match self.resolve_upsert(schema, mutation) {
            Ok(ResolvedUpsert::Row(bag)) => bag,
            Ok(ResolvedUpsert::Expired) => {
                stats.dropped += 1;
                return Ok(());
            }
            Err(err @ SiltError::SchemaMismatch(_)) => return Err(err),
            Err(err) => {
                return self.dead_letter_or_fail(mutation, err, stats).await;
            }
        };

        let cols: Vec<Ident> = bag.iter().map(|(c, _)| c.clone()).collect();
        let rows = std::slice::from_ref(&bag);
        let (sql, params) = self.upsert_sql(schema, &cols, rows, true)?;
        let affected = tx.execute(&sql, &params).await?;
        if affected > 0 {
            stats.applied += 1;
            return Ok(());
        }

        // Predicate lost: build the three-way conflict and let the merger
        // decide.
        metrics::counter!("silt_cas_conflicts_total", "table" => self.table.to_string())
            .increment(1);
        let target = self.read_target_row(tx, schema, mutation).await?;
        let conflict = Conflict {
            before: mutation
                .before
                .as_ref()
                .map(PropertyBag::from_object)
                .unwrap_or_default(),
            proposed: bag,
            target,
            unmerged: Vec::new(),
        };

        let resolution = match self.merger.merge(&conflict).await {
            Ok(resolution) => resolution,
            Err(err @ SiltError::Conflict(_)) => {
                return self.dead_letter_or_fail(mutation, err, stats).await;
            }
            Err(err) => return Err(err),
        };

        match resolution {
            Resolution::Apply(replacement) => {
                let cols: Vec<Ident> = replacement.iter().map(|(c, _)| c.clone()).collect();
                let rows = std::slice::from_ref(&replacement);
                let (sql, params) = self.upsert_sql(schema, &cols, rows, false)?;
                tx.execute(&sql, &params).await?;
                stats.applied += 1;
            }
            Resolution::Drop => {
                stats.dropped += 1;
            }
            Resolution::Dlq(queue) => {
                self.enqueue_dead_letter(&queue, mutation, "merge resolution", stats)
                    .await?;
            }
        }
        Ok(())
    }

    async fn execute_upsert(
        &self,
        tx: &dyn TargetTx,
        schema: &TableSchema,
        cols: &[Ident],
        rows: &[PropertyBag],
    ) -> Result<()> {
        let (sql, params) = self.upsert_sql(schema, cols, rows, false)?;
        trace!(table = %self.table, rows = rows.len(), "upsert batch");
        tx.execute(&sql, &params).await?;
        Ok(())
    }

    /// Build a (possibly conditional) multi-row upsert.
    fn upsert_sql(
        &self,
        schema: &TableSchema,
        cols: &[Ident],
        rows: &[PropertyBag],
        with_cas: bool,
    ) -> Result<(String, Vec<Value>)> {
        let pk_cols = schema.pk_columns();
        let col_list: Vec<String> = cols.iter().map(|c| c.quoted()).collect();

        let mut params: Vec<Value> = Vec::new();
        let mut value_tuples: Vec<String> = Vec::with_capacity(rows.len());
        for row in rows {
            let mut exprs = Vec::with_capacity(cols.len());
            for col in cols {
                let value = row.get(col).cloned().unwrap_or(Value::Null);
                match self.cfg.exprs.get(col) {
                    Some(template) if template.contains("$0") => {
                        params.push(value);
                        exprs.push(template.replace("$0", &format!("${}", params.len())));
                    }
                    Some(template) => {
                        // No placeholder: the template is the whole
                        // server-side expression and the value is unused.
                        exprs.push(template.clone());
                    }
                    None => {
                        params.push(value);
                        exprs.push(format!("${}", params.len()));
                    }
                }
            }
            value_tuples.push(format!("({})", exprs.join(", ")));
        }

        let pk_list: Vec<String> = pk_cols.iter().map(|c| c.name.quoted()).collect();
        let update_cols: Vec<String> = cols
            .iter()
            .filter(|c| !pk_cols.iter().any(|pk| &pk.name == *c))
            .map(|c| format!("{} = excluded.{}", c.quoted(), c.quoted()))
            .collect();

        let mut sql = format!(
            "INSERT INTO {} AS t ({}) VALUES {}",
            self.table.quoted(),
            col_list.join(", "),
            value_tuples.join(", ")
        );
        if update_cols.is_empty() {
            sql.push_str(&format!(" ON CONFLICT ({}) DO NOTHING", pk_list.join(", ")));
        } else {
            sql.push_str(&format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                pk_list.join(", "),
                update_cols.join(", ")
            ));
            if with_cas {
                let stored: Vec<String> = self
                    .cfg
                    .cas
                    .iter()
                    .map(|c| format!("t.{}", c.quoted()))
                    .collect();
                let proposed: Vec<String> = self
                    .cfg
                    .cas
                    .iter()
                    .map(|c| format!("excluded.{}", c.quoted()))
                    .collect();
                sql.push_str(&format!(
                    " WHERE ({}) < ({})",
                    stored.join(", "),
                    proposed.join(", ")
                ));
            }
        }
        Ok((sql, params))
    }

    // ------------------------------------------------------------------
    // Row resolution
    // ------------------------------------------------------------------

    /// Resolve a mutation's data object into target columns: renames, the
    /// ignore filter, deadlines, extras overflow, and primary-key values
    /// from the mutation key.
    fn resolve_upsert(&self, schema: &TableSchema, mutation: &Mutation) -> Result<ResolvedUpsert> {
        let data = match &mutation.data {
            Some(Value::Object(obj)) => obj,
            _ => {
                return Err(SiltError::bad_request(format!(
                    "mutation data for {} is not an object",
                    self.table
                )))
            }
        };

        if self.row_expired(data)? {
            return Ok(ResolvedUpsert::Expired);
        }

        let mut bag = PropertyBag::new();
        let mut extras = serde_json::Map::new();
        for (prop, value) in data {
            let prop_ident = Ident::new(prop.clone());
            if self.cfg.ignore.contains_key(&prop_ident) {
                continue;
            }
            let column = self.target_column(&prop_ident);
            if schema.column(&column).is_some() {
                bag.put(column, value.clone());
            } else if self.cfg.extras.is_some() {
                extras.insert(prop.clone(), value.clone());
            } else {
                return Err(SiltError::schema_mismatch(format!(
                    "column {prop} does not exist in {} and no extras column is configured",
                    self.table
                )));
            }
        }
        if let Some(extras_col) = &self.cfg.extras {
            if !extras.is_empty() {
                bag.put(extras_col.clone(), Value::Object(extras));
            }
        }

        // Primary-key values come from the mutation key, which is
        // authoritative over any data properties.
        let pk_cols = schema.pk_columns();
        let components = self.key_components(mutation, pk_cols.len())?;
        for (pk, component) in pk_cols.iter().zip(components) {
            bag.put(pk.name.clone(), component);
        }

        Ok(ResolvedUpsert::Row(bag))
    }

    /// Map an incoming property to its target column, honoring renames.
    fn target_column(&self, prop: &Ident) -> Ident {
        for (target, source) in self.cfg.source_names.iter() {
            if source == prop {
                return target.clone();
            }
        }
        prop.clone()
    }

    /// Evaluate deadline columns against the wall clock.
    fn row_expired(&self, data: &serde_json::Map<String, Value>) -> Result<bool> {
        if self.cfg.deadlines.is_empty() {
            return Ok(false);
        }
        let now = chrono::Utc::now();
        for (col, limit) in self.cfg.deadlines.iter() {
            let Some(value) = data
                .iter()
                .find(|(prop, _)| Ident::new((*prop).clone()) == *col)
                .map(|(_, v)| v)
            else {
                continue;
            };
            let stamp = parse_timestamp(value).ok_or_else(|| {
                SiltError::bad_request(format!("deadline column {col} is not a timestamp"))
            })?;
            let age = now.signed_duration_since(stamp);
            if age > chrono::Duration::from_std(*limit).unwrap_or(chrono::Duration::MAX) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// The mutation key's components, checked against the primary-key
    /// arity.
    fn key_components(&self, mutation: &Mutation, pk_len: usize) -> Result<Vec<Value>> {
        match &mutation.key {
            Value::Array(components) if components.len() == pk_len => Ok(components.clone()),
            Value::Array(components) => Err(SiltError::bad_request(format!(
                "key for {} has {} components, primary key has {}",
                self.table,
                components.len(),
                pk_len
            ))),
            _ => Err(SiltError::bad_request(format!(
                "key for {} is not an array",
                self.table
            ))),
        }
    }

    // ------------------------------------------------------------------
    // Conflict plumbing
    // ------------------------------------------------------------------

    /// Read the conflicting row back from the target.
    async fn read_target_row(
        &self,
        tx: &dyn TargetTx,
        schema: &TableSchema,
        mutation: &Mutation,
    ) -> Result<PropertyBag> {
        let pk_cols = schema.pk_columns();
        let components = self.key_components(mutation, pk_cols.len())?;
        let predicates: Vec<String> = pk_cols
            .iter()
            .enumerate()
            .map(|(idx, pk)| format!("{} = ${}", pk.name.quoted(), idx + 1))
            .collect();
        let sql = format!(
            "SELECT * FROM {} WHERE {}",
            self.table.quoted(),
            predicates.join(" AND ")
        );
        let rows = tx.query(&sql, &components).await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(PropertyBag::new());
        };
        let mut bag = PropertyBag::new();
        for (name, value) in row.columns {
            bag.put(Ident::new(name), value);
        }
        Ok(bag)
    }

    /// Route a failed mutation to the table's dead-letter queue, or fail
    /// the batch when none is configured.
    async fn dead_letter_or_fail(
        &self,
        mutation: &Mutation,
        err: SiltError,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        match &self.dlq_name {
            Some(queue) => {
                let queue = queue.clone();
                self.enqueue_dead_letter(&queue, mutation, &err.to_string(), stats)
                    .await
            }
            None => Err(err),
        }
    }

    async fn enqueue_dead_letter(
        &self,
        queue: &str,
        mutation: &Mutation,
        reason: &str,
        stats: &mut ApplyStats,
    ) -> Result<()> {
        let dlq = self.dlqs.get(queue)?;
        dlq.enqueue(DeadLetter {
            queue: queue.to_string(),
            table: self.table.clone(),
            time: mutation.time,
            key: mutation.key.clone(),
            before: mutation.before.clone(),
            proposed: mutation.data.clone(),
            error: reason.to_string(),
        })
        .await?;
        stats.dlqed += 1;
        Ok(())
    }
}

/// Parse a JSON value as a wall-clock timestamp: RFC 3339 text or epoch
/// seconds.
fn parse_timestamp(value: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match value {
        Value::String(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&chrono::Utc)),
        Value::Number(n) => {
            let secs = n.as_f64()?;
            chrono::DateTime::from_timestamp(secs as i64, 0)
        }
        _ => None,
    }
}

/// Factory handing out one [`Applier`] per target table, wired from the
/// user script's per-table configuration.
pub struct Appliers {
    watcher: Arc<SchemaWatcher>,
    script: Arc<UserScript>,
    dlqs: Arc<DlqSet>,
    cache: DashMap<Table, Arc<Applier>>,
}

impl Appliers {
    pub fn new(watcher: Arc<SchemaWatcher>, script: Arc<UserScript>, dlqs: Arc<DlqSet>) -> Self {
        Self {
            watcher,
            script,
            dlqs,
            cache: DashMap::new(),
        }
    }

    pub fn get(&self, table: &Table) -> Arc<Applier> {
        if let Some(entry) = self.cache.get(table) {
            return Arc::clone(entry.value());
        }
        let (cfg, merger, dlq_name) = match self.script.targets.get(table) {
            Some(target) => (
                target.apply.clone(),
                target.merger.clone(),
                target.dlq.clone(),
            ),
            None => (ApplyConfig::default(), None, None),
        };
        let applier = Arc::new(Applier::new(
            table.clone(),
            cfg,
            merger,
            dlq_name,
            Arc::clone(&self.dlqs),
            Arc::clone(&self.watcher),
        ));
        self.cache
            .entry(table.clone())
            .or_insert(applier)
            .value()
            .clone()
    }
}
