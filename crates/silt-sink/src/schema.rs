//! Target schema snapshots.
//!
//! The apply engine resolves target columns against a cached snapshot of
//! the target schema. A single writer refreshes the snapshot; readers grab
//! an `Arc` under a brief lock and never block on a refresh in progress.

use parking_lot::RwLock;
#[cfg(feature = "postgres")]
use silt_core::{Result, Schema, SiltError};
use silt_core::{Ident, Table, TableMap};
use std::sync::Arc;
use tokio::sync::watch;
#[cfg(feature = "postgres")]
use tracing::debug;

/// One column of a target table.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMeta {
    pub name: Ident,
    /// Position within the primary key, if the column is part of it.
    pub pk_position: Option<usize>,
    /// Target data type, as reported by the catalog.
    pub data_type: String,
}

impl ColumnMeta {
    pub fn is_primary_key(&self) -> bool {
        self.pk_position.is_some()
    }
}

/// The column layout of one target table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TableSchema {
    columns: Vec<ColumnMeta>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnMeta>) -> Self {
        Self { columns }
    }

    /// All columns, in catalog order.
    pub fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    /// Primary-key columns, in key-index order.
    pub fn pk_columns(&self) -> Vec<&ColumnMeta> {
        let mut pks: Vec<&ColumnMeta> = self
            .columns
            .iter()
            .filter(|c| c.is_primary_key())
            .collect();
        pks.sort_by_key(|c| c.pk_position);
        pks
    }

    pub fn column(&self, name: &Ident) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| &c.name == name)
    }
}

/// A point-in-time view of every known target table.
pub type SchemaSnapshot = Arc<TableMap<TableSchema>>;

/// Cache of the target schema with non-blocking readers.
pub struct SchemaWatcher {
    snapshot: RwLock<SchemaSnapshot>,
    refreshed: watch::Sender<u64>,
}

impl SchemaWatcher {
    pub fn new() -> Self {
        let (refreshed, _) = watch::channel(0);
        Self {
            snapshot: RwLock::new(Arc::new(TableMap::new())),
            refreshed,
        }
    }

    /// The current snapshot. Cheap; never blocks on a refresh.
    pub fn snapshot(&self) -> SchemaSnapshot {
        Arc::clone(&self.snapshot.read())
    }

    /// The schema for one table, if known.
    pub fn get(&self, table: &Table) -> Option<TableSchema> {
        self.snapshot().get(table).cloned()
    }

    /// Install a snapshot directly. Used by fixtures and by sources that
    /// learn the schema out of band.
    pub fn seed(&self, tables: TableMap<TableSchema>) {
        *self.snapshot.write() = Arc::new(tables);
        self.refreshed.send_modify(|gen| *gen += 1);
    }

    /// A receiver signalled after every snapshot replacement.
    pub fn watch(&self) -> watch::Receiver<u64> {
        self.refreshed.subscribe()
    }

    /// Re-read the catalog for `schema` and swap the snapshot.
    #[cfg(feature = "postgres")]
    pub async fn refresh(
        &self,
        conn: &dyn crate::target::TargetConn,
        schema: &Schema,
    ) -> Result<()> {
        let tables = load_schema(conn, schema).await?;
        debug!(schema = %schema, tables = tables.len(), "schema snapshot refreshed");
        self.seed(tables);
        Ok(())
    }
}

impl Default for SchemaWatcher {
    fn default() -> Self {
        Self::new()
    }
}

/// Query `information_schema` for every table in the given schema.
#[cfg(feature = "postgres")]
async fn load_schema(
    conn: &dyn crate::target::TargetConn,
    schema: &Schema,
) -> Result<TableMap<TableSchema>> {
    use serde_json::json;

    let rows = conn
        .query(
            "SELECT c.table_name,
                    c.column_name,
                    c.data_type,
                    k.ordinal_position
             FROM information_schema.columns c
             LEFT JOIN information_schema.key_column_usage k
               ON k.table_schema = c.table_schema
              AND k.table_name = c.table_name
              AND k.column_name = c.column_name
              AND k.constraint_name IN (
                  SELECT constraint_name
                  FROM information_schema.table_constraints
                  WHERE table_schema = c.table_schema
                    AND constraint_type = 'PRIMARY KEY'
              )
             WHERE c.table_schema = $1
             ORDER BY c.table_name, c.ordinal_position",
            &[json!(schema.raw())],
        )
        .await?;

    let mut tables: TableMap<TableSchema> = TableMap::new();
    let mut current: Option<(Table, Vec<ColumnMeta>)> = None;

    for row in rows {
        let table_name = row
            .get("table_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SiltError::fatal("catalog row missing table_name"))?
            .to_string();
        let column_name = row
            .get("column_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| SiltError::fatal("catalog row missing column_name"))?
            .to_string();
        let data_type = row
            .get("data_type")
            .and_then(|v| v.as_str())
            .unwrap_or("text")
            .to_string();
        let pk_position = row
            .get("ordinal_position")
            .and_then(|v| v.as_i64())
            .map(|p| p as usize);

        let table = Table::new(schema.clone(), table_name);
        match &mut current {
            Some((open, columns)) if *open == table => {
                columns.push(ColumnMeta {
                    name: Ident::new(column_name),
                    pk_position,
                    data_type,
                });
            }
            _ => {
                if let Some((done, columns)) = current.take() {
                    tables.insert(done, TableSchema::new(columns));
                }
                current = Some((
                    table,
                    vec![ColumnMeta {
                        name: Ident::new(column_name),
                        pk_position,
                        data_type,
                    }],
                ));
            }
        }
    }
    if let Some((done, columns)) = current.take() {
        tables.insert(done, TableSchema::new(columns));
    }

    Ok(tables)
}

/// Build a [`TableSchema`] from `(name, is_pk)` pairs. Fixture helper: the
/// pk flag order defines the key index.
pub fn columns(cols: &[(&str, bool)]) -> TableSchema {
    let mut pk_idx = 0;
    let columns = cols
        .iter()
        .map(|(name, is_pk)| {
            let pk_position = if *is_pk {
                pk_idx += 1;
                Some(pk_idx)
            } else {
                None
            };
            ColumnMeta {
                name: Ident::new(*name),
                pk_position,
                data_type: "text".to_string(),
            }
        })
        .collect();
    TableSchema::new(columns)
}

#[cfg(test)]
mod tests {
    use super::*;
    use silt_core::Schema;

    #[test]
    fn test_pk_columns_in_key_order() {
        let schema = TableSchema::new(vec![
            ColumnMeta {
                name: Ident::new("val"),
                pk_position: None,
                data_type: "text".into(),
            },
            ColumnMeta {
                name: Ident::new("id2"),
                pk_position: Some(2),
                data_type: "int8".into(),
            },
            ColumnMeta {
                name: Ident::new("id1"),
                pk_position: Some(1),
                data_type: "int8".into(),
            },
        ]);

        let pks: Vec<&str> = schema.pk_columns().iter().map(|c| c.name.raw()).collect();
        assert_eq!(pks, vec!["id1", "id2"]);
    }

    #[test]
    fn test_column_lookup_is_case_insensitive() {
        let schema = columns(&[("Id", true), ("Name", false)]);
        assert!(schema.column(&Ident::new("id")).is_some());
        assert!(schema.column(&Ident::new("NAME")).is_some());
        assert!(schema.column(&Ident::new("other")).is_none());
    }

    #[test]
    fn test_watcher_seed_and_snapshot() {
        let watcher = SchemaWatcher::new();
        let table = Table::new(Schema::new("public"), "users");

        assert!(watcher.get(&table).is_none());

        let mut tables = TableMap::new();
        tables.insert(table.clone(), columns(&[("id", true), ("name", false)]));
        watcher.seed(tables);

        let got = watcher.get(&table).unwrap();
        assert_eq!(got.columns().len(), 2);
    }

    #[tokio::test]
    async fn test_watcher_signals_refresh() {
        let watcher = SchemaWatcher::new();
        let mut rx = watcher.watch();
        let gen_before = *rx.borrow();

        watcher.seed(TableMap::new());

        rx.changed().await.unwrap();
        assert!(*rx.borrow() > gen_before);
    }
}
