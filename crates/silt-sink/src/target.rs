//! Target database seam.
//!
//! The apply engine speaks to the target through a pair of narrow traits so
//! the SQL translation layer stays independent of the driver. Parameters
//! travel as JSON values: the changefeed delivers JSON, and the driver
//! binding is the single place where values take on SQL types.

use async_trait::async_trait;
use serde_json::Value;
use silt_core::Result;

/// A row read back from the target, as ordered column/value pairs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRow {
    pub columns: Vec<(String, Value)>,
}

impl SqlRow {
    pub fn new(columns: Vec<(String, Value)>) -> Self {
        Self { columns }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case(column))
            .map(|(_, value)| value)
    }
}

/// A connection to the target database.
#[async_trait]
pub trait TargetConn: Send + Sync {
    /// Execute a statement, returning the affected row count.
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    /// Execute a query, returning all rows.
    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>>;

    /// Begin a transaction.
    async fn begin(&self) -> Result<Box<dyn TargetTx>>;
}

/// A transaction on the target database.
///
/// Statement execution takes `&self`; implementations serialize internally,
/// matching the single underlying connection.
#[async_trait]
pub trait TargetTx: Send + Sync {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>>;

    async fn commit(self: Box<Self>) -> Result<()>;

    async fn rollback(self: Box<Self>) -> Result<()>;
}

#[cfg(feature = "postgres")]
pub use pg::PgConn;

#[cfg(feature = "postgres")]
mod pg {
    use super::{SqlRow, TargetConn, TargetTx};
    use async_trait::async_trait;
    use serde_json::Value;
    use silt_core::Result;
    use std::sync::Arc;
    use tokio::sync::Mutex;
    use tokio_postgres::types::ToSql;
    use tokio_postgres::Client;

    /// [`TargetConn`] over a `tokio_postgres` client.
    ///
    /// Transactions are driven with explicit `BEGIN`/`COMMIT` so the
    /// transaction handle can be a `'static` trait object; the client is
    /// mutex-guarded because a connection can only run one statement at a
    /// time.
    pub struct PgConn {
        client: Arc<Mutex<Client>>,
    }

    impl PgConn {
        pub fn new(client: Client) -> Self {
            Self {
                client: Arc::new(Mutex::new(client)),
            }
        }
    }

    /// Bind JSON parameter values to their natural SQL types. Objects and
    /// arrays bind as JSONB; numbers prefer BIGINT, then DOUBLE PRECISION,
    /// then their literal text for arbitrary precision.
    fn bind(params: &[Value]) -> Vec<Box<dyn ToSql + Sync + Send>> {
        params
            .iter()
            .map(|v| -> Box<dyn ToSql + Sync + Send> {
                match v {
                    Value::Null => Box::new(Option::<String>::None),
                    Value::Bool(b) => Box::new(*b),
                    Value::Number(n) => {
                        if let Some(i) = n.as_i64() {
                            Box::new(i)
                        } else if let Some(f) = n.as_f64() {
                            Box::new(f)
                        } else {
                            Box::new(n.to_string())
                        }
                    }
                    Value::String(s) => Box::new(s.clone()),
                    Value::Array(_) | Value::Object(_) => Box::new(v.clone()),
                }
            })
            .collect()
    }

    /// Decode one column into a JSON value, trying the common SQL types
    /// in turn. JSONB columns decode directly; scalars promote to their
    /// JSON equivalents.
    fn column_to_value(row: &tokio_postgres::Row, idx: usize) -> Value {
        if let Ok(v) = row.try_get::<_, Option<Value>>(idx) {
            return v.unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<String>>(idx) {
            return v.map(Value::String).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i64>>(idx) {
            return v.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<i32>>(idx) {
            return v.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<f64>>(idx) {
            return v.map(Value::from).unwrap_or(Value::Null);
        }
        if let Ok(v) = row.try_get::<_, Option<bool>>(idx) {
            return v.map(Value::Bool).unwrap_or(Value::Null);
        }
        Value::Null
    }

    fn row_to_sql_row(row: &tokio_postgres::Row) -> SqlRow {
        let columns = row
            .columns()
            .iter()
            .enumerate()
            .map(|(idx, col)| (col.name().to_string(), column_to_value(row, idx)))
            .collect();
        SqlRow::new(columns)
    }

    #[async_trait]
    impl TargetConn for PgConn {
        async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            let bound = bind(params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            let client = self.client.lock().await;
            Ok(client.execute(sql, &refs).await?)
        }

        async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
            let bound = bind(params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            let client = self.client.lock().await;
            let rows = client.query(sql, &refs).await?;
            Ok(rows.iter().map(row_to_sql_row).collect())
        }

        async fn begin(&self) -> Result<Box<dyn TargetTx>> {
            {
                let client = self.client.lock().await;
                client.batch_execute("BEGIN").await?;
            }
            Ok(Box::new(PgTx {
                client: Arc::clone(&self.client),
                open: true,
            }))
        }
    }

    struct PgTx {
        client: Arc<Mutex<Client>>,
        open: bool,
    }

    #[async_trait]
    impl TargetTx for PgTx {
        async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
            let bound = bind(params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            let client = self.client.lock().await;
            Ok(client.execute(sql, &refs).await?)
        }

        async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
            let bound = bind(params);
            let refs: Vec<&(dyn ToSql + Sync)> =
                bound.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect();
            let client = self.client.lock().await;
            let rows = client.query(sql, &refs).await?;
            Ok(rows.iter().map(row_to_sql_row).collect())
        }

        async fn commit(mut self: Box<Self>) -> Result<()> {
            self.open = false;
            let client = self.client.lock().await;
            client.batch_execute("COMMIT").await?;
            Ok(())
        }

        async fn rollback(mut self: Box<Self>) -> Result<()> {
            self.open = false;
            let client = self.client.lock().await;
            client.batch_execute("ROLLBACK").await?;
            Ok(())
        }
    }

    impl Drop for PgTx {
        fn drop(&mut self) {
            if self.open {
                // The connection still holds an open transaction; the next
                // BEGIN would fail. Roll back without awaiting.
                let client = Arc::clone(&self.client);
                tokio::spawn(async move {
                    let client = client.lock().await;
                    let _ = client.batch_execute("ROLLBACK").await;
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sql_row_lookup_is_case_insensitive() {
        let row = SqlRow::new(vec![
            ("Id".to_string(), json!(1)),
            ("name".to_string(), json!("a")),
        ]);
        assert_eq!(row.get("id"), Some(&json!(1)));
        assert_eq!(row.get("NAME"), Some(&json!("a")));
        assert_eq!(row.get("missing"), None);
    }
}
