//! Test doubles for the target database seam.
//!
//! [`RecordingConn`] captures every statement with its parameters and
//! replays scripted results, so SQL translation and pipeline behavior can
//! be asserted without a live database.

use crate::target::{SqlRow, TargetConn, TargetTx};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use silt_core::{Result, SiltError};
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    statements: Mutex<Vec<(String, Vec<Value>)>>,
    queries: Mutex<Vec<(String, Vec<Value>)>>,
    events: Mutex<Vec<String>>,
    execute_results: Mutex<VecDeque<u64>>,
    query_results: Mutex<VecDeque<Vec<SqlRow>>>,
    failures: Mutex<u32>,
}

impl Inner {
    fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SiltError::transient("scripted failure"));
            }
        }
        self.statements
            .lock()
            .push((sql.to_string(), params.to_vec()));
        Ok(self.execute_results.lock().pop_front().unwrap_or(1))
    }

    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        self.queries.lock().push((sql.to_string(), params.to_vec()));
        Ok(self.query_results.lock().pop_front().unwrap_or_default())
    }
}

/// A target connection that records statements and replays scripted
/// results.
#[derive(Clone, Default)]
pub struct RecordingConn {
    inner: Arc<Inner>,
}

impl RecordingConn {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every executed statement with its parameters, in order.
    pub fn statements(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.statements.lock().clone()
    }

    /// Every query with its parameters, in order.
    pub fn queries(&self) -> Vec<(String, Vec<Value>)> {
        self.inner.queries.lock().clone()
    }

    /// Transaction lifecycle markers: `begin`, `commit`, `rollback`.
    pub fn events(&self) -> Vec<String> {
        self.inner.events.lock().clone()
    }

    /// Queue the affected-row count for the next execute. Unqueued
    /// executes report one affected row.
    pub fn push_execute_result(&self, affected: u64) {
        self.inner.execute_results.lock().push_back(affected);
    }

    /// Queue the rows for the next query. Unqueued queries return no rows.
    pub fn push_query_result(&self, rows: Vec<SqlRow>) {
        self.inner.query_results.lock().push_back(rows);
    }

    /// Fail the next `n` executes with a transient error.
    pub fn fail_next_executes(&self, n: u32) {
        *self.inner.failures.lock() = n;
    }

    pub fn clear(&self) {
        self.inner.statements.lock().clear();
        self.inner.queries.lock().clear();
        self.inner.events.lock().clear();
    }
}

#[async_trait]
impl TargetConn for RecordingConn {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute(sql, params)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        self.inner.query(sql, params)
    }

    async fn begin(&self) -> Result<Box<dyn TargetTx>> {
        self.inner.events.lock().push("begin".to_string());
        Ok(Box::new(RecordingTx {
            inner: Arc::clone(&self.inner),
        }))
    }
}

struct RecordingTx {
    inner: Arc<Inner>,
}

#[async_trait]
impl TargetTx for RecordingTx {
    async fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.inner.execute(sql, params)
    }

    async fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<SqlRow>> {
        self.inner.query(sql, params)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.inner.events.lock().push("commit".to_string());
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.inner.events.lock().push("rollback".to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_recording_and_replay() {
        let conn = RecordingConn::new();
        conn.push_execute_result(0);

        assert_eq!(conn.execute("DELETE", &[json!(1)]).await.unwrap(), 0);
        assert_eq!(conn.execute("INSERT", &[]).await.unwrap(), 1);

        let recorded = conn.statements();
        assert_eq!(recorded.len(), 2);
        assert_eq!(recorded[0].0, "DELETE");
        assert_eq!(recorded[0].1, vec![json!(1)]);
    }

    #[tokio::test]
    async fn test_transaction_events() {
        let conn = RecordingConn::new();
        let tx = conn.begin().await.unwrap();
        tx.execute("UPDATE", &[]).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(conn.events(), vec!["begin", "commit"]);
    }

    #[tokio::test]
    async fn test_scripted_failures() {
        let conn = RecordingConn::new();
        conn.fail_next_executes(1);

        assert!(conn.execute("X", &[]).await.is_err());
        assert!(conn.execute("X", &[]).await.is_ok());
    }
}
