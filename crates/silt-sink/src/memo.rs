//! Durable consistent-point memos.
//!
//! Each resolver loop records the last HLC it fully applied under the key
//! `consistent_point:<source>:<schema>`. Reads resume after the committed
//! point; writes happen only from the owning loop, and only after a
//! successful apply transaction.

use async_trait::async_trait;
use parking_lot::Mutex;
use silt_core::{Hlc, Ident, Result, Schema, SiltError};
use std::collections::HashMap;

/// Memo key for one (source, target-schema) loop.
pub fn memo_key(source: &Ident, schema: &Schema) -> String {
    format!("consistent_point:{}:{}", source.folded(), schema.raw().to_lowercase())
}

/// Durable key/value memo store.
#[async_trait]
pub trait Memo: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Hlc>>;

    /// Store a consistent point. Monotonicity is enforced here: writing a
    /// value below the stored one is an invariant violation.
    async fn put(&self, key: &str, value: Hlc) -> Result<()>;
}

/// In-memory memo for tests and single-process runs.
#[derive(Default)]
pub struct MemoryMemo {
    points: Mutex<HashMap<String, Hlc>>,
}

impl MemoryMemo {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Memo for MemoryMemo {
    async fn get(&self, key: &str) -> Result<Option<Hlc>> {
        Ok(self.points.lock().get(key).copied())
    }

    async fn put(&self, key: &str, value: Hlc) -> Result<()> {
        let mut points = self.points.lock();
        if let Some(existing) = points.get(key) {
            if value < *existing {
                return Err(SiltError::fatal(format!(
                    "consistent point for {key} would regress: {existing} -> {value}"
                )));
            }
        }
        points.insert(key.to_string(), value);
        Ok(())
    }
}

#[cfg(feature = "postgres")]
pub use pg::PgMemo;

#[cfg(feature = "postgres")]
mod pg {
    use super::Memo;
    use crate::target::TargetConn;
    use async_trait::async_trait;
    use serde_json::json;
    use silt_core::{Hlc, Result, SiltError};
    use std::sync::Arc;
    use tokio::sync::OnceCell;

    /// Memo store backed by `_silt.memo (key TEXT PRIMARY KEY, value TEXT)`.
    pub struct PgMemo {
        conn: Arc<dyn TargetConn>,
        ready: OnceCell<()>,
    }

    impl PgMemo {
        pub fn new(conn: Arc<dyn TargetConn>) -> Self {
            Self {
                conn,
                ready: OnceCell::new(),
            }
        }

        async fn ensure_table(&self) -> Result<()> {
            self.ready
                .get_or_try_init(|| async {
                    self.conn
                        .execute(
                            "CREATE TABLE IF NOT EXISTS \"_silt\".\"memo\" (
                                key TEXT PRIMARY KEY,
                                value TEXT NOT NULL
                            )",
                            &[],
                        )
                        .await
                        .map(|_| ())
                })
                .await
                .copied()
        }
    }

    #[async_trait]
    impl Memo for PgMemo {
        async fn get(&self, key: &str) -> Result<Option<Hlc>> {
            self.ensure_table().await?;
            let rows = self
                .conn
                .query(
                    "SELECT value FROM \"_silt\".\"memo\" WHERE key = $1",
                    &[json!(key)],
                )
                .await?;
            match rows.first().and_then(|row| row.get("value")) {
                Some(value) => {
                    let text = value
                        .as_str()
                        .ok_or_else(|| SiltError::fatal("memo value is not text"))?;
                    Ok(Some(Hlc::parse(text)?))
                }
                None => Ok(None),
            }
        }

        async fn put(&self, key: &str, value: Hlc) -> Result<()> {
            self.ensure_table().await?;
            // The WHERE clause makes regression a silent no-op at the SQL
            // level; the loop owning this key never goes backwards anyway.
            self.conn
                .execute(
                    "INSERT INTO \"_silt\".\"memo\" (key, value) VALUES ($1, $2)
                     ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
                     WHERE \"_silt\".\"memo\".value < EXCLUDED.value",
                    &[json!(key), json!(value.to_string())],
                )
                .await?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memo_key_format() {
        let key = memo_key(&Ident::new("MySource"), &Schema::new("Public"));
        assert_eq!(key, "consistent_point:mysource:public");
    }

    #[tokio::test]
    async fn test_memory_memo_round_trip() {
        let memo = MemoryMemo::new();
        assert_eq!(memo.get("k").await.unwrap(), None);

        memo.put("k", Hlc::new(10, 0)).await.unwrap();
        assert_eq!(memo.get("k").await.unwrap(), Some(Hlc::new(10, 0)));

        memo.put("k", Hlc::new(25, 0)).await.unwrap();
        assert_eq!(memo.get("k").await.unwrap(), Some(Hlc::new(25, 0)));
    }

    #[tokio::test]
    async fn test_memory_memo_rejects_regression() {
        let memo = MemoryMemo::new();
        memo.put("k", Hlc::new(30, 0)).await.unwrap();

        let err = memo.put("k", Hlc::new(10, 0)).await.unwrap_err();
        assert!(matches!(err, SiltError::Fatal(_)));
        assert_eq!(memo.get("k").await.unwrap(), Some(Hlc::new(30, 0)));
    }

    #[tokio::test]
    async fn test_memory_memo_idempotent_put() {
        let memo = MemoryMemo::new();
        memo.put("k", Hlc::new(10, 0)).await.unwrap();
        memo.put("k", Hlc::new(10, 0)).await.unwrap();
        assert_eq!(memo.get("k").await.unwrap(), Some(Hlc::new(10, 0)));
    }
}
