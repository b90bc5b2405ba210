//! A single row-level change from the upstream changefeed.

use crate::hlc::Hlc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// One row-level change: the primary key, the new row data, optionally the
/// previous row state, and the source commit timestamp.
///
/// Payloads are kept as decoded JSON so that dispatch and mapping callbacks
/// can operate on them directly; the decoder runs with arbitrary-precision
/// numbers enabled, so large integers survive a stage/drain round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
    /// JSON array of primary-key components. Always present.
    pub key: Value,
    /// JSON object of the new row. Empty or null means delete.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// JSON object of the previous row, when the source provides it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    /// Source commit timestamp.
    pub time: Hlc,
    /// Source name, routing hints, and other free-form metadata.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub meta: HashMap<String, Value>,
}

impl Mutation {
    /// Create an upsert mutation.
    pub fn insert(key: Value, data: Value, time: Hlc) -> Self {
        Self {
            key,
            data: Some(data),
            before: None,
            time,
            meta: HashMap::new(),
        }
    }

    /// Create a delete mutation.
    pub fn delete(key: Value, time: Hlc) -> Self {
        Self {
            key,
            data: None,
            before: None,
            time,
            meta: HashMap::new(),
        }
    }

    /// Attach the previous row state.
    pub fn with_before(mut self, before: Value) -> Self {
        self.before = Some(before);
        self
    }

    /// Attach a metadata entry.
    pub fn with_meta(mut self, key: impl Into<String>, value: Value) -> Self {
        self.meta.insert(key.into(), value);
        self
    }

    /// A mutation with no new row data is a deletion.
    pub fn is_delete(&self) -> bool {
        match &self.data {
            None => true,
            Some(Value::Null) => true,
            Some(Value::Object(obj)) => obj.is_empty(),
            Some(_) => false,
        }
    }

    /// Canonical JSON text of the key, used for staging-table keys and for
    /// breaking HLC ties deterministically.
    pub fn key_text(&self) -> String {
        self.key.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_insert_is_not_delete() {
        let mut_ = Mutation::insert(json!([1]), json!({"id": 1, "name": "a"}), Hlc::new(10, 0));
        assert!(!mut_.is_delete());
    }

    #[test]
    fn test_delete_detection() {
        assert!(Mutation::delete(json!([1]), Hlc::new(10, 0)).is_delete());
        assert!(Mutation::insert(json!([1]), Value::Null, Hlc::new(10, 0)).is_delete());
        assert!(Mutation::insert(json!([1]), json!({}), Hlc::new(10, 0)).is_delete());
    }

    #[test]
    fn test_key_text_is_canonical() {
        let mut_ = Mutation::insert(json!([1, "two"]), json!({}), Hlc::ZERO);
        assert_eq!(mut_.key_text(), r#"[1,"two"]"#);
    }

    #[test]
    fn test_before_and_meta_builders() {
        let mut_ = Mutation::insert(json!([true]), json!({"msg": true}), Hlc::new(1, 0))
            .with_before(json!({"before": true}))
            .with_meta("source", json!("expander"));

        assert_eq!(mut_.before, Some(json!({"before": true})));
        assert_eq!(mut_.meta.get("source"), Some(&json!("expander")));
    }

    #[test]
    fn test_serde_round_trip() {
        let mut_ = Mutation::insert(json!([7]), json!({"n": 7}), Hlc::new(20, 3))
            .with_before(json!({"n": 6}));

        let encoded = serde_json::to_string(&mut_).unwrap();
        let back: Mutation = serde_json::from_str(&encoded).unwrap();
        assert_eq!(back, mut_);
    }

    #[test]
    fn test_serde_preserves_large_integers() {
        // Beyond f64's 53-bit mantissa; must survive a round trip intact.
        let raw = r#"{"key":[9007199254740993],"data":{"big":18446744073709551617},"time":"1.0000000000"}"#;
        let mut_: Mutation = serde_json::from_str(raw).unwrap();
        let encoded = serde_json::to_string(&mut_).unwrap();
        assert!(encoded.contains("9007199254740993"));
        assert!(encoded.contains("18446744073709551617"));
    }
}
