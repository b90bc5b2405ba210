//! Three-way conflict resolution.
//!
//! When a compare-and-set predicate fails, the apply engine builds a
//! [`Conflict`] from the mutation's previous state, the proposed row, and
//! the row currently stored in the target, then asks a [`Merger`] for a
//! [`Resolution`]: apply a replacement row, drop the mutation, or route it
//! to a dead-letter queue.

use async_trait::async_trait;
use serde_json::Value;
use silt_core::{Ident, IdentMap, Result, SiltError};
use std::sync::Arc;

/// An ordered bag of column values.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyBag {
    props: IdentMap<Value>,
}

impl PropertyBag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a bag from a JSON object. Non-objects produce an empty bag.
    pub fn from_object(value: &Value) -> Self {
        let mut bag = Self::new();
        if let Value::Object(obj) = value {
            for (k, v) in obj {
                bag.put(Ident::new(k.clone()), v.clone());
            }
        }
        bag
    }

    /// Convenience constructor from column/value pairs.
    pub fn of(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Self {
        let mut bag = Self::new();
        for (k, v) in pairs {
            bag.put(Ident::new(k), v);
        }
        bag
    }

    pub fn get(&self, column: &Ident) -> Option<&Value> {
        self.props.get(column)
    }

    pub fn put(&mut self, column: Ident, value: Value) -> Option<Value> {
        self.props.insert(column, value)
    }

    pub fn contains(&self, column: &Ident) -> bool {
        self.props.contains_key(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Ident, &Value)> {
        self.props.iter()
    }

    pub fn len(&self) -> usize {
        self.props.len()
    }

    pub fn is_empty(&self) -> bool {
        self.props.is_empty()
    }

    /// Render the bag back into a JSON object, preserving column order.
    pub fn to_object(&self) -> Value {
        let mut obj = serde_json::Map::new();
        for (col, value) in self.props.iter() {
            obj.insert(col.raw().to_string(), value.clone());
        }
        Value::Object(obj)
    }
}

/// A three-way conflict handed to a merger.
#[derive(Debug, Clone, Default)]
pub struct Conflict {
    /// The row state the mutation claims preceded it. Empty in a two-way
    /// merge.
    pub before: PropertyBag,
    /// The incoming row that failed to apply.
    pub proposed: PropertyBag,
    /// The conflicting row read from the target.
    pub target: PropertyBag,
    /// Populated by the standard merger before invoking its fallback:
    /// the columns it could not merge automatically.
    pub unmerged: Vec<Ident>,
}

/// Exactly one way out of a conflict.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Write this bag, unconditionally, into the target.
    Apply(PropertyBag),
    /// Discard the mutation.
    Drop,
    /// Send the mutation to the named dead-letter queue.
    Dlq(String),
}

/// Resolves conflicts for one target table.
#[async_trait]
pub trait Merger: Send + Sync {
    async fn merge(&self, conflict: &Conflict) -> Result<Resolution>;
}

/// Adapter for closure-backed mergers, as registered by user scripts.
pub struct FnMerger<F>(pub F);

#[async_trait]
impl<F> Merger for FnMerger<F>
where
    F: Fn(&Conflict) -> Result<Resolution> + Send + Sync,
{
    async fn merge(&self, conflict: &Conflict) -> Result<Resolution> {
        (self.0)(conflict)
    }
}

/// The default three-way merger.
///
/// A proposed column value is accepted when the claimed previous value
/// still matches the target (the classic lost-update check) or when the
/// proposed value already equals the target; properties the input left
/// unchanged keep the target's value. Anything else is unmergeable:
/// the fallback merger decides if one is present, otherwise the conflict
/// surfaces as [`SiltError::Conflict`] for the apply engine to dead-letter
/// or fail.
pub struct StandardMerger {
    fallback: Option<Arc<dyn Merger>>,
}

impl StandardMerger {
    pub fn new() -> Self {
        Self { fallback: None }
    }

    pub fn with_fallback(fallback: Arc<dyn Merger>) -> Self {
        Self {
            fallback: Some(fallback),
        }
    }
}

impl Default for StandardMerger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Merger for StandardMerger {
    async fn merge(&self, conflict: &Conflict) -> Result<Resolution> {
        let mut merged = conflict.target.clone();
        let mut unmerged = Vec::new();

        for (col, proposed) in conflict.proposed.iter() {
            let before = conflict.before.get(col);
            let target = conflict.target.get(col);
            if target == Some(proposed) {
                continue;
            }
            // A property the input did not change keeps the target's value.
            if before == Some(proposed) {
                continue;
            }
            if before == target {
                merged.put(col.clone(), proposed.clone());
                continue;
            }
            unmerged.push(col.clone());
        }

        if unmerged.is_empty() {
            return Ok(Resolution::Apply(merged));
        }

        if let Some(fallback) = &self.fallback {
            let mut escalated = conflict.clone();
            escalated.unmerged = unmerged;
            return fallback.merge(&escalated).await;
        }

        Err(SiltError::conflict(format!(
            "unmergeable columns: {}",
            unmerged
                .iter()
                .map(|c| c.raw().to_string())
                .collect::<Vec<_>>()
                .join(", ")
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn conflict(before: Value, proposed: Value, target: Value) -> Conflict {
        Conflict {
            before: PropertyBag::from_object(&before),
            proposed: PropertyBag::from_object(&proposed),
            target: PropertyBag::from_object(&target),
            unmerged: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_standard_merge_accepts_lost_update() {
        // before == target, so the proposed change simply lost a race it
        // would have won; take it.
        let c = conflict(json!({"val": 1}), json!({"val": 3}), json!({"val": 1}));
        let res = StandardMerger::new().merge(&c).await.unwrap();
        match res {
            Resolution::Apply(bag) => assert_eq!(bag.get(&Ident::new("val")), Some(&json!(3))),
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_standard_merge_noop_when_target_matches() {
        let c = conflict(json!({"val": 1}), json!({"val": 3}), json!({"val": 3}));
        let res = StandardMerger::new().merge(&c).await.unwrap();
        match res {
            Resolution::Apply(bag) => assert_eq!(bag.get(&Ident::new("val")), Some(&json!(3))),
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_standard_merge_unmergeable_without_fallback() {
        // Target moved past both before and proposed.
        let c = conflict(json!({"val": 1}), json!({"val": 3}), json!({"val": 40}));
        let err = StandardMerger::new().merge(&c).await.unwrap_err();
        assert!(matches!(err, SiltError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_standard_merge_escalates_to_fallback() {
        let fallback = Arc::new(FnMerger(|c: &Conflict| {
            assert_eq!(c.unmerged, vec![Ident::new("val")]);
            Ok(Resolution::Dlq("dead".to_string()))
        }));
        let merger = StandardMerger::with_fallback(fallback);

        let c = conflict(json!({"val": 1}), json!({"val": 3}), json!({"val": 40}));
        let res = merger.merge(&c).await.unwrap();
        assert_eq!(res, Resolution::Dlq("dead".to_string()));
    }

    #[tokio::test]
    async fn test_standard_merge_merges_disjoint_columns() {
        let c = conflict(
            json!({"a": 1, "b": 10}),
            json!({"a": 2, "b": 10}),
            json!({"a": 1, "b": 99}),
        );
        // Column a merges (before == target); column b is untouched in the
        // proposal, so the target's concurrent write survives.
        let res = StandardMerger::new().merge(&c).await.unwrap();
        match res {
            Resolution::Apply(bag) => {
                assert_eq!(bag.get(&Ident::new("a")), Some(&json!(2)));
                assert_eq!(bag.get(&Ident::new("b")), Some(&json!(99)));
            }
            other => panic!("expected apply, got {other:?}"),
        }
    }

    #[test]
    fn test_property_bag_round_trip() {
        let bag = PropertyBag::from_object(&json!({"x": 1, "y": "two"}));
        assert_eq!(bag.len(), 2);
        assert_eq!(bag.to_object(), json!({"x": 1, "y": "two"}));
    }

    #[test]
    fn test_property_bag_case_insensitive() {
        let bag = PropertyBag::from_object(&json!({"Val": 7}));
        assert_eq!(bag.get(&Ident::new("val")), Some(&json!(7)));
    }
}
