//! End-to-end coverage of the user-script surface: source dispatch,
//! per-target mapping, and merge behavior, registered the way a loaded
//! user script would register them.

use serde_json::{json, Value};
use silt_sink::applycfg::{parse_duration, ApplyConfig};
use silt_sink::merge::{Conflict, FnMerger, PropertyBag, Resolution, StandardMerger};
use silt_sink::script::{
    dispatch_fn, map_fn, ScriptBuilder, SourceConfig, TableRouting, TargetConfig, UserScript,
};
use silt_sink::{Hlc, Ident, Mutation, Schema, Table};
use std::sync::Arc;

fn table(name: &str) -> Table {
    Table::new(Schema::new("public"), name)
}

/// Build the reference script: three sources and five targets covering
/// every callback shape.
fn reference_script() -> UserScript {
    let mut all_features_cfg = ApplyConfig::new();
    all_features_cfg.cas = vec![Ident::new("cas0"), Ident::new("cas1")];
    all_features_cfg
        .deadlines
        .insert(Ident::new("dl0"), parse_duration("1h").unwrap());
    all_features_cfg
        .deadlines
        .insert(Ident::new("dl1"), parse_duration("1m").unwrap());
    all_features_cfg
        .exprs
        .insert(Ident::new("expr0"), "fnv32($0::BYTES)".to_string());
    all_features_cfg
        .exprs
        .insert(Ident::new("expr1"), "Hello Library!".to_string());
    all_features_cfg.extras = Some(Ident::new("overflow_column"));
    all_features_cfg.set_ignore(Ident::new("ign0"), true);
    all_features_cfg.set_ignore(Ident::new("ign1"), true);
    // The false value is dropped.
    all_features_cfg.set_ignore(Ident::new("ign2"), false);

    ScriptBuilder::new()
        .set_option("hello", "world")
        .configure_source(
            "expander",
            SourceConfig::new()
                .with_deletes_to(table("table1"))
                .with_dispatch(dispatch_fn(|mutation: Mutation| async move {
                    let msg = mutation
                        .data
                        .as_ref()
                        .and_then(|d| d.get("msg"))
                        .cloned()
                        .unwrap_or(Value::Null);

                    let mut routing = TableRouting::new();
                    let mut to_t1 =
                        Mutation::insert(json!([true]), json!({"dest": "table1", "msg": msg}), mutation.time);
                    to_t1.before = mutation.before.clone();
                    routing.insert(table("table1"), vec![to_t1]);

                    let mut to_t2 = Vec::new();
                    for idx in 0..2 {
                        let mut m = Mutation::insert(
                            json!([idx]),
                            json!({"dest": "table2", "idx": idx, "msg": msg}),
                            mutation.time,
                        );
                        m.before = mutation.before.clone();
                        to_t2.push(m);
                    }
                    routing.insert(table("table2"), to_t2);
                    Ok(routing)
                })),
        )
        .configure_source("passthrough", SourceConfig::passthrough(table("some_table")))
        .configure_source(
            "recursive",
            SourceConfig::passthrough(table("some_table")).with_recurse(true),
        )
        .configure_table(
            table("all_features"),
            TargetConfig::new()
                .with_apply(all_features_cfg)
                .with_map(map_fn(|mut mutation: Mutation| async move {
                    if let Some(Value::Object(obj)) = mutation.data.as_mut() {
                        obj.insert("msg".to_string(), json!("Hello World!"));
                        obj.insert("num".to_string(), json!(42));
                    }
                    Ok(Some(mutation))
                }))
                .with_merger(Arc::new(FnMerger(|_: &Conflict| {
                    let mut bag = PropertyBag::new();
                    bag.put(Ident::new("val"), json!(42));
                    Ok(Resolution::Apply(bag))
                }))),
        )
        .configure_table(
            table("drop_all"),
            TargetConfig::new().with_map(map_fn(|_: Mutation| async move { Ok(None) })),
        )
        .configure_table(
            table("merge_dlq_all"),
            TargetConfig::new().with_merger(Arc::new(FnMerger(|_: &Conflict| {
                Ok(Resolution::Dlq("dead".to_string()))
            }))),
        )
        .configure_table(
            table("merge_drop_all"),
            TargetConfig::new()
                .with_merger(Arc::new(FnMerger(|_: &Conflict| Ok(Resolution::Drop)))),
        )
        .configure_table(
            table("merge_or_dlq"),
            TargetConfig::new().with_merger(Arc::new(StandardMerger::with_fallback(Arc::new(
                FnMerger(|_: &Conflict| Ok(Resolution::Dlq("dead".to_string()))),
            )))),
        )
        .build()
        .unwrap()
}

fn conflict(before: Value, proposed: Value, target: Value) -> Conflict {
    Conflict {
        before: PropertyBag::from_object(&before),
        proposed: PropertyBag::from_object(&proposed),
        target: PropertyBag::from_object(&target),
        unmerged: Vec::new(),
    }
}

#[test]
fn script_registers_all_sources_and_targets() {
    let script = reference_script();
    assert_eq!(script.sources.len(), 3);
    assert_eq!(script.targets.len(), 5);
    assert_eq!(script.options.get("hello"), Some(&"world".to_string()));
}

#[tokio::test]
async fn expander_dispatch_fans_out() {
    let script = reference_script();
    let cfg = script.sources.get(&Ident::new("expander")).unwrap();
    assert_eq!(cfg.deletes_to, Some(table("table1")));

    let mutation = Mutation::insert(json!([true]), json!({"msg": true}), Hlc::new(1, 0))
        .with_before(json!({"before": true}));
    let routing = (cfg.dispatch.as_ref().unwrap())(mutation).await.unwrap();

    let to_t1 = routing.get(&table("table1")).unwrap();
    assert_eq!(to_t1.len(), 1);
    assert_eq!(to_t1[0].before, Some(json!({"before": true})));
    assert_eq!(to_t1[0].data, Some(json!({"dest": "table1", "msg": true})));
    assert_eq!(to_t1[0].key, json!([true]));

    let to_t2 = routing.get(&table("table2")).unwrap();
    assert_eq!(to_t2.len(), 2);
    assert_eq!(to_t2[0].before, Some(json!({"before": true})));
    assert_eq!(
        to_t2[0].data,
        Some(json!({"dest": "table2", "idx": 0, "msg": true}))
    );
    assert_eq!(to_t2[0].key, json!([0]));
    assert_eq!(
        to_t2[1].data,
        Some(json!({"dest": "table2", "idx": 1, "msg": true}))
    );
    assert_eq!(to_t2[1].key, json!([1]));
}

#[tokio::test]
async fn passthrough_routes_mutation_unchanged() {
    let script = reference_script();
    let cfg = script.sources.get(&Ident::new("passthrough")).unwrap();
    assert_eq!(cfg.deletes_to, Some(table("some_table")));

    let mutation = Mutation::insert(json!([1]), json!({"passthrough": true}), Hlc::new(1, 0));
    let routing = (cfg.dispatch.as_ref().unwrap())(mutation.clone()).await.unwrap();

    let routed = routing.get(&table("some_table")).unwrap();
    assert_eq!(routed.len(), 1);
    assert_eq!(routed[0], mutation);
}

#[test]
fn recursive_source_sets_recurse() {
    let script = reference_script();
    let cfg = script.sources.get(&Ident::new("recursive")).unwrap();
    assert!(cfg.recurse);
}

#[test]
fn all_features_apply_config_matches() {
    let script = reference_script();
    let cfg = script.targets.get(&table("all_features")).unwrap();

    let mut expected = ApplyConfig::new();
    expected.cas = vec![Ident::new("cas0"), Ident::new("cas1")];
    expected
        .deadlines
        .insert(Ident::new("dl0"), std::time::Duration::from_secs(3600));
    expected
        .deadlines
        .insert(Ident::new("dl1"), std::time::Duration::from_secs(60));
    expected
        .exprs
        .insert(Ident::new("expr0"), "fnv32($0::BYTES)".to_string());
    expected
        .exprs
        .insert(Ident::new("expr1"), "Hello Library!".to_string());
    expected.extras = Some(Ident::new("overflow_column"));
    expected.set_ignore(Ident::new("ign0"), true);
    expected.set_ignore(Ident::new("ign1"), true);

    assert_eq!(cfg.apply, expected);
}

#[tokio::test]
async fn all_features_map_enriches_rows() {
    let script = reference_script();
    let cfg = script.targets.get(&table("all_features")).unwrap();
    let map = cfg.map.as_ref().unwrap();

    let mapped = map(Mutation::insert(
        json!([1]),
        json!({"hello": "world!"}),
        Hlc::new(1, 0),
    ))
    .await
    .unwrap()
    .expect("mutation kept");

    assert_eq!(
        mapped.data,
        Some(json!({"hello": "world!", "msg": "Hello World!", "num": 42}))
    );
}

#[tokio::test]
async fn all_features_merger_rewrites_conflicts() {
    let script = reference_script();
    let cfg = script.targets.get(&table("all_features")).unwrap();
    let merger = cfg.merger.as_ref().unwrap();

    let resolution = merger
        .merge(&conflict(
            json!({"val": 1}),
            json!({"val": 3}),
            json!({"val": 40}),
        ))
        .await
        .unwrap();

    match resolution {
        Resolution::Apply(bag) => {
            assert_eq!(bag.get(&Ident::new("val")), Some(&json!(42)));
        }
        other => panic!("expected apply, got {other:?}"),
    }
}

#[tokio::test]
async fn drop_all_map_filters_everything() {
    let script = reference_script();
    let cfg = script.targets.get(&table("drop_all")).unwrap();
    let map = cfg.map.as_ref().unwrap();

    let kept = map(Mutation::insert(
        json!([1]),
        json!({"hello": "world!"}),
        Hlc::new(1, 0),
    ))
    .await
    .unwrap();
    assert!(kept.is_none());
}

#[tokio::test]
async fn merge_dlq_all_routes_conflicts_to_queue() {
    let script = reference_script();
    let cfg = script.targets.get(&table("merge_dlq_all")).unwrap();
    let merger = cfg.merger.as_ref().unwrap();

    let resolution = merger
        .merge(&conflict(
            json!({"val": 1}),
            json!({"val": 2}),
            json!({"val": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Dlq("dead".to_string()));
}

#[tokio::test]
async fn merge_drop_all_discards_conflicts() {
    let script = reference_script();
    let cfg = script.targets.get(&table("merge_drop_all")).unwrap();
    let merger = cfg.merger.as_ref().unwrap();

    let resolution = merger
        .merge(&conflict(
            json!({"val": 1}),
            json!({"val": 2}),
            json!({"val": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Drop);
}

#[tokio::test]
async fn merge_or_dlq_falls_back_to_queue() {
    let script = reference_script();
    let cfg = script.targets.get(&table("merge_or_dlq")).unwrap();
    let merger = cfg.merger.as_ref().unwrap();

    let resolution = merger
        .merge(&conflict(
            json!({"val": 1}),
            json!({"val": 2}),
            json!({"val": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(resolution, Resolution::Dlq("dead".to_string()));
}
