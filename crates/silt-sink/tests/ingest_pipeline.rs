//! Ingest-to-apply round trips: NDJSON bodies flow through script routing
//! into staging, the resolver applies them, and payload bytes survive the
//! stage/drain cycle.

use serde_json::json;
use silt_sink::apply::Appliers;
use silt_sink::config::SinkConfig;
use silt_sink::dlq::DlqSet;
use silt_sink::memo::{Memo, MemoryMemo};
use silt_sink::ndjson::read_ndjson;
use silt_sink::pipeline::{DeferredEvents, Events, ScriptEvents};
use silt_sink::resolver::ResolverLoop;
use silt_sink::schema::{columns, SchemaWatcher};
use silt_sink::script::{ScriptBuilder, SourceConfig, UserScript};
use silt_sink::stage::Stagers;
use silt_sink::testing::RecordingConn;
use silt_sink::{Hlc, Ident, Mutation, Schema, Table, TableMap};
use std::io::Cursor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn table(name: &str) -> Table {
    Table::new(Schema::new("public"), name)
}

#[tokio::test]
async fn ndjson_body_lands_in_target_after_resolved_marker() {
    let stagers = Arc::new(Stagers::memory());
    let memo: Arc<dyn Memo> = Arc::new(MemoryMemo::new());
    let conn = RecordingConn::new();
    let config = SinkConfig::default();

    // Routing: the ingress source passes everything through to t1.
    let script = Arc::new(
        ScriptBuilder::new()
            .configure_source("cdc", SourceConfig::passthrough(table("t1")))
            .build()
            .unwrap(),
    );
    let deferred = Arc::new(DeferredEvents::new(Arc::clone(&stagers), config.clone()));
    let events = ScriptEvents::new(deferred, script, &config);

    let watcher = Arc::new(SchemaWatcher::new());
    let mut tables = TableMap::new();
    tables.insert(table("t1"), columns(&[("id", true), ("msg", false)]));
    watcher.seed(tables);
    let appliers = Arc::new(Appliers::new(
        watcher,
        Arc::new(UserScript::empty()),
        Arc::new(DlqSet::new()),
    ));

    let cancel = CancellationToken::new();
    let (resolver, handle) = ResolverLoop::new(
        Ident::new("cdc"),
        Schema::new("public"),
        SinkConfig {
            backoff_base_ms: 1,
            ..Default::default()
        },
        Arc::clone(&stagers),
        appliers,
        Arc::new(conn.clone()),
        Arc::clone(&memo),
        cancel.clone(),
    );
    let mut committed = resolver.committed();
    tokio::spawn(resolver.run());

    let body = concat!(
        r#"{"after": {"id": 1, "msg": "a"}, "key": [1], "updated": "10.0000000000"}"#,
        "\n",
        r#"{"after": {"id": 2, "msg": "b"}, "key": [2], "updated": "20.0000000000"}"#,
        "\n",
        r#"{"resolved": "25.0000000000"}"#,
        "\n",
    );

    let mut batch = events.begin().await.unwrap();
    let summary = read_ndjson(
        Cursor::new(body.as_bytes()),
        &Ident::new("cdc"),
        &table("ingress_declared"),
        batch.as_mut(),
        |h| handle.mark(h),
        &SinkConfig::default(),
    )
    .await
    .unwrap();
    batch.commit().await.unwrap();

    assert_eq!(summary.rows, 2);
    assert_eq!(summary.resolved, 1);

    tokio::time::timeout(std::time::Duration::from_secs(5), async {
        while *committed.borrow() < Hlc::new(25, 0) {
            committed.changed().await.unwrap();
        }
    })
    .await
    .expect("resolver did not advance");

    let upserts: Vec<_> = conn
        .statements()
        .into_iter()
        .filter(|(sql, _)| sql.contains(r#""public"."t1""#))
        .collect();
    assert_eq!(upserts.len(), 2);
    assert_eq!(
        memo.get("consistent_point:cdc:public").await.unwrap(),
        Some(Hlc::new(25, 0))
    );

    cancel.cancel();
}

#[tokio::test]
async fn stage_drain_round_trip_preserves_payload() {
    let stagers = Arc::new(Stagers::memory());
    let t1 = table("t1");

    let original = Mutation::insert(
        json!(["composite", 9007199254740993i64]),
        json!({"big": 18446744073709551615u64, "text": "payload", "nested": {"a": [1, 2, 3]}}),
        Hlc::new(1586019746136571000, 42),
    )
    .with_before(json!({"text": "previous"}));

    let stager = stagers.get(&t1);
    stager.store(std::slice::from_ref(&original)).await.unwrap();
    let drained = stager
        .drain(Hlc::ZERO, Hlc::new(i64::MAX, 0))
        .await
        .unwrap();

    assert_eq!(drained.len(), 1);
    assert_eq!(drained[0], original);
    // Byte fidelity, not just structural equality.
    assert_eq!(
        serde_json::to_vec(&drained[0]).unwrap(),
        serde_json::to_vec(&original).unwrap()
    );
}

#[tokio::test]
async fn dispatch_closure_accounts_for_every_routed_mutation() {
    // The sum of per-target deliveries equals what the dispatch returned.
    let stagers = Arc::new(Stagers::memory());
    let config = SinkConfig::default();
    let script = Arc::new(
        ScriptBuilder::new()
            .configure_source(
                "expander",
                SourceConfig::new()
                    .with_deletes_to(table("t1"))
                    .with_dispatch(silt_sink::script::dispatch_fn(|m: Mutation| async move {
                        let mut routing = silt_sink::script::TableRouting::new();
                        routing.insert(table("t1"), vec![m.clone()]);
                        routing.insert(table("t2"), vec![m.clone(), m]);
                        Ok(routing)
                    })),
            )
            .build()
            .unwrap(),
    );
    let deferred = Arc::new(DeferredEvents::new(Arc::clone(&stagers), config.clone()));
    let events = ScriptEvents::new(deferred, script, &config);

    let mut batch = events.begin().await.unwrap();
    batch
        .on_data(
            &Ident::new("expander"),
            Some(&table("t1")),
            vec![Mutation::insert(json!([1]), json!({"msg": 1}), Hlc::new(5, 0))],
        )
        .await
        .unwrap();
    batch.commit().await.unwrap();

    let in_t1 = stagers
        .get(&table("t1"))
        .drain(Hlc::ZERO, Hlc::new(99, 0))
        .await
        .unwrap();
    let in_t2 = stagers
        .get(&table("t2"))
        .drain(Hlc::ZERO, Hlc::new(99, 0))
        .await
        .unwrap();
    assert_eq!(in_t1.len(), 1);
    // Two copies share one (key, time) slot, so staging keeps a single
    // idempotent row.
    assert_eq!(in_t2.len(), 1);
}
