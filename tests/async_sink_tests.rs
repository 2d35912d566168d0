
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use jql::runtime::deliver;
use jql::{query, spawn_subscription, subscribe, CollectSink, EngineOptions, FnSink, Match, QueryError, QueryOptions};
use serde_json::json;
use test_utils::{id_array, RecordingSink};

fn chunks(doc: &str, size: usize) -> impl futures_core::Stream<Item = std::io::Result<Bytes>> + Send + 'static {
    let parts: Vec<std::io::Result<Bytes>> =
        doc.as_bytes().chunks(size).map(|c| Ok(Bytes::copy_from_slice(c))).collect();
    stream::iter(parts)
}

#[tokio::test]
async fn every_id_is_delivered_exactly_once() {
    let doc = id_array(100);
    let sink = Arc::new(RecordingSink::default());
    let outcome = query(doc.as_bytes(), "{ id }", QueryOptions::default().with_sink(sink.clone())).await.unwrap();

    let settled = sink.settled();
    assert_eq!(settled.len(), 100);
    let unique: HashSet<u64> = settled.iter().copied().collect();
    assert_eq!(unique, (0..100).collect::<HashSet<u64>>());
    assert_eq!(outcome.stats.matched_count, 100);
    assert!(outcome.result.is_none());
}

#[tokio::test]
async fn callbacks_start_in_document_order() {
    let doc = id_array(50);
    let sink = Arc::new(RecordingSink::default());
    query(doc.as_bytes(), "{ id }", QueryOptions::default().with_sink(sink.clone())).await.unwrap();
    assert_eq!(sink.started(), (0..50).collect::<Vec<u64>>());
    // Random delays reorder completions.
    assert_ne!(sink.settled(), sink.started());
}

#[tokio::test]
async fn drain_waits_for_every_callback() {
    let doc = id_array(100);
    let sink = Arc::new(RecordingSink::default());
    query(doc.as_bytes(), "{ id }", QueryOptions::default().with_sink(sink.clone())).await.unwrap();
    assert_eq!(sink.drained_after(), Some(100));
    let stats = sink.stats.lock().unwrap().expect("stats delivered");
    assert_eq!(stats.matched_count, 100);
}

#[tokio::test]
async fn raw_matches_reach_the_sink() {
    let doc = id_array(20);
    let sink = Arc::new(RecordingSink::default());
    query(doc.as_bytes(), "{ id }", QueryOptions::default().raw().with_sink(sink.clone())).await.unwrap();
    let mut settled = sink.settled();
    settled.sort_unstable();
    assert_eq!(settled, (0..20).collect::<Vec<u64>>());
}

#[tokio::test]
async fn sink_error_fails_the_query_after_all_callbacks_settle() {
    let doc = id_array(30);
    let sink = Arc::new(RecordingSink::failing_on(7));
    let err = query(doc.as_bytes(), "{ id }", QueryOptions::default().with_sink(sink.clone())).await.unwrap_err();
    assert!(matches!(err, QueryError::Sink(_)), "got {:?}", err);
    assert!(err.to_string().contains("id 7"));
    assert_eq!(sink.settled().len(), 30);
    assert_eq!(sink.drained_after(), None);
}

#[tokio::test]
async fn query_without_sink_returns_the_projection() {
    let doc = r#"{"users":[{"id":1,"name":"A"},{"id":2,"name":"B"}],"total":2}"#;
    let outcome = query(doc.as_bytes(), "{ users { name } }", QueryOptions::default()).await.unwrap();
    assert_eq!(outcome.result, Some(json!({"users": [{"name": "A"}, {"name": "B"}]})));
    assert!(outcome.stats.skip_ratio > 0.0);
}

#[tokio::test]
async fn query_syntax_errors_surface_before_parsing() {
    let err = query(b"not json at all", "{ id", QueryOptions::default()).await.unwrap_err();
    assert!(matches!(err, QueryError::Syntax(_)));
}

#[tokio::test]
async fn sync_closures_work_as_sinks() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let collected = seen.clone();
    let sink = FnSink::new(move |value| {
        collected.lock().unwrap().push(value);
        Ok(())
    });
    query(id_array(3).as_bytes(), "{ id }", QueryOptions::default().with_sink(Arc::new(sink))).await.unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![json!({"id": 0}), json!({"id": 1}), json!({"id": 2})]);
}

#[tokio::test]
async fn deliver_with_no_matches_is_a_no_op() {
    let sink = RecordingSink::default();
    deliver(&sink, Vec::new()).await.unwrap();
    assert!(sink.started().is_empty());
}

#[tokio::test]
async fn subscription_streams_records_across_chunks() {
    let doc = id_array(25);
    let matches: Vec<Match> = subscribe(chunks(&doc, 3), "{ id }", EngineOptions::default())
        .unwrap()
        .map(|m| m.unwrap())
        .collect()
        .await;
    let ids: Vec<u64> = matches
        .into_iter()
        .map(|m| match m {
            Match::Value(v) => v["id"].as_u64().unwrap(),
            Match::Raw(r) => panic!("unexpected raw match {:?}", r),
        })
        .collect();
    assert_eq!(ids, (0..25).collect::<Vec<u64>>());
}

#[tokio::test]
async fn subscription_accepts_back_to_back_documents() {
    let source = "{\"id\":1,\"x\":[]}\n{\"id\":2}\n  {\"id\":3,\"y\":{}}";
    let values: Vec<_> = subscribe(chunks(source, 4), "{ id }", EngineOptions::default())
        .unwrap()
        .filter_map(|m| async move {
            match m {
                Ok(Match::Value(v)) => Some(v),
                _ => None,
            }
        })
        .collect()
        .await;
    assert_eq!(values, vec![json!({"id": 1}), json!({"id": 2}), json!({"id": 3})]);
}

#[tokio::test]
async fn subscription_ends_after_an_error() {
    let items: Vec<_> = subscribe(chunks(r#"[{"id":1},{"id":tru}]"#, 5), "{ id }", EngineOptions::default())
        .unwrap()
        .collect()
        .await;
    assert!(matches!(items.last(), Some(Err(QueryError::Lex(_)))));
    assert_eq!(items.iter().filter(|i| i.is_err()).count(), 1);
}

#[tokio::test]
async fn records_closed_before_an_error_are_yielded_first() {
    let doc = r#"[{"id":1},{"id":2},{"id":tru}]"#;
    let items: Vec<_> = subscribe(chunks(doc, doc.len()), "{ id }", EngineOptions::default())
        .unwrap()
        .collect()
        .await;
    assert_eq!(items.len(), 3);
    assert!(matches!(&items[0], Ok(Match::Value(v)) if *v == json!({"id": 1})));
    assert!(matches!(&items[1], Ok(Match::Value(v)) if *v == json!({"id": 2})));
    assert!(matches!(items[2], Err(QueryError::Lex(_))));
}

#[tokio::test]
async fn spawned_subscription_drains_into_the_sink() {
    let doc = id_array(40);
    let sink = Arc::new(RecordingSink::default());
    let subscription = spawn_subscription(chunks(&doc, 7), "{ id }", EngineOptions::default(), sink.clone()).unwrap();
    let stats = subscription.join().await.unwrap();
    assert_eq!(stats.matched_count, 40);
    assert_eq!(sink.drained_after(), Some(40));
}

#[tokio::test]
async fn collect_sink_keeps_raw_spans() {
    let sink = Arc::new(CollectSink::new());
    let doc = r#"{"a": {"b": [1, 2]}, "c": "d"}"#;
    query(doc.as_bytes(), "{ a }", QueryOptions::default().raw().with_sink(sink.clone())).await.unwrap();
    let raw = sink.raw();
    assert_eq!(raw.len(), 1);
    assert_eq!(&raw[0].bytes[..], br#"{"b": [1, 2]}"#);
    assert_eq!(raw[0].key, "a");
    assert!(sink.stats().is_some());
}

#[tokio::test]
async fn unsubscribe_cancels_a_running_subscription() {
    // The source never ends, so only cancellation stops the task.
    let source = chunks(r#"[{"id":0},{"id":1},"#, 64).chain(stream::pending());
    let sink = Arc::new(RecordingSink::default());
    let subscription = spawn_subscription(source, "{ id }", EngineOptions::default(), sink.clone()).unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while sink.settled().len() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("records before the stall are delivered");
    assert!(!subscription.is_finished());

    subscription.unsubscribe();
    match subscription.join().await {
        Err(QueryError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::Interrupted),
        other => panic!("expected a cancelled subscription, got {:?}", other),
    }
    let mut settled = sink.settled();
    settled.sort_unstable();
    assert_eq!(settled, vec![0, 1]);
    assert_eq!(sink.drained_after(), None);
}
