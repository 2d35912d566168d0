
use std::sync::Arc;

use futures_util::StreamExt;
use jql::{ndjson_parallel, ndjson_stream, EmitMode, EngineOptions, PoolConfig, QueryError, WorkerPool};
use serde_json::{json, Value};
use test_utils::large_document;

const EVENTS: &str = "{\"type\":\"click\",\"payload\":{\"id\":1,\"x\":10}}\n\
{\"type\":\"view\",\"payload\":{\"id\":2,\"x\":20}}\r\n\
\n\
{\"type\":\"click\",\"payload\":{\"id\":3,\"x\":30}}";

#[tokio::test]
async fn stream_projects_each_line() {
    let records: Vec<_> = ndjson_stream(EVENTS.as_bytes(), "{ type, payload { id } }", EngineOptions::default(), 7)
        .unwrap()
        .collect()
        .await;
    let lines: Vec<u64> = records.iter().map(|r| r.as_ref().unwrap().line).collect();
    assert_eq!(lines, vec![1, 2, 4]);

    let values: Vec<Value> = records
        .into_iter()
        .map(|r| r.unwrap().outcome.unwrap().into_value().unwrap())
        .collect();
    assert_eq!(
        values,
        vec![
            json!({"type": "click", "payload": {"id": 1}}),
            json!({"type": "view", "payload": {"id": 2}}),
            json!({"type": "click", "payload": {"id": 3}}),
        ]
    );
}

#[tokio::test]
async fn bad_line_does_not_stop_the_stream() {
    let input = "{\"id\":1}\n{\"id\":\n{\"id\":3}\n";
    let records: Vec<_> = ndjson_stream(input.as_bytes(), "{ id }", EngineOptions::default(), 64)
        .unwrap()
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(records.len(), 3);
    assert!(records[0].outcome.is_ok());
    assert!(matches!(records[1].outcome, Err(QueryError::Structural(_))));
    assert_eq!(records[2].outcome.as_ref().unwrap().matches.len(), 1);
}

#[tokio::test]
async fn raw_mode_yields_spans_per_line() {
    let input = "{\"id\":10,\"n\":\"a\"}\n{\"id\":20}\n";
    let records: Vec<_> = ndjson_stream(input.as_bytes(), "{ id }", EngineOptions::raw(), 4)
        .unwrap()
        .collect()
        .await;
    let spans: Vec<Vec<u8>> = records
        .iter()
        .flat_map(|r| r.as_ref().unwrap().outcome.as_ref().unwrap().raw_matches().map(|m| m.bytes.to_vec()))
        .collect();
    assert_eq!(spans, vec![b"10".to_vec(), b"20".to_vec()]);
}

#[tokio::test]
async fn bad_query_is_rejected_up_front() {
    assert!(ndjson_stream(&b""[..], "{ a { }", EngineOptions::default(), 16).is_err());
}

#[tokio::test]
async fn parallel_responses_keep_input_order() {
    let input: String = (1..=200).map(|i| format!("{{\"id\":{},\"pad\":\"{}\"}}\n", i, "x".repeat(i % 17))).collect();
    let pool = Arc::new(WorkerPool::new(PoolConfig { size: 4, queue_capacity: 8 }).unwrap());
    let responses: Vec<_> = ndjson_parallel(std::io::Cursor::new(input.into_bytes()), "{ id }", pool.clone(), EmitMode::Materialize, 100)
        .collect()
        .await;

    assert_eq!(responses.len(), 200);
    for (i, response) in responses.into_iter().enumerate() {
        let response = response.unwrap();
        assert_eq!(response.id, i as u64 + 1);
        assert_eq!(response.result, Some(json!({"id": i + 1})));
        assert!(response.error.is_none());
    }
    assert_eq!(pool.queue_size(), 0);
}

#[tokio::test]
async fn parallel_reports_record_errors_in_place() {
    let input = "{\"id\":1}\n[1,2\n{\"id\":3}\n";
    let pool = Arc::new(WorkerPool::new(PoolConfig { size: 2, queue_capacity: 2 }).unwrap());
    let responses: Vec<_> = ndjson_parallel(input.as_bytes(), "{ id }", pool, EmitMode::Materialize, 64)
        .map(|r| r.unwrap())
        .collect()
        .await;
    assert_eq!(responses.len(), 3);
    assert!(responses[0].error.is_none());
    assert!(responses[1].error.as_deref().unwrap().contains("truncated"));
    assert_eq!(responses[2].result, Some(json!({"id": 3})));
}

#[tokio::test]
async fn parallel_window_fits_a_pool_without_a_queue() {
    // One worker and no queue: every submission must wait for the previous
    // reply, including the unterminated last line.
    let input = format!("{}\n{{\"id\":2}}\n{{\"id\":3}}", large_document(8 << 20));
    let pool = Arc::new(WorkerPool::new(PoolConfig { size: 1, queue_capacity: 0 }).unwrap());
    let responses: Vec<_> = ndjson_parallel(std::io::Cursor::new(input.into_bytes()), "{ id }", pool, EmitMode::Materialize, 4096)
        .collect()
        .await;

    let results: Vec<_> = responses.into_iter().map(|r| r.unwrap().result).collect();
    assert_eq!(results, vec![Some(json!({"id": 42})), Some(json!({"id": 2})), Some(json!({"id": 3}))]);
}

#[tokio::test]
async fn parallel_ids_are_source_line_numbers() {
    let input = "{\"id\":1}\n\n\r\n{\"id\":4}\n{\"id\":5}";
    let pool = Arc::new(WorkerPool::new(PoolConfig { size: 2, queue_capacity: 1 }).unwrap());
    let ids: Vec<u64> = ndjson_parallel(input.as_bytes(), "{ id }", pool, EmitMode::Materialize, 3)
        .map(|r| r.unwrap().id)
        .collect()
        .await;
    assert_eq!(ids, vec![1, 4, 5]);
}
