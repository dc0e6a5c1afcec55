//! Integration tests for the stream and one-shot interface.

use futures_util::StreamExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use view_broker::{
    ClientError, ClientHandle, ConnectionState, Emission, ErroredQuery, MemoryClient,
    PreloadOptions, Query, QueryDef, ResultKind, RunOptions, ViewError, ViewRegistry,
    ViewStreams,
};

fn issues() -> Query {
    Query::new(QueryDef::new("issues"))
}

fn setup() -> (Arc<MemoryClient>, ClientHandle, ViewStreams) {
    let client = Arc::new(MemoryClient::new().with_initial(Emission::unknown(json!([]))));
    let handle = ClientHandle::with_client(client.clone());
    let streams = ViewStreams::new(handle.clone());
    (client, handle, streams)
}

#[tokio::test]
async fn test_absent_query_never_materializes() {
    let (client, _, streams) = setup();
    let items: Vec<_> = streams.query(|| None).collect().await;

    assert!(items.is_empty());
    assert_eq!(client.materialize_count(), 0);
}

#[tokio::test]
async fn test_streams_bypass_registry() {
    let (client, handle, streams) = setup();
    let registry = ViewRegistry::default();
    let query = issues();

    let _lease = registry.lease(&handle, &query, true, None);
    let (q1, q2) = (query.clone(), query.clone());
    let mut first = streams.query(move || Some(q1));
    let mut second = streams.query(move || Some(q2));
    first.next().await.unwrap().unwrap();
    second.next().await.unwrap().unwrap();

    // One shared view plus one private view per stream
    assert_eq!(client.materialize_count(), 3);
    assert_eq!(registry.refs_for_query(&query), Some(1));
}

#[tokio::test]
async fn test_stream_failure_leaves_leases_alone() {
    let (client, handle, streams) = setup();
    let registry = ViewRegistry::default();
    let lease = registry.lease(&handle, &issues(), true, Some("k"));

    let mut stream = streams.query(|| Some(issues()));
    assert_eq!(stream.next().await.unwrap().unwrap().kind, ResultKind::Unknown);

    client.emit_to(
        "issues",
        Emission::error(
            json!([]),
            ErroredQuery::new("boom")
                .with_type("http")
                .with_details(json!({"status": 503})),
        ),
    );

    match stream.next().await {
        Some(Err(ViewError::QueryResult {
            message,
            error_type,
            details,
        })) => {
            assert_eq!(message, "boom");
            assert_eq!(error_type, "http");
            assert_eq!(details, Some(json!({"status": 503})));
        }
        other => panic!("Expected query error, got {:?}", other),
    }
    assert!(stream.next().await.is_none());

    // Only the stream's private view was destroyed
    assert_eq!(client.destroy_count(), 1);
    assert!(lease.shared().is_materialized());
    assert_eq!(registry.refs_for_key("k"), Some(1));
}

#[tokio::test]
async fn test_stream_waits_for_emissions() {
    let (client, _, streams) = setup();
    let mut stream = streams.query(|| Some(issues()));
    stream.next().await.unwrap().unwrap();

    let producer = client.clone();
    let emitter = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(10)).await;
        producer.emit_to("issues", Emission::complete(json!([{"id": 3}])));
    });

    let snapshot = stream.next().await.unwrap().unwrap();
    assert_eq!(snapshot.kind, ResultKind::Complete);
    assert_eq!(snapshot.data, json!([{"id": 3}]));
    emitter.await.unwrap();
}

#[tokio::test]
async fn test_connection_change_is_first_item_after_current() {
    let (client, _, streams) = setup();
    let mut states = streams.connection_state();

    client.set_connection_state(ConnectionState::Connected);
    client.set_connection_state(ConnectionState::Disconnected);

    assert_eq!(states.next().await.unwrap().unwrap(), ConnectionState::Connecting);
    assert_eq!(states.next().await.unwrap().unwrap(), ConnectionState::Connected);
    assert_eq!(states.next().await.unwrap().unwrap(), ConnectionState::Disconnected);

    states.cancel();
    assert!(states.next().await.is_none());
    assert_eq!(client.connection_listener_count(), 0);
}

#[tokio::test]
async fn test_connection_state_without_client() {
    let streams = ViewStreams::new(ClientHandle::new());
    let items: Vec<_> = streams.connection_state().collect().await;

    assert_eq!(items.len(), 1);
    assert!(matches!(items[0], Err(ViewError::ClientUnavailable)));
}

#[tokio::test]
async fn test_run_and_preload() {
    let (client, _, streams) = setup();
    client.set_run_result(Ok(json!([{"id": 1}])));

    let data = streams
        .run_with_options(issues, RunOptions::complete())
        .await
        .unwrap();
    assert_eq!(data, json!([{"id": 1}]));

    let mut preload = streams.preload(issues, PreloadOptions::default()).unwrap();
    preload.completed().await.unwrap();
    preload.cleanup();
    assert_eq!(client.preload_cleanup_count(), 1);

    // Dropping without cleanup keeps the data warm
    let untouched = streams.preload(issues, PreloadOptions::default()).unwrap();
    drop(untouched);
    assert_eq!(client.preload_count(), 2);
    assert_eq!(client.preload_cleanup_count(), 1);
}

#[tokio::test]
async fn test_one_shot_failures_are_typed() {
    let (client, handle, streams) = setup();

    client.set_run_result(Err(ClientError::new("timeout")));
    let err = streams.run_query(issues).await.unwrap_err();
    assert_eq!(err.to_string(), "Operation failed: timeout");

    handle.take();
    assert!(matches!(
        streams.run_query(issues).await,
        Err(ViewError::ClientUnavailable)
    ));
    assert!(matches!(
        streams.preload(issues, PreloadOptions::default()),
        Err(ViewError::ClientUnavailable)
    ));
}
