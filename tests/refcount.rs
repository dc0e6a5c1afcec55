//! Integration tests for lease reference counting and view lifecycle.

use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::thread;
use view_broker::{
    ClientHandle, Emission, ErroredQuery, MemoryClient, Query, QueryDef, RegistryConfig, Ttl,
    ViewError, ViewLease, ViewRegistry,
};

fn setup() -> (Arc<MemoryClient>, ClientHandle, ViewRegistry) {
    let client = Arc::new(MemoryClient::new());
    let handle = ClientHandle::with_client(client.clone());
    (client, handle, ViewRegistry::new(RegistryConfig::default()))
}

fn issues() -> Query {
    Query::new(QueryDef::new("issues").with_args(json!({"open": true})))
}

// --- Sharing and Teardown ---

#[test]
fn test_last_release_tears_down() {
    let (client, handle, registry) = setup();
    let query = issues();

    let a = registry.lease(&handle, &query, true, Some("k"));
    let b = registry.lease(&handle, &query, true, Some("k"));
    assert_eq!(client.materialize_count(), 1);
    assert_eq!(registry.refs_for_key("k"), Some(2));

    a.destroy();
    assert_eq!(client.destroy_count(), 0);
    assert_eq!(registry.refs_for_key("k"), Some(1));

    b.destroy();
    assert_eq!(client.destroy_count(), 1);
    assert_eq!(registry.refs_for_key("k"), None);
    assert_eq!(registry.live_views(), 0);
}

#[test]
fn test_same_key_different_queries_share() {
    let (client, handle, registry) = setup();

    let a = registry.lease(&handle, &issues(), true, Some("open-issues"));
    let b = registry.lease(&handle, &issues(), true, Some("open-issues"));

    assert_eq!(client.materialize_count(), 1);
    assert!(a.shared().ptr_eq(b.shared()));
}

#[test]
fn test_query_identity_shares_without_key() {
    let (client, handle, registry) = setup();
    let query = issues();

    let a = registry.lease(&handle, &query, true, None);
    let b = registry.lease(&handle, &query.clone(), true, None);
    assert_eq!(client.materialize_count(), 1);
    assert_eq!(registry.refs_for_query(&query), Some(2));

    // Structurally equal but a different query object
    let c = registry.lease(&handle, &issues(), true, None);
    assert_eq!(client.materialize_count(), 2);
    assert!(!a.shared().ptr_eq(c.shared()));
    drop(b);
}

#[test]
fn test_ephemeral_queries_are_never_shared() {
    let (client, handle, registry) = setup();
    let query = Query::ephemeral(QueryDef::new("issues"));

    let _a = registry.lease(&handle, &query, true, None);
    let _b = registry.lease(&handle, &query, true, None);

    assert_eq!(client.materialize_count(), 2);
    assert_eq!(registry.live_views(), 2);
    assert_eq!(registry.refs_for_query(&query), None);
}

#[test]
fn test_disabled_lease_never_materializes() {
    let (client, handle, registry) = setup();

    let lease = registry.lease(&handle, &issues(), false, Some("k"));
    lease.ensure_subscribed();

    assert_eq!(client.materialize_count(), 0);
    assert_eq!(registry.live_views(), 0);
    assert!(lease.record_id().is_none());
    assert_eq!(lease.data(), json!([]));
    lease.destroy();
}

#[test]
fn test_double_destroy_is_single_release() {
    let (client, handle, registry) = setup();

    let a = registry.lease(&handle, &issues(), true, Some("k"));
    let b = registry.lease(&handle, &issues(), true, Some("k"));
    a.destroy();
    a.destroy();
    assert_eq!(registry.refs_for_key("k"), Some(1));
    assert_eq!(client.destroy_count(), 0);

    drop(b);
    assert_eq!(client.destroy_count(), 1);
}

#[test]
fn test_manual_release_of_unknown_record() {
    let (_client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, Some("k"));
    let id = lease.record_id().unwrap();
    lease.destroy();

    assert!(matches!(
        registry.release(id),
        Err(ViewError::UnknownRecord(unknown)) if unknown == id
    ));
}

// --- Deferred Client ---

#[test]
fn test_missing_client_defers_materialization() {
    let handle = ClientHandle::new();
    let registry = ViewRegistry::default();
    let lease = registry.lease(&handle, &issues(), true, Some("k"));
    lease.update_ttl(Ttl::from_millis(5));
    assert!(!lease.shared().is_materialized());

    let client = Arc::new(MemoryClient::new());
    handle.provide(client.clone());
    assert_eq!(client.materialize_count(), 0);

    lease.ensure_subscribed();
    assert_eq!(client.materialize_count(), 1);
    assert_eq!(
        client.latest_view().unwrap().ttl_updates(),
        vec![Ttl::from_millis(5)]
    );

    // Already materialized: nothing more happens
    lease.ensure_subscribed();
    assert_eq!(client.materialize_count(), 1);
    assert_eq!(client.latest_view().unwrap().ttl_updates().len(), 1);
}

#[test]
fn test_default_ttl_applied_on_materialize() {
    let client = Arc::new(MemoryClient::new());
    let handle = ClientHandle::with_client(client.clone());
    let registry = ViewRegistry::new(RegistryConfig {
        default_ttl: Some(Ttl::from_secs(300)),
        ..Default::default()
    });

    let _lease = registry.lease(&handle, &issues(), true, None);
    assert_eq!(
        client.latest_view().unwrap().ttl_updates(),
        vec![Ttl::from_secs(300)]
    );
}

// --- Status and Retry ---

#[test]
fn test_error_emission_updates_status() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, None);

    client.emit_to("issues", Emission::complete(json!([{"id": 1}])));
    assert_eq!(lease.data(), json!([{"id": 1}]));

    client.emit_to(
        "issues",
        Emission::error(json!("snap"), ErroredQuery::new("boom")),
    );
    let details = lease.details();
    let error = details.error().unwrap();
    assert_eq!(error.message, "boom");
    assert_eq!(error.error_type, "app");
    assert_eq!(lease.data(), json!("snap"));

    // Subscription survives the error
    assert!(lease.shared().is_materialized());
    client.emit_to("issues", Emission::complete(json!([])));
    assert!(lease.details().is_complete());
}

#[test]
fn test_retry_rematerializes_once() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, None);
    lease.update_ttl(Ttl::Forever);

    client.emit_to("issues", Emission::error(json!([]), ErroredQuery::new("boom")));
    let retry = lease.details().error().unwrap().retry.clone();

    assert!(retry.retry());
    assert!(!retry.retry());
    assert!(!retry.refetch());

    assert_eq!(client.materialize_count(), 2);
    assert_eq!(client.destroy_count(), 1);
    assert!(lease.details().is_unknown());
    assert_eq!(client.latest_view().unwrap().ttl_updates(), vec![Ttl::Forever]);

    lease.destroy();
    assert_eq!(client.destroy_count(), 2);
}

#[test]
fn test_listener_sees_fresh_state() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, None);

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let (reader, sink) = (lease.shared().clone(), seen.clone());
    let _remove = lease.add_update_listener(move || sink.lock().push(reader.data()));

    client.emit_to("issues", Emission::complete(json!([1])));
    client.emit_to("issues", Emission::complete(json!([1, 2])));
    assert_eq!(*seen.lock(), vec![json!([1]), json!([1, 2])]);
}

#[test]
fn test_watch_receives_updates() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, None);
    let watch = lease.watch_with_capacity(1);

    client.emit_to("issues", Emission::complete(json!([1])));
    client.emit_to("issues", Emission::complete(json!([2])));

    let update = watch.try_recv().unwrap();
    assert_eq!(update.data, json!([1]));
    assert_eq!(watch.missed(), 1);
    assert!(watch.try_recv().is_err());
}

// --- Shutdown ---

#[test]
fn test_shutdown_finalizes_views() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, Some("k"));

    registry.shutdown();
    assert_eq!(client.destroy_count(), 1);
    assert_eq!(registry.live_views(), 0);
    assert!(lease.shared().is_finalized());

    lease.destroy();
    assert_eq!(client.destroy_count(), 1);
}

#[test]
fn test_dropping_registry_finalizes_views() {
    let (client, handle, registry) = setup();
    let lease = registry.lease(&handle, &issues(), true, Some("k"));
    let clone = registry.clone();

    drop(registry);
    assert_eq!(client.destroy_count(), 0);
    drop(clone);
    assert_eq!(client.destroy_count(), 1);

    drop(lease);
    assert_eq!(client.destroy_count(), 1);
}

#[test]
fn test_registries_are_isolated() {
    let (client, handle, _) = setup();
    let first = ViewRegistry::default();
    let second = ViewRegistry::default();

    let _a = first.lease(&handle, &issues(), true, Some("k"));
    let _b = second.lease(&handle, &issues(), true, Some("k"));
    assert_eq!(client.materialize_count(), 2);
}

// --- Concurrency ---

#[test]
fn test_concurrent_lease_release() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let (client, handle, registry) = setup();
    let query = issues();

    let threads: Vec<_> = (0..8)
        .map(|t| {
            let (handle, registry, query) = (handle.clone(), registry.clone(), query.clone());
            thread::spawn(move || {
                for i in 0..200 {
                    let keyed = registry.lease(&handle, &query, true, Some("shared"));
                    let by_query = registry.lease(&handle, &query, true, None);
                    if (i + t) % 3 == 0 {
                        keyed.destroy();
                    }
                    drop(by_query);
                    keyed.destroy();
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }

    assert_eq!(registry.live_views(), 0);
    assert!(client.live_views().is_empty());
    assert_eq!(client.materialize_count(), client.destroy_count());
    for view in client.views() {
        assert_eq!(view.destroy_calls(), 1);
    }
}

// --- Property Tests ---

#[derive(Clone, Debug)]
enum Op {
    Lease,
    Destroy(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![Just(Op::Lease), (0usize..16).prop_map(Op::Destroy)]
}

proptest! {
    /// The subscription exists exactly while at least one lease is live.
    #[test]
    fn subscription_lives_while_refs_positive(ops in prop::collection::vec(op(), 1..60)) {
        let (client, handle, registry) = setup();
        let query = issues();
        let mut leases: Vec<ViewLease> = Vec::new();
        let mut live = 0usize;
        let mut generations = 0usize;

        for op in ops {
            match op {
                Op::Lease => {
                    if live == 0 {
                        generations += 1;
                    }
                    leases.push(registry.lease(&handle, &query, true, Some("k")));
                    live += 1;
                }
                Op::Destroy(i) if !leases.is_empty() => {
                    let lease = &leases[i % leases.len()];
                    if !lease.is_released() {
                        live -= 1;
                    }
                    lease.destroy();
                }
                Op::Destroy(_) => {}
            }

            prop_assert_eq!(client.materialize_count(), generations);
            if live > 0 {
                prop_assert_eq!(registry.refs_for_key("k"), Some(live));
                prop_assert_eq!(client.live_views().len(), 1);
                prop_assert_eq!(client.destroy_count(), generations - 1);
            } else {
                prop_assert_eq!(registry.refs_for_key("k"), None);
                prop_assert!(client.live_views().is_empty());
                prop_assert_eq!(client.destroy_count(), generations);
            }
        }
    }
}
