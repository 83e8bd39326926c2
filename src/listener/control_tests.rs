use crate::command::REGISTRATION_TYPE;
use crate::listener::control::{ControlHandle, ListenOptions, stop_command_name};
use crate::listener::errors::BusError;
use crate::listener::retry::RetryPolicy;
use crate::logging::init_for_tests;
use crate::store::{DocumentStore, InMemoryStore, StoreError};
use crate::test_helpers::factory::Factory;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

fn options() -> ListenOptions {
    ListenOptions::default()
        .with_node_id("test-node")
        .with_feed_heartbeat(Duration::from_millis(50))
        .with_heartbeat_interval(Duration::from_secs(60))
}

async fn start(store: &InMemoryStore, commands: &[&'static str]) -> ControlHandle {
    let handlers = Factory::handler_table().with_commands(commands).create();
    match ControlHandle::start(handlers, Arc::new(store.clone()), options()).await {
        Ok(handle) => handle,
        Err(e) => panic!("listener should start: {e}"),
    }
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..300 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

async fn until_listening(store: &InMemoryStore) {
    let watch = store.clone();
    eventually(move || watch.active_subscriptions() >= 1).await;
}

async fn submit(store: &InMemoryStore, command: &str) -> String {
    let doc = Factory::command_doc().with_execute(command).create();
    store.insert(doc).await.unwrap()
}

fn response_of(store: &InMemoryStore, id: &str) -> Option<Value> {
    store.document(id).and_then(|doc| doc.get("response").cloned())
}

#[tokio::test]
async fn registration_advertises_commands_and_is_removed_on_stop() {
    init_for_tests();
    let store = InMemoryStore::new();
    let mut handle = start(&store, &["echo", "add"]).await;

    let registration = store.document(handle.registration_id()).unwrap();
    assert_eq!(registration["type"], REGISTRATION_TYPE);
    assert_eq!(registration["uuid"], "test-node");
    assert!(registration["keys"]["echo"]["Info"].is_string());
    assert!(registration["keys"]["add"].is_object());
    assert!(registration["keys"]["stop_test-node"].is_object());
    assert_eq!(handle.stop_command(), Some("stop_test-node"));
    assert!(registration["timestamp"].as_str().unwrap().ends_with("+0000"));

    handle.stop_listening().await.unwrap();
    assert!(!store.contains(handle.registration_id()));
    handle.wait().await.unwrap();
    assert!(store.ids_of_type(REGISTRATION_TYPE).is_empty());
}

#[tokio::test]
async fn colliding_namespace_refuses_to_start() {
    init_for_tests();
    let store = InMemoryStore::new();
    let peer_doc = Factory::registration().with_commands(&["echo"]).create();
    let peer = store.insert(peer_doc.to_value().unwrap()).await.unwrap();

    let handlers = Factory::handler_table().with_commands(&["echo", "add"]).create();
    let result = ControlHandle::start(handlers, Arc::new(store.clone()), options()).await;

    let Err(BusError::Collision(collision)) = result else {
        panic!("start should fail with a collision");
    };
    assert_eq!(collision.names, vec!["echo".to_string()]);
    assert_eq!(collision.holders, vec![peer.clone()]);
    assert_eq!(store.ids_of_type(REGISTRATION_TYPE), vec![peer]);
    assert_eq!(store.active_subscriptions(), 0);
}

#[tokio::test]
async fn forced_start_evicts_peers() {
    init_for_tests();
    let store = InMemoryStore::new();
    let peer_doc = Factory::registration().with_commands(&["echo"]).create();
    let peer = store.insert(peer_doc.to_value().unwrap()).await.unwrap();

    let handlers = Factory::handler_table().with_commands(&["echo"]).create();
    let mut handle = match ControlHandle::start(
        handlers,
        Arc::new(store.clone()),
        options().with_force(true),
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => panic!("forced start should succeed: {e}"),
    };

    assert!(!store.contains(&peer));
    assert!(store.contains(handle.registration_id()));
    handle.stop_listening().await.unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn stop_command_ends_the_listener() {
    init_for_tests();
    let store = InMemoryStore::new();
    let mut handle = start(&store, &["echo"]).await;
    until_listening(&store).await;

    let id = submit(&store, &stop_command_name("test-node")).await;
    tokio::time::timeout(Duration::from_secs(3), handle.wait())
        .await
        .expect("stop command should end the listener")
        .unwrap();

    assert!(handle.is_stopping());
    let response = response_of(&store, &id).expect("stop is answered");
    assert_eq!(response["ok"], json!(true));
    assert!(!store.contains(handle.registration_id()));
}

#[tokio::test]
async fn listeners_on_different_nodes_coexist_with_builtin_stop() {
    init_for_tests();
    let store = InMemoryStore::new();
    let mut first = start(&store, &["echo"]).await;
    let handlers = Factory::handler_table().with_commands(&["add"]).create();
    let mut second = match ControlHandle::start(
        handlers,
        Arc::new(store.clone()),
        options().with_node_id("other-node"),
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => panic!("second listener should start: {e}"),
    };
    let watch = store.clone();
    eventually(move || watch.active_subscriptions() >= 2).await;
    assert_eq!(store.ids_of_type(REGISTRATION_TYPE).len(), 2);

    let id = submit(&store, "stop_other-node").await;
    tokio::time::timeout(Duration::from_secs(3), second.wait())
        .await
        .expect("second listener should stop")
        .unwrap();
    assert_eq!(response_of(&store, &id).unwrap()["ok"], json!(true));
    assert!(!first.is_stopping());
    assert!(store.contains(first.registration_id()));

    let id = submit(&store, "echo").await;
    let watch = store.clone();
    eventually(move || response_of(&watch, &id).is_some()).await;

    first.stop_listening().await.unwrap();
    first.wait().await.unwrap();
}

#[tokio::test]
async fn wait_joins_commands_still_running_after_stop() {
    init_for_tests();
    let store = InMemoryStore::new();
    let factory = Factory::handler_table()
        .with_commands(&["slow"])
        .with_slow_delay(Duration::from_millis(300));
    let calls = factory.calls();
    let mut handle =
        match ControlHandle::start(factory.create(), Arc::new(store.clone()), options()).await {
            Ok(handle) => handle,
            Err(e) => panic!("listener should start: {e}"),
        };
    until_listening(&store).await;

    let mut ids = Vec::new();
    for _ in 0..3 {
        ids.push(submit(&store, "slow").await);
    }
    let counter = Arc::clone(&calls);
    eventually(move || counter.load(Ordering::SeqCst) == 3).await;

    handle.stop_listening().await.unwrap();
    assert!(!store.contains(handle.registration_id()));
    assert!(ids.iter().all(|id| response_of(&store, id).is_none()));

    handle.wait().await.unwrap();
    for id in &ids {
        assert_eq!(response_of(&store, id).unwrap()["return"], "done");
    }
}

#[tokio::test]
async fn fatal_feed_failure_surfaces_from_wait_and_cleans_up() {
    init_for_tests();
    let store = InMemoryStore::new();
    store.fail_next_subscriptions((0..3).map(|_| StoreError::Connection("refused".to_string())));
    let handlers = Factory::handler_table().with_commands(&["echo"]).create();
    let policy = RetryPolicy {
        max_consecutive_failures: 3,
        delay: Duration::from_millis(10),
    };
    let mut handle = match ControlHandle::start(
        handlers,
        Arc::new(store.clone()),
        options().with_retry(policy),
    )
    .await
    {
        Ok(handle) => handle,
        Err(e) => panic!("listener should start: {e}"),
    };

    let result = handle.wait().await;
    assert!(matches!(result, Err(BusError::FeedAborted { failures: 3, .. })));
    assert!(handle.is_stopping());
    assert!(!store.contains(handle.registration_id()));
}

#[tokio::test]
async fn empty_table_without_builtin_stop_is_rejected() {
    init_for_tests();
    let store = InMemoryStore::new();
    let handlers = Factory::handler_table().with_commands(&[]).create();

    let result = ControlHandle::start(
        handlers,
        Arc::new(store.clone()),
        options().without_builtin_stop(),
    )
    .await;

    assert!(matches!(result, Err(BusError::Configuration(_))));
    assert!(store.ids_of_type(REGISTRATION_TYPE).is_empty());
}

#[tokio::test]
async fn write_document_uses_the_listener_connection() {
    init_for_tests();
    let store = InMemoryStore::new();
    let mut handle = start(&store, &["echo"]).await;

    let id = handle
        .write_document(json!({"type": "data", "value": 7}))
        .await
        .unwrap();
    assert_eq!(store.document(&id).unwrap()["value"], 7);

    handle.stop_listening().await.unwrap();
    handle.wait().await.unwrap();
}

#[tokio::test]
async fn dropping_the_handle_withdraws_the_registration() {
    init_for_tests();
    let store = InMemoryStore::new();
    let handle = start(&store, &["echo"]).await;
    let id = handle.registration_id().to_string();

    drop(handle);

    let watch = store.clone();
    eventually(move || !watch.contains(&id)).await;
    let watch = store.clone();
    eventually(move || watch.active_subscriptions() == 0).await;
}
