use crate::command::CommandDispatcher;
use crate::listener::errors::BusError;
use crate::listener::feed::ChangeFeedListener;
use crate::listener::retry::RetryPolicy;
use crate::logging::init_for_tests;
use crate::store::{ChangesRequest, DocumentStore, InMemoryStore, StoreError};
use crate::test_helpers::factory::Factory;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

fn listener_for(store: &InMemoryStore, policy: RetryPolicy) -> (ChangeFeedListener, CancellationToken) {
    let (listener, cancel, _calls) = counted_listener_for(store, policy);
    (listener, cancel)
}

fn counted_listener_for(
    store: &InMemoryStore,
    policy: RetryPolicy,
) -> (ChangeFeedListener, CancellationToken, Arc<AtomicUsize>) {
    let factory = Factory::handler_table().with_commands(&["echo"]);
    let calls = factory.calls();
    let handlers = Arc::new(factory.create());
    let store: Arc<dyn DocumentStore> = Arc::new(store.clone());
    let dispatcher = CommandDispatcher::new(handlers, Arc::clone(&store), TaskTracker::new());
    let cancel = CancellationToken::new();
    let listener = ChangeFeedListener::new(
        store,
        dispatcher,
        ChangesRequest::commands(vec!["echo".to_string()], Duration::from_millis(100)),
        policy,
        cancel.clone(),
    );
    (listener, cancel, calls)
}

fn refused() -> StoreError {
    StoreError::Connection("connection refused".to_string())
}

async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test(start_paused = true)]
async fn five_failed_subscriptions_in_a_row_abort() {
    init_for_tests();
    let store = InMemoryStore::new();
    store.fail_next_subscriptions((0..5).map(|_| refused()));
    let (listener, _cancel) = listener_for(&store, RetryPolicy::default());

    let result = listener.run().await;

    assert!(matches!(result, Err(BusError::FeedAborted { failures: 5, .. })));
    assert_eq!(store.subscriptions_opened(), 5);
}

#[tokio::test(start_paused = true)]
async fn transient_interruption_resets_the_failure_count() {
    init_for_tests();
    let store = InMemoryStore::new();
    let mut failures: Vec<StoreError> = (0..4).map(|_| refused()).collect();
    failures.push(StoreError::Interrupted("incomplete chunk".to_string()));
    failures.extend((0..4).map(|_| refused()));
    store.fail_next_subscriptions(failures);
    let (listener, cancel) = listener_for(&store, RetryPolicy::default());

    let task = tokio::spawn(listener.run());
    let watch = store.clone();
    eventually(move || watch.subscriptions_opened() == 10 && watch.active_subscriptions() == 1).await;
    assert!(!task.is_finished());

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn broken_feeds_between_documents_never_accumulate() {
    init_for_tests();
    let store = InMemoryStore::new();
    let policy = RetryPolicy {
        max_consecutive_failures: 2,
        delay: Duration::from_millis(50),
    };
    let (listener, cancel) = listener_for(&store, policy);
    let task = tokio::spawn(listener.run());

    for round in 1..=4 {
        let watch = store.clone();
        eventually(move || watch.subscriptions_opened() == round && watch.active_subscriptions() == 1)
            .await;
        let doc = Factory::command_doc().with_execute("echo").create();
        store.insert(doc).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        store.break_feeds(false, "connection reset");
    }

    let watch = store.clone();
    eventually(move || watch.subscriptions_opened() == 5).await;
    assert!(!task.is_finished());
    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test(start_paused = true)]
async fn commands_on_the_feed_are_answered() {
    init_for_tests();
    let store = InMemoryStore::new();
    let (listener, cancel) = listener_for(&store, RetryPolicy::default());
    let task = tokio::spawn(listener.run());

    let watch = store.clone();
    eventually(move || watch.active_subscriptions() == 1).await;
    let doc = Factory::command_doc()
        .with_execute("echo")
        .with_args(vec![json!("hello")])
        .create();
    let id = store.insert(doc).await.unwrap();

    let watch = store.clone();
    let watched = id.clone();
    eventually(move || {
        watch
            .document(&watched)
            .is_some_and(|doc| doc.get("response").is_some())
    })
    .await;
    let response = store.document(&id).unwrap()["response"].clone();
    assert_eq!(response["return"], json!("hello"));

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}

#[tokio::test]
async fn stop_during_retry_delay_exits_promptly() {
    init_for_tests();
    let store = InMemoryStore::new();
    store.fail_next_subscriptions([refused()]);
    let policy = RetryPolicy {
        max_consecutive_failures: 5,
        delay: Duration::from_secs(3600),
    };
    let (listener, cancel) = listener_for(&store, policy);
    let task = tokio::spawn(listener.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("listener should exit quickly");
    assert!(result.unwrap().is_ok());
    assert_eq!(store.subscriptions_opened(), 1);
}

#[tokio::test(start_paused = true)]
async fn unfiltered_feed_dispatches_only_matching_commands_once() {
    init_for_tests();
    let store = InMemoryStore::new();
    store.ignore_feed_filters();
    let (listener, cancel, calls) = counted_listener_for(&store, RetryPolicy::default());
    let task = tokio::spawn(listener.run());

    let watch = store.clone();
    eventually(move || watch.active_subscriptions() == 1).await;
    let heartbeat = store
        .insert(json!({"type": "heartbeat", "uuid": "node"}))
        .await
        .unwrap();
    let answered = store
        .insert(
            Factory::command_doc()
                .with_field("response", json!({"ok": true, "content": "old"}))
                .create(),
        )
        .await
        .unwrap();
    let foreign = store
        .insert(Factory::command_doc().with_execute("pump_state").create())
        .await
        .unwrap();
    let id = store
        .insert(Factory::command_doc().with_args(vec![json!("once")]).create())
        .await
        .unwrap();

    let watch = store.clone();
    let watched = id.clone();
    eventually(move || watch.document(&watched).is_some_and(|doc| doc.get("response").is_some())).await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(store.document(&id).unwrap()["response"]["return"], json!("once"));
    assert_eq!(store.document(&answered).unwrap()["response"]["content"], json!("old"));
    assert!(store.document(&foreign).unwrap().get("response").is_none());
    assert!(store.document(&heartbeat).unwrap().get("response").is_none());

    cancel.cancel();
    assert!(task.await.unwrap().is_ok());
}
