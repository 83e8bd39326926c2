use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{Instant, Interval};
use tracing::debug;

use super::changes::{ChangeFilter, ChangeNotification, ChangeStream, ChangesRequest};
use super::errors::StoreError;
use super::{DocumentStore, KeyCount, ViewName, ViewRow, new_doc_id};
use crate::shared::config::model::{DEFAULT_DESIGN_DOC, DEFAULT_REGISTRY_VIEW};

const LOG_TARGET: &str = "couchbus::store::memory";
const FEED_CAPACITY: usize = 1024;

/// Map function of an in-memory view: the keys a document emits.
pub type ViewFn = Arc<dyn Fn(&Value) -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone)]
enum FeedEvent {
    Change { id: String, doc: Value },
    Break { transient: bool, reason: String },
}

struct Inner {
    docs: Mutex<BTreeMap<String, Value>>,
    attachments: Mutex<HashMap<(String, String), Bytes>>,
    views: Mutex<HashMap<ViewName, ViewFn>>,
    feed: broadcast::Sender<FeedEvent>,
    open_failures: Mutex<VecDeque<StoreError>>,
    write_failures: AtomicUsize,
    subscriptions: AtomicUsize,
    reacquired: AtomicUsize,
    unfiltered: AtomicBool,
}

/// A process-local document store with a live change feed.
///
/// Clones (and handles obtained through [`DocumentStore::reacquire`]) share
/// the same documents. Faults can be scripted with
/// [`fail_next_subscriptions`](Self::fail_next_subscriptions),
/// [`break_feeds`](Self::break_feeds),
/// [`ignore_feed_filters`](Self::ignore_feed_filters) and
/// [`fail_next_writes`](Self::fail_next_writes).
#[derive(Clone)]
pub struct InMemoryStore {
    inner: Arc<Inner>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    /// An empty store with the command registry view installed.
    pub fn new() -> Self {
        let (feed, _) = broadcast::channel(FEED_CAPACITY);
        let store = Self {
            inner: Arc::new(Inner {
                docs: Mutex::new(BTreeMap::new()),
                attachments: Mutex::new(HashMap::new()),
                views: Mutex::new(HashMap::new()),
                feed,
                open_failures: Mutex::new(VecDeque::new()),
                write_failures: AtomicUsize::new(0),
                subscriptions: AtomicUsize::new(0),
                reacquired: AtomicUsize::new(0),
                unfiltered: AtomicBool::new(false),
            }),
        };
        store.define_view(
            ViewName::new(DEFAULT_DESIGN_DOC, DEFAULT_REGISTRY_VIEW),
            Arc::new(registration_keys),
        );
        store
    }

    pub fn define_view(&self, view: ViewName, map: ViewFn) {
        self.inner.views.lock().insert(view, map);
    }

    pub fn put_attachment(&self, doc_id: &str, name: &str, data: impl Into<Bytes>) {
        self.inner
            .attachments
            .lock()
            .insert((doc_id.to_string(), name.to_string()), data.into());
    }

    /// The next `errors.len()` calls to `changes` fail with these errors, in order.
    pub fn fail_next_subscriptions(&self, errors: impl IntoIterator<Item = StoreError>) {
        self.inner.open_failures.lock().extend(errors);
    }

    /// Terminates every open subscription with an error. Transient breaks
    /// surface as [`StoreError::Interrupted`], others as
    /// [`StoreError::Connection`].
    pub fn break_feeds(&self, transient: bool, reason: &str) {
        let _ = self.inner.feed.send(FeedEvent::Break {
            transient,
            reason: reason.to_string(),
        });
    }

    /// Subscriptions opened from now on deliver every change, like a server
    /// that does not know the requested filter.
    pub fn ignore_feed_filters(&self) {
        self.inner.unfiltered.store(true, Ordering::SeqCst);
    }

    /// The next `count` document writes fail with a connection error.
    pub fn fail_next_writes(&self, count: usize) {
        self.inner.write_failures.store(count, Ordering::SeqCst);
    }

    /// Number of subscriptions opened so far, failed attempts included.
    pub fn subscriptions_opened(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Number of currently open subscriptions.
    pub fn active_subscriptions(&self) -> usize {
        self.inner.feed.receiver_count()
    }

    pub fn handles_reacquired(&self) -> usize {
        self.inner.reacquired.load(Ordering::SeqCst)
    }

    pub fn document(&self, id: &str) -> Option<Value> {
        self.inner.docs.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.docs.lock().contains_key(id)
    }

    /// Ids of all documents whose `type` field equals `doc_type`.
    pub fn ids_of_type(&self, doc_type: &str) -> Vec<String> {
        self.inner
            .docs
            .lock()
            .iter()
            .filter(|(_, doc)| doc.get("type").and_then(Value::as_str) == Some(doc_type))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn take_write_failure(&self) -> Result<(), StoreError> {
        let taken = self
            .inner
            .write_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match taken {
            Ok(_) => Err(StoreError::Connection("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn publish(&self, id: &str, doc: &Value) {
        // No receivers is fine: nobody is subscribed yet.
        let _ = self.inner.feed.send(FeedEvent::Change {
            id: id.to_string(),
            doc: doc.clone(),
        });
    }

    fn view_fn(&self, view: &ViewName) -> Result<ViewFn, StoreError> {
        self.inner
            .views
            .lock()
            .get(view)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("view {}/{}", view.design, view.view)))
    }
}

/// Map function of the registry view: every command name advertised by an
/// `export_commands` document.
pub fn registration_keys(doc: &Value) -> Vec<String> {
    if doc.get("type").and_then(Value::as_str) != Some("export_commands") {
        return Vec::new();
    }
    doc.get("keys")
        .and_then(Value::as_object)
        .map(|keys| keys.keys().cloned().collect())
        .unwrap_or_default()
}

struct FeedState {
    rx: broadcast::Receiver<FeedEvent>,
    filter: Option<ChangeFilter>,
    heartbeat: Interval,
    done: bool,
}

fn feed_stream(state: FeedState) -> ChangeStream {
    futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            tokio::select! {
                event = st.rx.recv() => match event {
                    Ok(FeedEvent::Change { id, doc }) => {
                        if st.filter.as_ref().is_none_or(|filter| filter.matches(&id, &doc)) {
                            return Some((Ok(ChangeNotification::Document { id, doc }), st));
                        }
                    }
                    Ok(FeedEvent::Break { transient, reason }) => {
                        st.done = true;
                        let err = if transient {
                            StoreError::Interrupted(reason)
                        } else {
                            StoreError::Connection(reason)
                        };
                        return Some((Err(err), st));
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        st.done = true;
                        let err = StoreError::Interrupted(format!("feed lagged by {skipped} changes"));
                        return Some((Err(err), st));
                    }
                    Err(RecvError::Closed) => return None,
                },
                _ = st.heartbeat.tick() => {
                    return Some((Ok(ChangeNotification::Heartbeat), st));
                }
            }
        }
    })
    .boxed()
}

fn merge_into(target: &mut Value, fields: &Value) {
    match (target.as_object_mut(), fields.as_object()) {
        (Some(existing), Some(update)) => {
            for (key, value) in update {
                existing.insert(key.clone(), value.clone());
            }
        }
        _ => *target = fields.clone(),
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn changes(&self, request: ChangesRequest) -> Result<ChangeStream, StoreError> {
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.inner.open_failures.lock().pop_front() {
            debug!(target: LOG_TARGET, error = %err, "Injected subscription failure");
            return Err(err);
        }

        let period = request.heartbeat.max(Duration::from_millis(1));
        let state = FeedState {
            rx: self.inner.feed.subscribe(),
            filter: (!self.inner.unfiltered.load(Ordering::SeqCst)).then_some(request.filter),
            heartbeat: tokio::time::interval_at(Instant::now() + period, period),
            done: false,
        };
        Ok(feed_stream(state))
    }

    async fn insert(&self, mut doc: Value) -> Result<String, StoreError> {
        self.take_write_failure()?;
        let Some(fields) = doc.as_object_mut() else {
            return Err(StoreError::InvalidRequest(
                "document must be a JSON object".to_string(),
            ));
        };
        let id = match fields.get("_id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => new_doc_id(),
        };
        fields.insert("_id".to_string(), Value::String(id.clone()));

        {
            let mut docs = self.inner.docs.lock();
            if docs.contains_key(&id) {
                return Err(StoreError::Conflict(id));
            }
            docs.insert(id.clone(), doc.clone());
        }
        self.publish(&id, &doc);
        Ok(id)
    }

    async fn upsert(&self, id: &str, fields: Value) -> Result<(), StoreError> {
        self.take_write_failure()?;
        if !fields.is_object() {
            return Err(StoreError::InvalidRequest(
                "document must be a JSON object".to_string(),
            ));
        }
        let doc = {
            let mut docs = self.inner.docs.lock();
            let entry = docs.entry(id.to_string()).or_insert_with(|| {
                let mut fresh = Map::new();
                fresh.insert("_id".to_string(), Value::String(id.to_string()));
                Value::Object(fresh)
            });
            merge_into(entry, &fields);
            entry.clone()
        };
        self.publish(id, &doc);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.document(id))
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.take_write_failure()?;
        let removed = self.inner.docs.lock().remove(id);
        match removed {
            Some(_) => {
                self.publish(id, &serde_json::json!({ "_id": id, "_deleted": true }));
                Ok(())
            }
            None => Err(StoreError::NotFound(id.to_string())),
        }
    }

    async fn aggregate(&self, view: &ViewName) -> Result<Vec<KeyCount>, StoreError> {
        let map = self.view_fn(view)?;
        let mut counts: BTreeMap<String, u64> = BTreeMap::new();
        for doc in self.inner.docs.lock().values() {
            for key in map(doc) {
                *counts.entry(key).or_default() += 1;
            }
        }
        Ok(counts
            .into_iter()
            .map(|(key, count)| KeyCount { key, count })
            .collect())
    }

    async fn view_rows(
        &self,
        view: &ViewName,
        keys: &[String],
    ) -> Result<Vec<ViewRow>, StoreError> {
        let map = self.view_fn(view)?;
        let mut rows = Vec::new();
        for (id, doc) in self.inner.docs.lock().iter() {
            for key in map(doc) {
                if keys.contains(&key) {
                    rows.push(ViewRow {
                        id: id.clone(),
                        key,
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn attachment_length(&self, doc_id: &str, name: &str) -> Result<u64, StoreError> {
        self.inner
            .attachments
            .lock()
            .get(&(doc_id.to_string(), name.to_string()))
            .map(|data| data.len() as u64)
            .ok_or_else(|| StoreError::NotFound(format!("{doc_id}/{name}")))
    }

    async fn attachment_range(
        &self,
        doc_id: &str,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError> {
        let attachments = self.inner.attachments.lock();
        let data = attachments
            .get(&(doc_id.to_string(), name.to_string()))
            .ok_or_else(|| StoreError::NotFound(format!("{doc_id}/{name}")))?;
        let len = data.len() as u64;
        if start > end || start >= len {
            return Err(StoreError::Http {
                status: 416,
                reason: format!("range {start}-{end} not satisfiable for length {len}"),
            });
        }
        let end = end.min(len - 1);
        Ok(data.slice(start as usize..=end as usize))
    }

    fn reacquire(&self) -> Arc<dyn DocumentStore> {
        self.inner.reacquired.fetch_add(1, Ordering::SeqCst);
        Arc::new(self.clone())
    }
}
