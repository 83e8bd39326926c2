//! Document-store contract consumed by the command bus, with a CouchDB
//! implementation and an in-process one.

pub mod changes;
pub mod couch;
pub mod errors;
pub mod memory;

pub use changes::{ChangeFilter, ChangeNotification, ChangeStream, ChangesRequest, Since};
pub use couch::CouchStore;
pub use errors::StoreError;
pub use memory::InMemoryStore;


use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// A map/reduce view addressed by design document and view name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ViewName {
    pub design: String,
    pub view: String,
}

impl ViewName {
    pub fn new(design: impl Into<String>, view: impl Into<String>) -> Self {
        Self {
            design: design.into(),
            view: view.into(),
        }
    }
}

/// One grouped row of a reduced view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyCount {
    pub key: String,
    pub count: u64,
}

/// One unreduced view row: the emitting document and the emitted key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewRow {
    pub id: String,
    pub key: String,
}

/// Operations the bus needs from a shared document store.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Opens a continuous change subscription.
    async fn changes(&self, request: ChangesRequest) -> Result<ChangeStream, StoreError>;

    /// Creates a document and returns the id the store assigned to it.
    async fn insert(&self, doc: Value) -> Result<String, StoreError>;

    /// Creates the document `id` from `fields`, or merges `fields` into it
    /// when it already exists.
    async fn upsert(&self, id: &str, fields: Value) -> Result<(), StoreError>;

    async fn get(&self, id: &str) -> Result<Option<Value>, StoreError>;

    /// Removes a document. Fails with [`StoreError::NotFound`] if absent.
    async fn delete(&self, id: &str) -> Result<(), StoreError>;

    /// Grouped reduce (`count` per key) over a view.
    async fn aggregate(&self, view: &ViewName) -> Result<Vec<KeyCount>, StoreError>;

    /// Unreduced rows of a view restricted to `keys`.
    async fn view_rows(&self, view: &ViewName, keys: &[String])
    -> Result<Vec<ViewRow>, StoreError>;

    /// Total length in bytes of an attachment, without fetching it.
    async fn attachment_length(&self, doc_id: &str, name: &str) -> Result<u64, StoreError>;

    /// Fetches the inclusive byte range `start..=end` of an attachment.
    async fn attachment_range(
        &self,
        doc_id: &str,
        name: &str,
        start: u64,
        end: u64,
    ) -> Result<Bytes, StoreError>;

    /// A fresh handle to the same database, not sharing connection state
    /// with `self`.
    fn reacquire(&self) -> Arc<dyn DocumentStore>;
}

/// Generates a 32 hex digit document id.
pub fn new_doc_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}
