use futures::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::errors::InvocationError;
use crate::command::{CommandDocument, EXCEPTION_PREFIX, ResponseEnvelope};
use crate::shared::config::{ClientConfig, StoreConfig};
use crate::store::{ChangeNotification, ChangesRequest, CouchStore, DocumentStore, StoreError};

const LOG_TARGET: &str = "couchbus::client";

const DEFAULT_FEED_HEARTBEAT: Duration = Duration::from_secs(5);

/// Writes command documents and waits for the listener's answer.
///
/// Every call opens its own subscription on the id of the document it
/// wrote, so concurrent calls never share state.
#[derive(Clone)]
pub struct RemoteInvocationClient {
    store: Arc<dyn DocumentStore>,
    default_timeout: Duration,
    feed_heartbeat: Duration,
}

impl RemoteInvocationClient {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::from_config(store, &ClientConfig::default())
    }

    pub fn from_config(store: Arc<dyn DocumentStore>, cfg: &ClientConfig) -> Self {
        Self {
            store,
            default_timeout: cfg.default_timeout(),
            feed_heartbeat: DEFAULT_FEED_HEARTBEAT,
        }
    }

    /// Connects to CouchDB with `store` settings.
    pub async fn connect(store: &StoreConfig, cfg: &ClientConfig) -> Result<Self, StoreError> {
        let couch = CouchStore::connect(store).await?;
        Ok(Self::from_config(Arc::new(couch), cfg))
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_feed_heartbeat(mut self, heartbeat: Duration) -> Self {
        self.feed_heartbeat = heartbeat;
        self
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Runs `command` remotely and returns its result. `timeout` defaults to
    /// the client's default timeout.
    pub async fn send_command(
        &self,
        command: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value, InvocationError> {
        let doc = CommandDocument::new(command, args).to_value();
        let id = self
            .store
            .insert(doc)
            .await
            .map_err(|source| InvocationError::Write {
                command: command.to_string(),
                source,
            })?;
        debug!(target: LOG_TARGET, doc_id = %id, command, "Command written");

        self.await_response(&id, command, timeout).await
    }

    /// Waits for the response to an already written command document.
    pub async fn await_response(
        &self,
        id: &str,
        command: &str,
        timeout: Option<Duration>,
    ) -> Result<Value, InvocationError> {
        let timeout = timeout.unwrap_or(self.default_timeout);
        let envelope = match tokio::time::timeout(timeout, self.next_response(id, command)).await {
            Ok(envelope) => envelope?,
            Err(_) => {
                warn!(target: LOG_TARGET, doc_id = %id, command, ?timeout, "No response in time");
                return Err(InvocationError::Timeout {
                    command: command.to_string(),
                    timeout,
                });
            }
        };

        if envelope.content.starts_with(EXCEPTION_PREFIX) {
            return Err(InvocationError::Remote {
                command: command.to_string(),
                content: envelope.content,
            });
        }
        info!(target: LOG_TARGET, doc_id = %id, command, "{}", envelope.content);
        Ok(envelope.return_value.unwrap_or(Value::Null))
    }

    async fn next_response(&self, id: &str, command: &str) -> Result<ResponseEnvelope, InvocationError> {
        let request = ChangesRequest::doc_ids(vec![id.to_string()], self.feed_heartbeat);

        loop {
            let mut stream = self.store.changes(request.clone()).await?;

            // The answer may have landed before the subscription was live.
            if let Some(doc) = self.store.get(id).await? {
                if let Some(envelope) = response_in(&doc, command)? {
                    return Ok(envelope);
                }
            }

            while let Some(item) = stream.next().await {
                match item {
                    Ok(ChangeNotification::Heartbeat) => {}
                    Ok(ChangeNotification::Document { doc, .. }) => {
                        if let Some(envelope) = response_in(&doc, command)? {
                            return Ok(envelope);
                        }
                    }
                    Err(err) if err.is_transient() => {
                        debug!(target: LOG_TARGET, doc_id = %id, error = %err, "Response feed interrupted");
                        break;
                    }
                    Err(err) => return Err(InvocationError::Feed(err)),
                }
            }
            debug!(target: LOG_TARGET, doc_id = %id, "Resubscribing for response");
        }
    }
}

fn response_in(doc: &Value, command: &str) -> Result<Option<ResponseEnvelope>, InvocationError> {
    let Some(response) = doc.get("response") else {
        return Ok(None);
    };
    serde_json::from_value(response.clone())
        .map(Some)
        .map_err(|source| InvocationError::MalformedResponse {
            command: command.to_string(),
            source,
        })
}
