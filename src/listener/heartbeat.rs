use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::command::HeartbeatDocument;
use crate::store::DocumentStore;

const LOG_TARGET: &str = "couchbus::listener::heartbeat";

/// Periodically upserts the node's heartbeat document until cancelled.
pub struct HeartbeatPublisher {
    store: Arc<dyn DocumentStore>,
    node_id: String,
    interval: Duration,
    cancel: CancellationToken,
}

impl HeartbeatPublisher {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        node_id: impl Into<String>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            node_id: node_id.into(),
            interval: interval.max(Duration::from_millis(1)),
            cancel,
        }
    }

    /// Publishes immediately, then once per interval. A failed write is
    /// logged and the store handle replaced with a fresh one; the loop never
    /// exits on errors.
    pub async fn run(self) {
        let doc_id = HeartbeatDocument::doc_id(&self.node_id);
        let mut store = self.store;
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(target: LOG_TARGET, doc_id = %doc_id, interval = ?self.interval, "Heartbeat started");

        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let beat = HeartbeatDocument::new(&self.node_id).to_value();
            match store.upsert(&doc_id, beat).await {
                Ok(()) => debug!(target: LOG_TARGET, doc_id = %doc_id, "Heartbeat written"),
                Err(e) => {
                    warn!(target: LOG_TARGET, doc_id = %doc_id, error = %e, "Heartbeat write failed, reacquiring store handle");
                    store = store.reacquire();
                }
            }
        }

        info!(target: LOG_TARGET, doc_id = %doc_id, "Heartbeat stopped");
    }
}
