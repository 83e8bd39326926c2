use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::errors::BusError;
use super::retry::{RetryDecision, RetryPolicy, RetryState};
use crate::command::CommandDispatcher;
use crate::store::{ChangeNotification, ChangesRequest, DocumentStore, StoreError};

const LOG_TARGET: &str = "couchbus::listener::feed";

/// How one subscription ended.
#[derive(Debug)]
enum SubscriptionEnd {
    Stopped,
    /// Server closed the feed cleanly.
    Closed,
    Failed(StoreError),
}

/// Consumes the command change feed and hands each command to the
/// dispatcher. Delivery is at most once: every resubscription starts from
/// `now`, so commands written while disconnected are not replayed.
pub struct ChangeFeedListener {
    store: Arc<dyn DocumentStore>,
    dispatcher: CommandDispatcher,
    request: ChangesRequest,
    policy: RetryPolicy,
    cancel: CancellationToken,
}

impl ChangeFeedListener {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        dispatcher: CommandDispatcher,
        request: ChangesRequest,
        policy: RetryPolicy,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            dispatcher,
            request,
            policy,
            cancel,
        }
    }

    /// Runs until stop is requested (`Ok`) or the retry policy gives up.
    pub async fn run(self) -> Result<(), BusError> {
        let mut retry = self.policy.start();
        info!(target: LOG_TARGET, "Waiting for commands");

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let err = match self.consume_subscription(&mut retry).await {
                SubscriptionEnd::Stopped => break,
                SubscriptionEnd::Closed => {
                    debug!(target: LOG_TARGET, "Change feed closed by server, resubscribing");
                    retry.reset();
                    continue;
                }
                SubscriptionEnd::Failed(err) => err,
            };

            match self.policy.decide(&mut retry, &err) {
                RetryDecision::Immediate => {
                    info!(target: LOG_TARGET, error = %err, "Ignoring feed interruption, resubscribing");
                }
                RetryDecision::After(delay) => {
                    warn!(
                        target: LOG_TARGET,
                        error = %err,
                        failures = retry.consecutive_failures(),
                        "Change feed failed, retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = self.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                RetryDecision::Abort => {
                    error!(
                        target: LOG_TARGET,
                        error = %err,
                        failures = retry.consecutive_failures(),
                        "Seen too many connection errors, giving up"
                    );
                    return Err(BusError::FeedAborted {
                        failures: retry.consecutive_failures(),
                        last: err,
                    });
                }
            }
        }

        info!(target: LOG_TARGET, "Change feed listener stopped");
        Ok(())
    }

    async fn consume_subscription(&self, retry: &mut RetryState) -> SubscriptionEnd {
        let mut stream = match self.store.changes(self.request.clone()).await {
            Ok(stream) => stream,
            Err(err) => return SubscriptionEnd::Failed(err),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return SubscriptionEnd::Stopped,
                next = stream.next() => next,
            };

            match next {
                None => return SubscriptionEnd::Closed,
                Some(Err(err)) => return SubscriptionEnd::Failed(err),
                Some(Ok(ChangeNotification::Heartbeat)) => {
                    if self.cancel.is_cancelled() {
                        return SubscriptionEnd::Stopped;
                    }
                }
                Some(Ok(ChangeNotification::Document { id, doc })) => {
                    retry.reset();
                    // Servers without the filter function deliver every change.
                    if !self.request.filter.matches(&id, &doc) {
                        debug!(target: LOG_TARGET, doc_id = %id, "Skipping document outside the command filter");
                        continue;
                    }
                    self.dispatcher.dispatch(id, doc);
                    debug!(target: LOG_TARGET, "Waiting for next command");
                }
            }
        }
    }
}
