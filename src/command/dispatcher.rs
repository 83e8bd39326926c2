use serde_json::Value;
use std::sync::Arc;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::errors::DispatchError;
use super::handler::HandlerTable;
use super::types::{CommandDocument, ResponseEnvelope};
use crate::store::DocumentStore;

const LOG_TARGET: &str = "couchbus::command::dispatch";

/// Runs command documents on tracked tasks and writes their responses.
#[derive(Clone)]
pub struct CommandDispatcher {
    handlers: Arc<HandlerTable>,
    store: Arc<dyn DocumentStore>,
    tracker: TaskTracker,
}

impl CommandDispatcher {
    pub fn new(
        handlers: Arc<HandlerTable>,
        store: Arc<dyn DocumentStore>,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            handlers,
            store,
            tracker,
        }
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    /// Tracker owning every task spawned by [`dispatch`](Self::dispatch).
    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Hands a command document off to its own task and returns immediately.
    /// Malformed documents are answered without invoking any handler.
    pub fn dispatch(&self, id: String, doc: Value) {
        let this = self.clone();
        match CommandDocument::from_value(&doc) {
            Err(err) => {
                warn!(target: LOG_TARGET, doc_id = %id, error = %err, "Malformed command");
                self.tracker.spawn(async move {
                    this.respond(&id, &Err(err)).await;
                });
            }
            Ok(command) => {
                info!(target: LOG_TARGET, doc_id = %id, command = %command.execute, "Command received");
                self.tracker.spawn(async move {
                    let outcome = this.execute(command).await;
                    this.respond(&id, &outcome).await;
                });
            }
        }
    }

    /// Looks up and runs the handler. A panicking handler is reported as a
    /// failure instead of taking the task down silently.
    pub async fn execute(&self, command: CommandDocument) -> Result<(String, Value), DispatchError> {
        let CommandDocument {
            execute, arguments, ..
        } = command;
        let Some(record) = self.handlers.get(&execute) else {
            return Err(DispatchError::UnknownCommand(execute));
        };

        let handler = Arc::clone(&record.handler);
        let invocation = tokio::spawn(async move { handler.invoke(arguments).await });
        match invocation.await {
            Ok(Ok(result)) => Ok((execute, result)),
            Ok(Err(err)) => Err(DispatchError::Handler {
                command: execute,
                diagnostic: format!("{err:#}"),
            }),
            Err(join_err) => Err(DispatchError::Aborted {
                command: execute,
                reason: join_err.to_string(),
            }),
        }
    }

    /// Writes the response into the command document. Failures are logged
    /// and dropped.
    pub async fn respond(&self, id: &str, outcome: &Result<(String, Value), DispatchError>) {
        let envelope = ResponseEnvelope::from_outcome(outcome);
        match outcome {
            Ok((command, _)) => debug!(target: LOG_TARGET, doc_id = id, command = %command, "Command succeeded"),
            Err(err) => warn!(target: LOG_TARGET, doc_id = id, error = %err, "Command failed"),
        }

        let update = match envelope.to_update() {
            Ok(update) => update,
            Err(e) => {
                error!(target: LOG_TARGET, doc_id = id, error = %e, "Response could not be encoded");
                return;
            }
        };
        if let Err(e) = self.store.upsert(id, update).await {
            error!(target: LOG_TARGET, doc_id = id, error = %e, "Failed to write response");
        }
    }
}
