use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use super::errors::BusError;
use super::feed::ChangeFeedListener;
use super::heartbeat::HeartbeatPublisher;
use super::registry::CommandRegistry;
use super::retry::RetryPolicy;
use crate::command::{
    CommandDispatcher, CommandHandler, HandlerRecord, HandlerTable, RegistrationDocument,
};
use crate::shared::config::{Settings, StoreConfig};
use crate::shared::identity::{host_name, node_id};
use crate::store::{ChangesRequest, CouchStore, DocumentStore, StoreError, ViewName};

const LOG_TARGET: &str = "couchbus::listener::control";

/// Prefix of the built-in command a listener answers to stop itself.
pub const STOP_COMMAND: &str = "stop";

/// Built-in stop command of the listener on `node_id`, e.g. `stop_daq-01`.
pub fn stop_command_name(node_id: &str) -> String {
    format!("{STOP_COMMAND}_{node_id}")
}

/// Tunables of a running listener.
#[derive(Debug, Clone)]
pub struct ListenOptions {
    pub feed_heartbeat: Duration,
    pub retry: RetryPolicy,
    pub heartbeat_interval: Duration,
    pub builtin_stop: bool,
    pub force: bool,
    pub registry_view: ViewName,
    pub node_id: String,
    /// Advertised in the registration document as `log_servers`.
    pub log_endpoints: Vec<String>,
}

impl Default for ListenOptions {
    fn default() -> Self {
        Self::from_settings(&Settings::default())
    }
}

impl ListenOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        let listener = &settings.listener;
        Self {
            feed_heartbeat: listener.feed_heartbeat(),
            retry: RetryPolicy::from_config(listener),
            heartbeat_interval: listener.heartbeat_interval(),
            builtin_stop: listener.builtin_stop,
            force: listener.force,
            registry_view: settings.store.registry_view_name(),
            node_id: node_id().to_string(),
            log_endpoints: Vec::new(),
        }
    }

    pub fn with_force(mut self, force: bool) -> Self {
        self.force = force;
        self
    }

    pub fn with_node_id(mut self, node_id: impl Into<String>) -> Self {
        self.node_id = node_id.into();
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_feed_heartbeat(mut self, interval: Duration) -> Self {
        self.feed_heartbeat = interval;
        self
    }

    pub fn with_log_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.log_endpoints = endpoints;
        self
    }

    pub fn without_builtin_stop(mut self) -> Self {
        self.builtin_stop = false;
        self
    }
}

/// The registration document of one listener; removal is idempotent.
struct Registration {
    store: Arc<dyn DocumentStore>,
    id: String,
    removed: AtomicBool,
}

impl Registration {
    async fn remove(&self) -> Result<(), StoreError> {
        if self.removed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        match self.store.delete(&self.id).await {
            Ok(()) => {
                info!(target: LOG_TARGET, registration = %self.id, "Registration removed");
                Ok(())
            }
            Err(StoreError::NotFound(_)) => Ok(()),
            Err(e) => {
                self.removed.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    fn is_removed(&self) -> bool {
        self.removed.load(Ordering::SeqCst)
    }
}

/// Handler behind the built-in `stop_<node_id>` command.
struct StopHandler {
    cancel: CancellationToken,
}

#[async_trait]
impl CommandHandler for StopHandler {
    async fn invoke(&self, _args: Vec<Value>) -> anyhow::Result<Value> {
        info!(target: LOG_TARGET, "Stop requested by command");
        self.cancel.cancel();
        Ok(Value::Bool(true))
    }

    fn describe(&self) -> Option<String> {
        Some("Stops this listener. Takes no arguments.".to_string())
    }
}

/// Owns a running listener: its handlers, store connection, registration,
/// background tasks and stop token.
pub struct ControlHandle {
    store: Arc<dyn DocumentStore>,
    handlers: Arc<HandlerTable>,
    registration: Arc<Registration>,
    stop_command: Option<String>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    listener: Option<JoinHandle<Result<(), BusError>>>,
}

impl ControlHandle {
    /// Registers the handlers, checks the namespace and starts the listener
    /// and heartbeat tasks.
    pub async fn start(
        handlers: HandlerTable,
        store: Arc<dyn DocumentStore>,
        options: ListenOptions,
    ) -> Result<Self, BusError> {
        let cancel = CancellationToken::new();
        let stop_command = options
            .builtin_stop
            .then(|| stop_command_name(&options.node_id));
        let handlers = match &stop_command {
            Some(name) => {
                if handlers.contains(name) {
                    warn!(target: LOG_TARGET, command = %name, "Replacing user command with the built-in stop");
                }
                let stop = Arc::new(StopHandler {
                    cancel: cancel.clone(),
                });
                handlers.with_record(name.clone(), HandlerRecord::new(name, stop, None))
            }
            None => handlers,
        };
        if handlers.is_empty() {
            return Err(BusError::Configuration("no commands to listen for".to_string()));
        }
        let handlers = Arc::new(handlers);
        let names = handlers.names();
        info!(target: LOG_TARGET, commands = ?names, "Tracking commands");

        let document = RegistrationDocument::new(
            options.node_id.clone(),
            host_name(),
            handlers.command_infos(),
            options.log_endpoints.clone(),
        );
        let registration_id = store.insert(document.to_value().map_err(StoreError::from)?).await?;
        let registration = Arc::new(Registration {
            store: Arc::clone(&store),
            id: registration_id.clone(),
            removed: AtomicBool::new(false),
        });

        // The built-in stop is per node; listeners sharing a host share it.
        let claimed: Vec<String> = names
            .iter()
            .filter(|name| Some(*name) != stop_command.as_ref())
            .cloned()
            .collect();
        let registry = CommandRegistry::new(Arc::clone(&store), options.registry_view.clone());
        if let Err(err) = Self::claim_namespace(&registry, &registration_id, &claimed, options.force).await {
            if let Err(e) = registration.remove().await {
                error!(target: LOG_TARGET, registration = %registration_id, error = %e, "Failed to withdraw registration");
            }
            return Err(err);
        }

        let tracker = TaskTracker::new();
        let heartbeat = HeartbeatPublisher::new(
            Arc::clone(&store),
            options.node_id.clone(),
            options.heartbeat_interval,
            cancel.clone(),
        );
        tracker.spawn(heartbeat.run());

        let dispatcher = CommandDispatcher::new(Arc::clone(&handlers), Arc::clone(&store), tracker.clone());
        let listener = ChangeFeedListener::new(
            Arc::clone(&store),
            dispatcher,
            ChangesRequest::commands(names, options.feed_heartbeat),
            options.retry.clone(),
            cancel.clone(),
        );
        let task_cancel = cancel.clone();
        let task_registration = Arc::clone(&registration);
        let listener = tokio::spawn(async move {
            let result = listener.run().await;
            if let Err(e) = &result {
                error!(target: LOG_TARGET, error = %e, "Listener terminated");
            }
            task_cancel.cancel();
            if let Err(e) = task_registration.remove().await {
                error!(target: LOG_TARGET, error = %e, "Failed to remove registration");
            }
            result
        });

        info!(target: LOG_TARGET, registration = %registration_id, "Listening for commands");
        Ok(Self {
            store,
            handlers,
            registration,
            stop_command,
            cancel,
            tracker,
            listener: Some(listener),
        })
    }

    async fn claim_namespace(
        registry: &CommandRegistry,
        registration_id: &str,
        names: &[String],
        force: bool,
    ) -> Result<(), BusError> {
        let Some(collision) = registry.find_collision(registration_id, names).await? else {
            return Ok(());
        };
        if !force {
            return Err(BusError::Collision(collision));
        }
        warn!(target: LOG_TARGET, %collision, "Forcing registration, evicting peers");
        registry.evict(&collision).await?;
        Ok(())
    }

    pub fn registration_id(&self) -> &str {
        &self.registration.id
    }

    /// Name of the built-in stop command, unless it was disabled.
    pub fn stop_command(&self) -> Option<&str> {
        self.stop_command.as_deref()
    }

    pub fn handlers(&self) -> &HandlerTable {
        &self.handlers
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn is_stopping(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Requests a cooperative stop and withdraws the registration. Commands
    /// already dispatched keep running; [`wait`](Self::wait) joins them.
    pub async fn stop_listening(&self) -> Result<(), BusError> {
        if !self.cancel.is_cancelled() {
            info!(target: LOG_TARGET, "Stop requested");
        }
        self.cancel.cancel();
        self.registration.remove().await?;
        Ok(())
    }

    /// Blocks until the listener has exited, every dispatched command has
    /// finished and the registration is gone. Returns the listener's fatal
    /// error, if it had one.
    pub async fn wait(&mut self) -> Result<(), BusError> {
        let result = match self.listener.take() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(BusError::Task(e.to_string())),
            },
            None => Ok(()),
        };

        if !self.cancel.is_cancelled() {
            warn!(target: LOG_TARGET, "Listener exited without a stop request, cleaning up");
            self.cancel.cancel();
        }
        self.tracker.close();
        self.tracker.wait().await;

        match self.registration.remove().await {
            Ok(()) => result,
            Err(e) => {
                error!(target: LOG_TARGET, error = %e, "Failed to remove registration");
                result.and(Err(BusError::Store(e)))
            }
        }
    }

    /// Writes an arbitrary document through the listener's connection.
    pub async fn write_document(&self, doc: Value) -> Result<String, BusError> {
        Ok(self.store.insert(doc).await?)
    }

    /// Requests a stop on Ctrl-C.
    pub fn stop_on_signal(&self) {
        let cancel = self.cancel.clone();
        let registration = Arc::clone(&self.registration);
        self.tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                signal = tokio::signal::ctrl_c() => {
                    if let Err(e) = signal {
                        warn!(target: LOG_TARGET, error = %e, "Cannot listen for interrupts");
                        return;
                    }
                    info!(target: LOG_TARGET, "Interrupt received, stopping");
                    cancel.cancel();
                    if let Err(e) = registration.remove().await {
                        error!(target: LOG_TARGET, error = %e, "Failed to remove registration");
                    }
                }
            }
        });
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
        if self.registration.is_removed() {
            return;
        }
        // Async cleanup needs a runtime; without one the registration is left
        // for the next forced start to evict.
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let registration = Arc::clone(&self.registration);
            runtime.spawn(async move {
                if let Err(e) = registration.remove().await {
                    warn!(target: LOG_TARGET, error = %e, "Failed to remove registration on drop");
                }
            });
        }
    }
}

/// Connects to CouchDB and starts listening for `handlers`.
pub async fn listen(
    handlers: HandlerTable,
    store: &StoreConfig,
    options: ListenOptions,
) -> Result<ControlHandle, BusError> {
    let couch = CouchStore::connect(store).await.map_err(BusError::from_connect)?;
    ControlHandle::start(handlers, Arc::new(couch), options).await
}
