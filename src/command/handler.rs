use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use super::types::CommandInfo;

/// Something that can run a command with positional JSON arguments.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value>;

    /// Self-description advertised when the handler is registered without
    /// an explicit one.
    fn describe(&self) -> Option<String> {
        None
    }
}

/// Adapts an async closure.
pub struct AsyncFnHandler<F>(F);

#[async_trait]
impl<F, Fut> CommandHandler for AsyncFnHandler<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        (self.0)(args).await
    }
}

/// Adapts a blocking closure; each call runs on the blocking thread pool.
pub struct BlockingFnHandler<F>(Arc<F>);

#[async_trait]
impl<F> CommandHandler for BlockingFnHandler<F>
where
    F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
{
    async fn invoke(&self, args: Vec<Value>) -> anyhow::Result<Value> {
        let f = Arc::clone(&self.0);
        tokio::task::spawn_blocking(move || f(args))
            .await
            .map_err(|e| anyhow::anyhow!("blocking handler did not complete: {e}"))?
    }
}

/// A registered command: how to run it and how it is advertised.
#[derive(Clone)]
pub struct HandlerRecord {
    pub handler: Arc<dyn CommandHandler>,
    pub description: String,
}

impl HandlerRecord {
    pub fn new(name: &str, handler: Arc<dyn CommandHandler>, description: Option<&str>) -> Self {
        let description = description
            .filter(|d| !d.trim().is_empty())
            .map(str::to_string)
            .or_else(|| handler.describe())
            .unwrap_or_else(|| format!("{name}: no description"));
        Self {
            handler,
            description,
        }
    }
}

impl std::fmt::Debug for HandlerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRecord")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// Command name to handler mapping. Immutable once a listener starts.
#[derive(Debug, Clone, Default)]
pub struct HandlerTable {
    records: BTreeMap<String, HandlerRecord>,
}

impl HandlerTable {
    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder::default()
    }

    pub fn get(&self, name: &str) -> Option<&HandlerRecord> {
        self.records.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.records.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.records.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The `keys` mapping of a registration document.
    pub fn command_infos(&self) -> BTreeMap<String, CommandInfo> {
        self.records
            .iter()
            .map(|(name, record)| {
                (
                    name.clone(),
                    CommandInfo {
                        info: record.description.clone(),
                    },
                )
            })
            .collect()
    }

    /// Returns the table with `name` bound to `record`, replacing any
    /// previous binding.
    pub fn with_record(mut self, name: impl Into<String>, record: HandlerRecord) -> Self {
        self.records.insert(name.into(), record);
        self
    }
}

#[derive(Default)]
pub struct HandlerTableBuilder {
    records: BTreeMap<String, HandlerRecord>,
}

impl HandlerTableBuilder {
    /// Registers an async closure.
    pub fn command<F, Fut>(self, name: &str, description: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.handler(name, Some(description), Arc::new(AsyncFnHandler(f)))
    }

    /// Registers a closure that may block (hardware I/O, long computations).
    pub fn blocking<F>(self, name: &str, description: &str, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.handler(name, Some(description), Arc::new(BlockingFnHandler(Arc::new(f))))
    }

    /// Registers a handler object; `None` falls back to
    /// [`CommandHandler::describe`].
    pub fn handler(
        mut self,
        name: &str,
        description: Option<&str>,
        handler: Arc<dyn CommandHandler>,
    ) -> Self {
        let record = HandlerRecord::new(name, handler, description);
        self.records.insert(name.to_string(), record);
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            records: self.records,
        }
    }
}
