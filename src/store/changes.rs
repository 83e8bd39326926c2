use futures::stream::BoxStream;
use serde_json::Value;
use std::time::Duration;

use super::errors::StoreError;

/// A lazy sequence of change notifications. It ends when the server closes
/// the feed and yields an error when the transport breaks.
pub type ChangeStream = BoxStream<'static, Result<ChangeNotification, StoreError>>;

/// One item read from a continuous change subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeNotification {
    /// A changed document, delivered with its body.
    Document { id: String, doc: Value },
    /// Keep-alive marker emitted by the transport while the feed is idle.
    Heartbeat,
}

/// Where a subscription starts reading.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Since {
    /// Only changes made after the subscription was opened.
    #[default]
    Now,
    Sequence(String),
}

impl Since {
    pub fn as_param(&self) -> &str {
        match self {
            Since::Now => "now",
            Since::Sequence(seq) => seq,
        }
    }
}

/// Server-side predicate applied to the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeFilter {
    /// Unanswered `type == "command"` documents whose `execute` is one of
    /// `names`. An empty list accepts any command name.
    Commands { names: Vec<String> },
    /// Exactly the listed document ids.
    DocIds(Vec<String>),
}

impl ChangeFilter {
    /// Evaluates the filter locally. Stores that cannot filter server-side
    /// (and the in-memory store) use this.
    pub fn matches(&self, id: &str, doc: &Value) -> bool {
        match self {
            ChangeFilter::Commands { names } => {
                if doc.get("type").and_then(Value::as_str) != Some("command") {
                    return false;
                }
                if doc.get("response").is_some() {
                    return false;
                }
                if names.is_empty() {
                    return true;
                }
                match doc.get("execute").and_then(Value::as_str) {
                    Some(name) => names.iter().any(|n| n == name),
                    // Malformed commands still reach the listener so they get an answer.
                    None => true,
                }
            }
            ChangeFilter::DocIds(ids) => ids.iter().any(|d| d == id),
        }
    }
}

/// Options for opening a change subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangesRequest {
    pub since: Since,
    pub include_docs: bool,
    pub heartbeat: Duration,
    pub filter: ChangeFilter,
}

impl ChangesRequest {
    pub fn commands(names: Vec<String>, heartbeat: Duration) -> Self {
        Self {
            since: Since::Now,
            include_docs: true,
            heartbeat,
            filter: ChangeFilter::Commands { names },
        }
    }

    pub fn doc_ids(ids: Vec<String>, heartbeat: Duration) -> Self {
        Self {
            since: Since::Now,
            include_docs: true,
            heartbeat,
            filter: ChangeFilter::DocIds(ids),
        }
    }
}

/// Result of decoding one line of a continuous feed.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedLine {
    Notification(ChangeNotification),
    /// `{"last_seq": ...}`: the server is closing the feed.
    End,
    /// A change row without a document body (deletions, `include_docs=false`).
    Skip,
}

/// Decodes one newline-delimited line of a continuous `_changes` response.
pub fn parse_feed_line(line: &[u8]) -> Result<FeedLine, StoreError> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return Ok(FeedLine::Notification(ChangeNotification::Heartbeat));
    }

    let value: Value = serde_json::from_slice(trimmed)?;
    if value.get("last_seq").is_some() {
        return Ok(FeedLine::End);
    }
    if let Some(err) = value.get("error").and_then(Value::as_str) {
        let reason = value
            .get("reason")
            .and_then(Value::as_str)
            .unwrap_or_default();
        return Err(StoreError::Connection(format!("feed error {err}: {reason}")));
    }

    let Some(id) = value.get("id").and_then(Value::as_str) else {
        return Ok(FeedLine::Skip);
    };
    match value.get("doc") {
        Some(doc) if doc.is_object() => Ok(FeedLine::Notification(ChangeNotification::Document {
            id: id.to_string(),
            doc: doc.clone(),
        })),
        _ => Ok(FeedLine::Skip),
    }
}
