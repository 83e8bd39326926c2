use std::time::Duration;
use thiserror::Error;

use crate::store::StoreError;

/// Failures surfaced to the caller of a remote command.
#[derive(Debug, Error)]
pub enum InvocationError {
    /// The command document could not be written; nothing was sent.
    #[error("failed to write command '{command}': {source}")]
    Write {
        command: String,
        #[source]
        source: StoreError,
    },

    /// The remote handler failed. `content` is the response text as written
    /// by the listener.
    #[error("command '{command}' failed remotely: {content}")]
    Remote { command: String, content: String },

    #[error("command '{command}' got no response within {timeout:?}")]
    Timeout { command: String, timeout: Duration },

    #[error("malformed response to '{command}': {source}")]
    MalformedResponse {
        command: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("response feed failed: {0}")]
    Feed(#[from] StoreError),
}

impl InvocationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, InvocationError::Timeout { .. })
    }
}
