use thiserror::Error;

/// Errors raised by a [`DocumentStore`](super::DocumentStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The transport failed in a way that is not known to be benign
    /// (refused connection, reset, DNS failure, ...).
    #[error("connection error: {0}")]
    Connection(String),

    /// A streamed body was cut short (truncated chunk, partial line).
    /// Continuous feeds do this routinely; callers simply resubscribe.
    #[error("stream interrupted: {0}")]
    Interrupted(String),

    #[error("HTTP {status}: {reason}")]
    Http { status: u16, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("document update conflict: {0}")]
    Conflict(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Expected feed disruptions that warrant an immediate resubscription.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Interrupted(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound(_))
    }

    /// Maps a non-success status code to the matching variant.
    pub fn from_status(status: u16, reason: impl Into<String>) -> Self {
        let reason = reason.into();
        match status {
            401 | 403 => StoreError::Unauthorized(reason),
            404 => StoreError::NotFound(reason),
            409 => StoreError::Conflict(reason),
            _ => StoreError::Http { status, reason },
        }
    }
}
