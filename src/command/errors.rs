use thiserror::Error;

/// Why a command document produced a failure response.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("command document has no 'execute' field")]
    MissingExecute,

    #[error("'execute' field must be a string")]
    InvalidExecute,

    #[error("'arguments' field must be a list (command '{command}')")]
    ArgumentsNotList { command: String },

    #[error("unknown command '{0}'")]
    UnknownCommand(String),

    /// The handler ran and returned an error; `diagnostic` carries the full
    /// error chain.
    #[error("'{command}' failed: {diagnostic}")]
    Handler { command: String, diagnostic: String },

    #[error("'{command}' panicked or was cancelled: {reason}")]
    Aborted { command: String, reason: String },
}

impl DispatchError {
    /// Malformed input, as opposed to a failure while executing a command.
    pub fn is_malformed(&self) -> bool {
        matches!(
            self,
            DispatchError::MissingExecute
                | DispatchError::InvalidExecute
                | DispatchError::ArgumentsNotList { .. }
                | DispatchError::UnknownCommand(_)
        )
    }
}
