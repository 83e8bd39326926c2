use thiserror::Error;

use crate::store::StoreError;

/// Command names claimed by more than one registration document.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{}", collision_message(.names, .holders))]
pub struct CollisionError {
    /// Colliding command names, sorted.
    pub names: Vec<String>,
    /// Ids of the peer registration documents already claiming them, sorted.
    pub holders: Vec<String>,
}

fn collision_message(names: &[String], holders: &[String]) -> String {
    let names = names.join(", ");
    match holders {
        [single] => {
            format!("command namespace already in use by registration '{single}' (commands: {names})")
        }
        holders => format!(
            "commands [{names}] already registered by documents [{}]",
            holders.join(", ")
        ),
    }
}

/// Failures that stop a listener from starting or keep it from running.
#[derive(Debug, Error)]
pub enum BusError {
    /// Bad credentials, unreachable store, invalid settings.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("registration collision: {0}")]
    Collision(#[from] CollisionError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("change feed aborted after {failures} consecutive failures: {last}")]
    FeedAborted { failures: u32, last: StoreError },

    #[error("listener task failed: {0}")]
    Task(String),
}

impl BusError {
    /// Startup failures map store errors that point at the setup (auth,
    /// unreachable server, missing database) to configuration errors.
    pub fn from_connect(err: StoreError) -> Self {
        match err {
            StoreError::Unauthorized(_)
            | StoreError::Connection(_)
            | StoreError::NotFound(_)
            | StoreError::InvalidRequest(_) => BusError::Configuration(err.to_string()),
            other => BusError::Store(other),
        }
    }
}
