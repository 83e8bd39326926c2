//! The listening side of the bus: registration, change-feed consumption,
//! heartbeat and lifecycle control.

pub mod control;
pub mod errors;
pub mod feed;
pub mod heartbeat;
pub mod registry;
pub mod retry;

pub use control::{ControlHandle, ListenOptions, STOP_COMMAND, listen, stop_command_name};
pub use errors::{BusError, CollisionError};
pub use feed::ChangeFeedListener;
pub use heartbeat::HeartbeatPublisher;
pub use registry::CommandRegistry;
pub use retry::{RetryDecision, RetryPolicy, RetryState};

#[cfg(test)]
mod control_tests;
#[cfg(test)]
mod feed_tests;
