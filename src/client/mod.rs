//! The calling side of the bus.

pub mod errors;
pub mod invoke;

pub use errors::InvocationError;
pub use invoke::RemoteInvocationClient;
