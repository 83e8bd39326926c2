pub mod attachment;
pub mod client;
pub mod command;
pub mod listener;
pub mod logging;
pub mod shared;
pub mod store;

pub use attachment::{AttachmentError, AttachmentStream};
pub use client::{InvocationError, RemoteInvocationClient};
pub use command::{CommandHandler, HandlerTable};
pub use listener::{BusError, ControlHandle, ListenOptions, listen};
pub use store::{CouchStore, DocumentStore, InMemoryStore, StoreError};

#[cfg(test)]
#[path = "../tests/helpers/mod.rs"]
pub mod test_helpers;
