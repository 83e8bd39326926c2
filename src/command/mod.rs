pub mod dispatcher;
pub mod errors;
pub mod handler;
pub mod types;

pub use dispatcher::CommandDispatcher;
pub use errors::DispatchError;
pub use handler::{CommandHandler, HandlerRecord, HandlerTable, HandlerTableBuilder};
pub use types::{
    COMMAND_TYPE, CommandDocument, CommandInfo, EXCEPTION_PREFIX, HEARTBEAT_TYPE,
    HeartbeatDocument, REGISTRATION_TYPE, RegistrationDocument, ResponseEnvelope,
};

#[cfg(test)]
mod types_tests;
