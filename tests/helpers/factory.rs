pub use super::factories::{CommandDocFactory, HandlerTableFactory, RegistrationFactory};

pub struct Factory;

impl Factory {
    pub fn command_doc() -> CommandDocFactory {
        CommandDocFactory::new()
    }

    pub fn handler_table() -> HandlerTableFactory {
        HandlerTableFactory::new()
    }

    pub fn registration() -> RegistrationFactory {
        RegistrationFactory::new()
    }
}
