pub mod command_doc_factory;
pub mod handler_table_factory;
pub mod registration_factory;

pub use command_doc_factory::CommandDocFactory;
pub use handler_table_factory::HandlerTableFactory;
pub use registration_factory::RegistrationFactory;
