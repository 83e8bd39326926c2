pub mod model;

pub use model::{
    ClientConfig, ListenerConfig, LoggingConfig, Settings, StoreConfig, load_settings,
    load_settings_from,
};
