use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::store::ViewName;

pub const DEFAULT_DESIGN_DOC: &str = "nedm_default";
pub const DEFAULT_REGISTRY_VIEW: &str = "export_commands";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub listener: ListenerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_uri")]
    pub uri: String,
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// Design document holding the update handler, filter and views.
    #[serde(default = "default_design_doc")]
    pub design_doc: String,
    /// Server-side update handler that timestamps writes. When unset, plain
    /// document writes are used.
    #[serde(default = "default_update_handler")]
    pub update_handler: Option<String>,
    /// `<design>/<filter>` used for the command change feed.
    #[serde(default = "default_command_filter")]
    pub command_filter: String,
    /// View (inside `design_doc`) emitting one row per registered command name.
    #[serde(default = "default_registry_view")]
    pub registry_view: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            uri: default_uri(),
            database: String::new(),
            username: None,
            password: None,
            design_doc: default_design_doc(),
            update_handler: default_update_handler(),
            command_filter: default_command_filter(),
            registry_view: default_registry_view(),
        }
    }
}

impl StoreConfig {
    pub fn registry_view_name(&self) -> ViewName {
        ViewName::new(&self.design_doc, &self.registry_view)
    }
}

fn default_uri() -> String {
    "http://localhost:5984".to_string()
}

fn default_design_doc() -> String {
    DEFAULT_DESIGN_DOC.to_string()
}

fn default_update_handler() -> Option<String> {
    Some("insert_with_timestamp".to_string())
}

fn default_command_filter() -> String {
    "execute_commands/execute_commands".to_string()
}

fn default_registry_view() -> String {
    DEFAULT_REGISTRY_VIEW.to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ListenerConfig {
    /// Keep-alive interval requested from the change feed.
    #[serde(default = "default_feed_heartbeat_ms")]
    pub feed_heartbeat_ms: u64,
    /// Consecutive unrecognized transport errors before the listener gives up.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    /// Registers the per-node `stop_<node_id>` command on every listener.
    #[serde(default = "default_true")]
    pub builtin_stop: bool,
    /// Evicts peer registrations that collide instead of failing.
    #[serde(default)]
    pub force: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            feed_heartbeat_ms: default_feed_heartbeat_ms(),
            max_consecutive_failures: default_max_consecutive_failures(),
            retry_delay_ms: default_retry_delay_ms(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            builtin_stop: true,
            force: false,
        }
    }
}

impl ListenerConfig {
    pub fn feed_heartbeat(&self) -> Duration {
        Duration::from_millis(self.feed_heartbeat_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }
}

fn default_feed_heartbeat_ms() -> u64 {
    5000
}

fn default_max_consecutive_failures() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_timeout_ms(),
        }
    }
}

impl ClientConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Daily-rolling log files are written here when set.
    #[serde(default)]
    pub log_dir: Option<String>,
    #[serde(default = "default_stdout_level")]
    pub stdout_level: String,
    #[serde(default = "default_file_level")]
    pub file_level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_dir: None,
            stdout_level: default_stdout_level(),
            file_level: default_file_level(),
        }
    }
}

fn default_stdout_level() -> String {
    "info".to_string()
}

fn default_file_level() -> String {
    "debug".to_string()
}

pub fn load_settings() -> Result<Settings, config::ConfigError> {
    let config_path = env::var("COUCHBUS_CONFIG").unwrap_or_else(|_| "config".to_string());
    load_settings_from(&config_path)
}

/// Loads `path` (any format the `config` crate knows; missing is fine) and
/// overlays `COUCHBUS__<SECTION>__<KEY>` environment variables.
pub fn load_settings_from(path: &str) -> Result<Settings, config::ConfigError> {
    let settings: Settings = config::Config::builder()
        .add_source(config::File::with_name(path).required(false))
        .add_source(
            config::Environment::with_prefix("COUCHBUS")
                .prefix_separator("__")
                .separator("__"),
        )
        .build()?
        .try_deserialize()?;

    Ok(settings)
}
