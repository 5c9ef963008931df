//! Gateway configuration.
//!
//! Parsed once at boot from a YAML parameters file and passed explicitly to
//! everything derived from it. There is no process-wide config value.

mod loader;
mod schema;

pub use loader::{load_config, parse_config, DEFAULT_CONFIG_PATH};
pub use schema::{
    AppConfig, LogRotation, LoggingConfig, RoutePattern, SecurityConfig, ServiceConfig,
};
