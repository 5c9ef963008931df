//! Reads and parses the parameters file.

use std::path::Path;

use crate::error::ConfigError;

use super::schema::AppConfig;

/// Default location of the parameters file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "app/config/parameters.yml";

/// Loads configuration from a file path.
///
/// Only syntactic problems are reported here; the routing table is checked
/// when the registry is built.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    if contents.trim().is_empty() {
        return Err(ConfigError::EmptyConfigFile {
            path: path.to_path_buf(),
        });
    }

    parse_config(&contents)
}

/// Parses configuration from a YAML string.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    Ok(serde_saphyr::from_str(contents)?)
}
