//! Configuration schema.
//!
//! Mirrors the YAML parameters file. Every section is optional at the serde
//! level; semantic checks (non-empty routing, instances, unique patterns)
//! happen when the route registry and service clients are built.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

/// Backend timeout used when a service leaves `timeout` unset or non-positive.
pub const DEFAULT_SERVICE_TIMEOUT_SECS: u64 = 360;

/// Pool idle keep-alive used when a service leaves `keep_alive` unset or
/// non-positive.
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 60_000;

/// Root configuration, parsed once at boot and read-only afterwards.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub debug: bool,
    #[serde(rename = "app_env")]
    pub environment: String,
    pub esb: EsbConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
    /// Service name -> service definition. Ordered so boot diagnostics and
    /// duplicate-route reports are deterministic.
    pub routing: BTreeMap<String, ServiceConfig>,
}

impl AppConfig {
    /// Default proxy listen address derived from `esb.port`.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.esb.port)
    }
}

/// Public address of the gateway itself.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EsbConfig {
    pub scheme: String,
    pub host: String,
    pub port: u16,
}

impl Default for EsbConfig {
    fn default() -> Self {
        Self {
            scheme: "http".to_string(),
            host: "localhost".to_string(),
            port: 80,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log file path. Empty means stdout.
    pub file: String,
    pub rotate: LogRotation,
    /// `EnvFilter` directive, e.g. `info` or `esb_gateway=debug`.
    pub level: String,
}

/// Rolling period for the log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    #[default]
    Never,
    Minutely,
    Hourly,
    Daily,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Paths that bypass authentication entirely (exact match).
    pub public_endpoints: Vec<String>,
    /// Identifier of the credential validator, e.g. `bearer`.
    pub user_token_validation: String,
    /// Groups of IPs / CIDR blocks allowed without credentials.
    pub trusted_sources: Vec<Vec<String>>,
    #[serde(rename = "service_alias")]
    pub service_alias_name: String,
    /// Accepted tokens for the `bearer` validator.
    pub user_tokens: Vec<String>,
}

/// One backend service: its instances and the routes it owns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Seconds.
    pub timeout: i64,
    /// Milliseconds.
    pub keep_alive: i64,
    pub custom_headers: Vec<BTreeMap<String, String>>,
    pub instances: Vec<String>,
    pub routes: Vec<RoutePattern>,
}

impl ServiceConfig {
    pub fn timeout(&self) -> Duration {
        match u64::try_from(self.timeout) {
            Ok(secs) if secs > 0 => Duration::from_secs(secs),
            _ => Duration::from_secs(DEFAULT_SERVICE_TIMEOUT_SECS),
        }
    }

    pub fn keep_alive(&self) -> Duration {
        match u64::try_from(self.keep_alive) {
            Ok(ms) if ms > 0 => Duration::from_millis(ms),
            _ => Duration::from_millis(DEFAULT_KEEP_ALIVE_MS),
        }
    }

    /// Custom headers flattened in declaration order.
    pub fn header_pairs(&self) -> Vec<(String, String)> {
        self.custom_headers
            .iter()
            .flat_map(|map| map.iter().map(|(k, v)| (k.clone(), v.clone())))
            .collect()
    }
}

/// An inbound path and the optional path it is rewritten to upstream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct RoutePattern {
    pub pattern: String,
    /// Empty means "forward `pattern` unchanged".
    #[serde(default)]
    pub target: String,
}

impl RoutePattern {
    pub fn new(pattern: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            target: target.into(),
        }
    }

    /// Path used when forwarding to the backend.
    pub fn target_path(&self) -> &str {
        if self.target.is_empty() {
            &self.pattern
        } else {
            &self.target
        }
    }
}
