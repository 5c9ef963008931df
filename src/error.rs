//! Error types for boot-time configuration and per-request dispatch.
//!
//! Boot errors (`ConfigError`) are fatal: the process logs the cause and
//! exits. Dispatch errors are contained to the request that produced them
//! and are rendered into an HTTP response.

use std::path::PathBuf;

use thiserror::Error;

/// Fatal boot-time errors. Serving with a configuration that produced one of
/// these is never attempted.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file could not be read.
    #[error("failed to read config '{}': {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Config file exists but holds no YAML document.
    #[error("configuration file '{}' is empty", path.display())]
    EmptyConfigFile { path: PathBuf },

    /// YAML parsing error.
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_saphyr::Error),

    #[error("did not find any routes for the server")]
    EmptyRouting,

    #[error("service '{service}' has no instances")]
    NoInstances { service: String },

    #[error("service '{service}' has invalid instance '{instance}': {message}")]
    InvalidInstance {
        service: String,
        instance: String,
        message: String,
    },

    #[error("service '{service}' declares a route with an empty pattern")]
    EmptyRoutePattern { service: String },

    /// A route pattern or target that can never be a request path.
    #[error("service '{service}' has invalid route {field} '{value}': {message}")]
    InvalidRoutePath {
        service: String,
        field: &'static str,
        value: String,
        message: String,
    },

    /// Two registrations for one dispatch key. Last-wins would silently
    /// reroute traffic, so the registry refuses to build.
    #[error("route pattern '{pattern}' is registered by both '{first}' and '{second}'")]
    DuplicateRoute {
        pattern: String,
        first: String,
        second: String,
    },

    #[error("service '{service}' has invalid custom header '{name}': {message}")]
    InvalidHeader {
        service: String,
        name: String,
        message: String,
    },

    #[error("invalid trusted source '{value}': expected an IP address or CIDR block")]
    InvalidTrustedSource { value: String },

    #[error("unknown user token validation '{name}' (known: {known})")]
    UnknownValidator { name: String, known: String },

    #[error("route '{pattern}' is not public but no user token validation is configured")]
    MissingValidator { pattern: String },

    #[error("user token validation '{validator}' is misconfigured: {reason}")]
    ValidatorMisconfigured { validator: String, reason: String },
}

/// Per-request failures that short-circuit before the backend is contacted.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("no route for path '{path}'")]
    RouteNotFound { path: String },

    #[error("unauthorized request to '{path}': {reason}")]
    Unauthorized { path: String, reason: String },
}

impl DispatchError {
    /// HTTP status the caller receives.
    pub fn status(&self) -> u16 {
        match self {
            DispatchError::RouteNotFound { .. } => 404,
            DispatchError::Unauthorized { .. } => 401,
        }
    }
}

/// How a forward to a backend instance failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamFailure {
    /// Connect, read or write deadline elapsed.
    Timeout,
    /// Refused, unreachable, reset or unresolvable.
    Connect,
    /// Backend answered with something that is not valid HTTP.
    Protocol,
}

/// Transport failure while forwarding to a backend instance.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("upstream {failure:?} for service '{service}' at '{instance}': {message}")]
pub struct UpstreamError {
    pub service: String,
    pub instance: String,
    pub failure: UpstreamFailure,
    pub message: String,
}

impl UpstreamError {
    /// 504 when a deadline elapsed, 502 for every other transport failure.
    pub fn status(&self) -> u16 {
        match self.failure {
            UpstreamFailure::Timeout => 504,
            UpstreamFailure::Connect | UpstreamFailure::Protocol => 502,
        }
    }
}
