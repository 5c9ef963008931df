//! Request authorization.
//!
//! Order of checks for a routed path:
//! 1. public endpoint: allowed without credentials
//! 2. trusted source: caller IP inside a configured network, allowed
//! 3. otherwise the configured validator decides
//!
//! A validator error denies the request.

mod trusted;
mod validator;

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;

use crate::config::SecurityConfig;
use crate::error::ConfigError;

pub use trusted::TrustedSources;
pub use validator::{AuthDecision, AuthError, CredentialValidator, ValidatorRegistry};

/// What the gate and validators see of an inbound request.
#[derive(Debug, Clone, Copy)]
pub struct AuthRequest<'a> {
    pub path: &'a str,
    pub headers: &'a HeaderMap,
    pub client_ip: Option<IpAddr>,
}

/// Outcome of [`AuthGate::authenticate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Public,
    TrustedSource,
    Validated,
    Denied(String),
}

impl Verdict {
    /// Anything but a denial lets the request through.
    pub fn is_allowed(&self) -> bool {
        !matches!(self, Verdict::Denied(_))
    }
}

/// Immutable authorization policy built from the security section.
pub struct AuthGate {
    public: HashSet<String>,
    trusted: TrustedSources,
    validator: Option<Arc<dyn CredentialValidator>>,
}

impl AuthGate {
    /// Builds the gate around an already resolved validator.
    pub fn new(
        security: &SecurityConfig,
        validator: Option<Arc<dyn CredentialValidator>>,
    ) -> Result<Self, ConfigError> {
        Ok(Self {
            public: security.public_endpoints.iter().cloned().collect(),
            trusted: TrustedSources::parse(&security.trusted_sources)?,
            validator,
        })
    }

    /// Builds the gate, resolving the validator through `registry`.
    pub fn from_config(
        security: &SecurityConfig,
        registry: &ValidatorRegistry,
    ) -> Result<Self, ConfigError> {
        let validator = registry.resolve(security)?;
        Self::new(security, validator)
    }

    /// True when `path` is listed in `public_endpoints`.
    pub fn is_public(&self, path: &str) -> bool {
        self.public.contains(path)
    }

    /// Identifier of the configured validator, if any.
    pub fn validator_name(&self) -> Option<&str> {
        self.validator.as_deref().map(|v| v.name())
    }

    /// Fails if a non-public route exists and no validator is configured.
    ///
    /// Such a route could never be served, so the misconfiguration is
    /// reported at boot instead of as a 401 on every request.
    pub fn check_coverage<'a>(
        &self,
        patterns: impl IntoIterator<Item = &'a str>,
    ) -> Result<(), ConfigError> {
        if self.validator.is_some() {
            return Ok(());
        }

        let uncovered = patterns
            .into_iter()
            .filter(|pattern| !self.is_public(pattern))
            .min();

        match uncovered {
            Some(pattern) => Err(ConfigError::MissingValidator {
                pattern: pattern.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Decides whether `request` may be forwarded.
    pub async fn authenticate(&self, request: &AuthRequest<'_>) -> Verdict {
        if self.is_public(request.path) {
            return Verdict::Public;
        }

        if let Some(ip) = request.client_ip {
            if self.trusted.contains(ip) {
                return Verdict::TrustedSource;
            }
        }

        let Some(validator) = self.validator.as_ref() else {
            return Verdict::Denied("no validator configured".to_string());
        };

        match validator.validate(request).await {
            Ok(AuthDecision::Allowed) => Verdict::Validated,
            Ok(AuthDecision::Denied(reason)) => Verdict::Denied(reason),
            Err(e) => {
                tracing::error!(
                    validator = validator.name(),
                    path = request.path,
                    error = %e,
                    "credential validation failed"
                );
                Verdict::Denied(e.to_string())
            }
        }
    }
}
