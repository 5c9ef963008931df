//! Credential validators and the boot-time registry that selects one.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use http::header::AUTHORIZATION;
use thiserror::Error;

use crate::config::SecurityConfig;
use crate::error::ConfigError;

use super::AuthRequest;

/// Outcome of a credential check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthDecision {
    Allowed,
    /// Denied, with a reason for the logs. Never sent to the caller.
    Denied(String),
}

/// The validator could not reach a decision.
#[derive(Debug, Error)]
#[error("validator '{validator}' failed: {message}")]
pub struct AuthError {
    pub validator: String,
    pub message: String,
}

/// Decides whether a non-public request carries acceptable credentials.
#[async_trait]
pub trait CredentialValidator: Send + Sync {
    /// Identifier this validator is registered under.
    fn name(&self) -> &str;

    async fn validate(&self, request: &AuthRequest<'_>) -> Result<AuthDecision, AuthError>;
}

/// Accepts `Authorization: Bearer <token>` for tokens listed in
/// `security.user_tokens`.
pub struct BearerTokenValidator {
    tokens: HashSet<String>,
}

impl BearerTokenValidator {
    pub const NAME: &'static str = "bearer";

    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    fn from_config(security: &SecurityConfig) -> Result<Arc<dyn CredentialValidator>, ConfigError> {
        let tokens: Vec<String> = security
            .user_tokens
            .iter()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        if tokens.is_empty() {
            return Err(ConfigError::ValidatorMisconfigured {
                validator: Self::NAME.to_string(),
                reason: "security.user_tokens is empty".to_string(),
            });
        }
        Ok(Arc::new(Self::new(tokens)))
    }
}

#[async_trait]
impl CredentialValidator for BearerTokenValidator {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(&self, request: &AuthRequest<'_>) -> Result<AuthDecision, AuthError> {
        let Some(value) = request.headers.get(AUTHORIZATION) else {
            return Ok(AuthDecision::Denied("missing authorization header".to_string()));
        };

        let token = value
            .to_str()
            .ok()
            .and_then(|v| {
                let (scheme, token) = v.trim().split_once(' ')?;
                scheme.eq_ignore_ascii_case("bearer").then(|| token.trim())
            });

        match token {
            Some(token) if self.tokens.contains(token) => Ok(AuthDecision::Allowed),
            Some(_) => Ok(AuthDecision::Denied("unknown bearer token".to_string())),
            None => Ok(AuthDecision::Denied("malformed authorization header".to_string())),
        }
    }
}

/// Admits nobody by credentials. Only callers already matched by the
/// trusted-source check get through.
pub struct TrustedSourceOnlyValidator;

impl TrustedSourceOnlyValidator {
    pub const NAME: &'static str = "trusted_sources";

    fn from_config(security: &SecurityConfig) -> Result<Arc<dyn CredentialValidator>, ConfigError> {
        if security.trusted_sources.iter().all(|group| group.is_empty()) {
            return Err(ConfigError::ValidatorMisconfigured {
                validator: Self::NAME.to_string(),
                reason: "security.trusted_sources is empty".to_string(),
            });
        }
        Ok(Arc::new(Self))
    }
}

#[async_trait]
impl CredentialValidator for TrustedSourceOnlyValidator {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn validate(&self, _request: &AuthRequest<'_>) -> Result<AuthDecision, AuthError> {
        Ok(AuthDecision::Denied("caller is not a trusted source".to_string()))
    }
}

/// Builds a validator from the security section.
pub type ValidatorFactory =
    Box<dyn Fn(&SecurityConfig) -> Result<Arc<dyn CredentialValidator>, ConfigError> + Send + Sync>;

/// Maps `user_token_validation` identifiers to validator factories.
///
/// Consulted once at boot. Unknown identifiers are a configuration error,
/// never a runtime fallback.
pub struct ValidatorRegistry {
    factories: BTreeMap<String, ValidatorFactory>,
}

impl ValidatorRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with `bearer` and `trusted_sources`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(BearerTokenValidator::NAME, BearerTokenValidator::from_config);
        registry.register(
            TrustedSourceOnlyValidator::NAME,
            TrustedSourceOnlyValidator::from_config,
        );
        registry
    }

    /// Adds or replaces the factory for `name`.
    pub fn register<F>(&mut self, name: &str, factory: F)
    where
        F: Fn(&SecurityConfig) -> Result<Arc<dyn CredentialValidator>, ConfigError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(name.to_string(), Box::new(factory));
    }

    /// Registered identifiers, sorted.
    pub fn names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Builds the validator named by `security.user_token_validation`.
    ///
    /// Returns `Ok(None)` when no validator is named.
    pub fn resolve(
        &self,
        security: &SecurityConfig,
    ) -> Result<Option<Arc<dyn CredentialValidator>>, ConfigError> {
        let name = security.user_token_validation.trim();
        if name.is_empty() {
            return Ok(None);
        }

        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| ConfigError::UnknownValidator {
                name: name.to_string(),
                known: self.names().join(", "),
            })?;
        factory(security).map(Some)
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}
