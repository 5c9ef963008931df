//! Per-request dispatch: resolve, authenticate, select.
//!
//! Everything here is built once at boot and shared read-only; the only
//! mutable state reached per request is each client's round-robin cursor
//! and the report-only health tracker.

use std::net::IpAddr;
use std::sync::Arc;

use http::HeaderMap;

use crate::auth::{AuthGate, AuthRequest, ValidatorRegistry, Verdict};
use crate::config::AppConfig;
use crate::error::{ConfigError, DispatchError};
use crate::routing::RouteRegistry;

use super::upstream::{ForwardPlan, HealthTracker, ServiceClient};

/// The parts of an inbound request dispatch looks at.
#[derive(Debug, Clone, Copy)]
pub struct InboundRequest<'a> {
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub headers: &'a HeaderMap,
    pub client_ip: Option<IpAddr>,
}

impl<'a> InboundRequest<'a> {
    fn auth(&self) -> AuthRequest<'a> {
        AuthRequest {
            path: self.path,
            headers: self.headers,
            client_ip: self.client_ip,
        }
    }
}

pub struct Dispatcher {
    registry: RouteRegistry,
    /// One client per service, in the order of `registry.services()`.
    clients: Vec<Arc<ServiceClient>>,
    gate: AuthGate,
    health: Arc<HealthTracker>,
}

impl Dispatcher {
    /// Builds the registry, the auth gate and one client per service.
    ///
    /// Fails on any routing or security misconfiguration, including a
    /// non-public route with no validator to admit it.
    pub fn build(config: &AppConfig, validators: &ValidatorRegistry) -> Result<Self, ConfigError> {
        let registry = RouteRegistry::build(&config.routing)?;
        let gate = AuthGate::from_config(&config.security, validators)?;
        gate.check_coverage(registry.patterns())?;

        let health = Arc::new(HealthTracker::default());
        let clients = registry
            .services()
            .iter()
            .map(|service| {
                tracing::info!(
                    service = %service.name,
                    instances = service.instances.len(),
                    routes = service.routes.len(),
                    timeout_secs = service.timeout.as_secs(),
                    keep_alive_ms = service.keep_alive.as_millis() as u64,
                    "service client ready"
                );
                Arc::new(ServiceClient::new(Arc::clone(service), Arc::clone(&health)))
            })
            .collect();

        tracing::info!(
            validator = gate.validator_name().unwrap_or("none"),
            routes = registry.route_count(),
            "dispatcher ready"
        );

        Ok(Self {
            registry,
            clients,
            gate,
            health,
        })
    }

    /// Resolves a request to a forward plan, or to the error the caller
    /// receives instead.
    pub async fn dispatch(
        &self,
        request: &InboundRequest<'_>,
    ) -> Result<ForwardPlan, DispatchError> {
        let entry = self.registry.lookup(request.path)?;

        if let Verdict::Denied(reason) = self.gate.authenticate(&request.auth()).await {
            return Err(DispatchError::Unauthorized {
                path: request.path.to_string(),
                reason,
            });
        }

        let client = &self.clients[entry.service_index];
        Ok(client.forward(entry.target(), request.query))
    }

    /// The routing table this dispatcher serves.
    pub fn registry(&self) -> &RouteRegistry {
        &self.registry
    }

    /// Tracker shared by every service client.
    pub fn health(&self) -> Arc<HealthTracker> {
        Arc::clone(&self.health)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use http::header::ACCEPT;
    use http::HeaderValue;

    use super::*;
    use crate::auth::{AuthDecision, AuthError, CredentialValidator};
    use crate::config::parse_config;
    use crate::proxy::response::{accepts_json, ErrorResponse};

    struct Fixed {
        allow: bool,
    }

    #[async_trait]
    impl CredentialValidator for Fixed {
        fn name(&self) -> &str {
            if self.allow {
                "allow"
            } else {
                "deny"
            }
        }

        async fn validate(&self, _request: &AuthRequest<'_>) -> Result<AuthDecision, AuthError> {
            if self.allow {
                Ok(AuthDecision::Allowed)
            } else {
                Ok(AuthDecision::Denied("denied by policy".to_string()))
            }
        }
    }

    fn make_validators() -> ValidatorRegistry {
        let mut validators = ValidatorRegistry::with_builtin();
        validators.register("allow", |_| Ok(Arc::new(Fixed { allow: true })));
        validators.register("deny", |_| Ok(Arc::new(Fixed { allow: false })));
        validators
    }

    fn make_config(validation: &str, public: &[&str]) -> AppConfig {
        let public = public
            .iter()
            .map(|p| format!("\"{}\"", p))
            .collect::<Vec<_>>()
            .join(", ");
        parse_config(&format!(
            r#"
security:
  user_token_validation: "{validation}"
  public_endpoints: [{public}]
routing:
  billing:
    instances: ["http://a", "http://b"]
    routes:
      - pattern: /pay
        target: /v1/pay
      - pattern: /status
"#
        ))
        .unwrap()
    }

    fn make_dispatcher(validation: &str, public: &[&str]) -> Dispatcher {
        Dispatcher::build(&make_config(validation, public), &make_validators()).unwrap()
    }

    fn make_request<'a>(path: &'a str, headers: &'a HeaderMap) -> InboundRequest<'a> {
        InboundRequest {
            path,
            query: None,
            headers,
            client_ip: Some("203.0.113.7".parse().unwrap()),
        }
    }

    // ========== Phase 1: Boot ==========

    #[test]
    fn test_build_without_validator_for_private_route_fails() {
        let result = Dispatcher::build(&make_config("", &["/status"]), &make_validators());
        assert!(matches!(
            result,
            Err(ConfigError::MissingValidator { pattern }) if pattern == "/pay"
        ));
    }

    #[test]
    fn test_build_without_validator_all_public_succeeds() {
        let dispatcher = Dispatcher::build(
            &make_config("", &["/status", "/pay"]),
            &make_validators(),
        )
        .unwrap();
        assert_eq!(dispatcher.registry().route_count(), 2);
    }

    #[test]
    fn test_build_unknown_validator_fails() {
        let result = Dispatcher::build(&make_config("oauth", &[]), &make_validators());
        assert!(matches!(result, Err(ConfigError::UnknownValidator { .. })));
    }

    // ========== Phase 2: End-to-End Dispatch ==========

    #[tokio::test]
    async fn test_denied_request_is_unauthorized_with_negotiated_body() {
        let dispatcher = make_dispatcher("deny", &[]);

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        let err = dispatcher
            .dispatch(&make_request("/pay", &headers))
            .await
            .err()
            .unwrap();
        assert_eq!(err.status(), 401);

        let json = ErrorResponse::for_status(err.status(), accepts_json(&headers));
        assert_eq!(json.body, "{\"_error\":\"Unauthorized\"}");
        assert_eq!(json.content_type, "application/json; charset=utf-8");

        let plain_headers = HeaderMap::new();
        let err = dispatcher
            .dispatch(&make_request("/pay", &plain_headers))
            .await
            .err()
            .unwrap();
        let plain = ErrorResponse::for_status(err.status(), accepts_json(&plain_headers));
        assert_eq!(plain.body, "Unauthorized");
        assert_eq!(plain.content_type, "text/plain; charset=utf-8");
    }

    #[tokio::test]
    async fn test_unknown_path_is_not_found_before_auth() {
        let dispatcher = make_dispatcher("deny", &[]);
        let headers = HeaderMap::new();

        let err = dispatcher
            .dispatch(&make_request("/other", &headers))
            .await
            .err()
            .unwrap();
        assert_eq!(
            err,
            DispatchError::RouteNotFound {
                path: "/other".to_string()
            }
        );
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_allowed_requests_rotate_through_instances() {
        let dispatcher = make_dispatcher("allow", &[]);
        let headers = HeaderMap::new();

        let mut selected = Vec::new();
        for _ in 0..4 {
            let plan = dispatcher
                .dispatch(&make_request("/pay", &headers))
                .await
                .unwrap();
            assert_eq!(plan.service(), "billing");
            assert_eq!(plan.upstream_path, "/v1/pay");
            selected.push(plan.instance.base_url().to_string());
        }
        assert_eq!(selected, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[tokio::test]
    async fn test_public_path_bypasses_denying_validator() {
        let dispatcher = make_dispatcher("deny", &["/status"]);
        let headers = HeaderMap::new();

        let plan = dispatcher
            .dispatch(&make_request("/status", &headers))
            .await
            .unwrap();
        assert_eq!(plan.upstream_path, "/status");
    }

    #[tokio::test]
    async fn test_query_string_is_forwarded() {
        let dispatcher = make_dispatcher("allow", &[]);
        let headers = HeaderMap::new();
        let request = InboundRequest {
            query: Some("id=42&currency=EUR"),
            ..make_request("/pay", &headers)
        };

        let plan = dispatcher.dispatch(&request).await.unwrap();
        assert_eq!(plan.upstream_path, "/v1/pay?id=42&currency=EUR");
        assert_eq!(plan.url(), "http://a/v1/pay?id=42&currency=EUR");
    }

    #[tokio::test]
    async fn test_each_route_reaches_its_own_service() {
        let config = parse_config(
            r#"
security:
  public_endpoints: ["/pay", "/me"]
routing:
  billing:
    instances: ["http://a"]
    routes:
      - pattern: /pay
  users:
    instances: ["http://u1", "http://u2"]
    routes:
      - pattern: /me
        target: /v2/me
"#,
        )
        .unwrap();
        let dispatcher = Dispatcher::build(&config, &make_validators()).unwrap();
        let headers = HeaderMap::new();

        let pay = dispatcher
            .dispatch(&make_request("/pay", &headers))
            .await
            .unwrap();
        assert_eq!(pay.service(), "billing");
        assert_eq!(pay.instance.base_url(), "http://a");

        let me = dispatcher
            .dispatch(&make_request("/me", &headers))
            .await
            .unwrap();
        assert_eq!(me.service(), "users");
        assert_eq!(me.upstream_path, "/v2/me");
        assert_eq!(me.instance.base_url(), "http://u1");
    }

    #[tokio::test]
    async fn test_dispatcher_shares_health_tracker_with_clients() {
        let dispatcher = make_dispatcher("allow", &[]);
        let headers = HeaderMap::new();

        let plan = dispatcher
            .dispatch(&make_request("/pay", &headers))
            .await
            .unwrap();
        for _ in 0..3 {
            plan.client.record_failure(&plan.instance, "connection refused");
        }

        assert_eq!(dispatcher.health().unhealthy_instances(), vec!["http://a"]);
    }

    #[test]
    fn test_dispatcher_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Dispatcher>();
    }
}
