//! Immutable pattern -> service mapping.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use http::uri::PathAndQuery;

use crate::config::{RoutePattern, ServiceConfig};
use crate::error::{ConfigError, DispatchError};

use super::ServiceDefinition;

/// A registered route and the service that owns it.
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub service: Arc<ServiceDefinition>,
    /// Position of `service` in [`RouteRegistry::services`].
    pub service_index: usize,
    pub route: RoutePattern,
}

impl RouteEntry {
    /// Path used when forwarding to the backend.
    pub fn target(&self) -> &str {
        self.route.target_path()
    }
}

/// Maps every configured route pattern to its owning service.
///
/// Built once at boot and never mutated afterwards, so concurrent reads need
/// no synchronization.
#[derive(Debug)]
pub struct RouteRegistry {
    routes: HashMap<String, RouteEntry>,
    services: Vec<Arc<ServiceDefinition>>,
}

impl RouteRegistry {
    /// Builds the registry from the routing table.
    ///
    /// Fails if the table is empty, a service has no instances, a pattern
    /// or target is not an absolute path, or a pattern is registered twice.
    pub fn build(routing: &BTreeMap<String, ServiceConfig>) -> Result<Self, ConfigError> {
        let services = routing
            .iter()
            .map(|(name, config)| ServiceDefinition::from_config(name, config))
            .collect::<Result<Vec<_>, _>>()?;

        Self::from_services(services)
    }

    /// Builds the registry from already validated service definitions.
    pub fn from_services(services: Vec<ServiceDefinition>) -> Result<Self, ConfigError> {
        if services.is_empty() {
            return Err(ConfigError::EmptyRouting);
        }

        let mut routes: HashMap<String, RouteEntry> = HashMap::new();
        let mut owned = Vec::with_capacity(services.len());

        for (service_index, service) in services.into_iter().enumerate() {
            if service.instances.is_empty() {
                return Err(ConfigError::NoInstances {
                    service: service.name.clone(),
                });
            }

            let service = Arc::new(service);
            for route in &service.routes {
                if route.pattern.is_empty() {
                    return Err(ConfigError::EmptyRoutePattern {
                        service: service.name.clone(),
                    });
                }
                check_route_path(&service.name, "pattern", &route.pattern)?;
                if !route.target.is_empty() {
                    check_route_path(&service.name, "target", &route.target)?;
                }

                if let Some(existing) = routes.get(&route.pattern) {
                    return Err(ConfigError::DuplicateRoute {
                        pattern: route.pattern.clone(),
                        first: existing.service.name.clone(),
                        second: service.name.clone(),
                    });
                }

                routes.insert(
                    route.pattern.clone(),
                    RouteEntry {
                        service: Arc::clone(&service),
                        service_index,
                        route: route.clone(),
                    },
                );
            }
            owned.push(service);
        }

        Ok(Self {
            routes,
            services: owned,
        })
    }

    /// Finds the route registered for an exact path.
    pub fn lookup(&self, path: &str) -> Result<&RouteEntry, DispatchError> {
        self.routes
            .get(path)
            .ok_or_else(|| DispatchError::RouteNotFound {
                path: path.to_string(),
            })
    }

    /// All services, in routing table order.
    pub fn services(&self) -> &[Arc<ServiceDefinition>] {
        &self.services
    }

    /// All registered patterns.
    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Number of registered patterns.
    pub fn route_count(&self) -> usize {
        self.routes.len()
    }
}

/// A pattern or target must be an absolute path with no query or fragment,
/// since it is matched against and joined onto request paths.
fn check_route_path(service: &str, field: &'static str, value: &str) -> Result<(), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidRoutePath {
        service: service.to_string(),
        field,
        value: value.to_string(),
        message,
    };

    if !value.starts_with('/') {
        return Err(invalid("must start with '/'".to_string()));
    }
    if value.contains(['?', '#']) {
        return Err(invalid("must not contain a query or fragment".to_string()));
    }
    value
        .parse::<PathAndQuery>()
        .map_err(|e| invalid(e.to_string()))?;
    Ok(())
}
