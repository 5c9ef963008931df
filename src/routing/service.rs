//! Validated service definitions built from the routing table.

use std::time::Duration;

use http::header::{HeaderName, HeaderValue};
use http::Uri;

use crate::config::{RoutePattern, ServiceConfig};
use crate::error::ConfigError;

/// One backend base URL, parsed once at boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInstance {
    base_url: String,
    tls: bool,
    /// Authority as written, used as the upstream `Host` header.
    authority: String,
    host: String,
    port: u16,
    /// Path prefix without trailing slash; empty for bare hosts.
    base_path: String,
}

impl ServiceInstance {
    /// Parses `scheme://host[:port][/prefix]`.
    ///
    /// Only `http` and `https` are accepted; the port defaults to the
    /// scheme's well-known port.
    pub fn parse(raw: &str) -> Result<Self, String> {
        let uri: Uri = raw.parse().map_err(|e| format!("{}", e))?;

        let tls = match uri.scheme_str() {
            Some("http") => false,
            Some("https") => true,
            Some(other) => return Err(format!("unsupported scheme '{}'", other)),
            None => return Err("missing scheme".to_string()),
        };

        let authority = uri.authority().ok_or_else(|| "missing host".to_string())?;
        if authority.host().is_empty() {
            return Err("missing host".to_string());
        }
        if uri.query().is_some() {
            return Err("query strings are not allowed in instance URLs".to_string());
        }

        let port = authority.port_u16().unwrap_or(if tls { 443 } else { 80 });

        Ok(Self {
            base_url: raw.trim_end_matches('/').to_string(),
            tls,
            authority: authority.as_str().to_string(),
            host: authority.host().to_string(),
            port,
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    /// The configured base URL, used as the instance identity in logs and
    /// health tracking.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// True for `https` instances.
    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// `host[:port]` as written in the base URL, sent as the `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// `host:port` suitable for DNS resolution.
    pub fn socket_target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Host without IPv6 brackets.
    pub fn sni(&self) -> String {
        self.host
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string()
    }

    /// Path and query sent to the backend for a resolved target.
    pub fn upstream_path(&self, target: &str, query: Option<&str>) -> String {
        let mut path = format!("{}{}", self.base_path, target);
        if path.is_empty() {
            path.push('/');
        }
        if let Some(q) = query.filter(|q| !q.is_empty()) {
            path.push('?');
            path.push_str(q);
        }
        path
    }
}

/// A named backend with its transport policy, instances and owned routes.
#[derive(Debug, Clone)]
pub struct ServiceDefinition {
    pub name: String,
    pub timeout: Duration,
    pub keep_alive: Duration,
    pub custom_headers: Vec<(HeaderName, HeaderValue)>,
    /// Never empty.
    pub instances: Vec<ServiceInstance>,
    pub routes: Vec<RoutePattern>,
}

impl ServiceDefinition {
    /// Validates one routing table entry.
    pub fn from_config(name: &str, config: &ServiceConfig) -> Result<Self, ConfigError> {
        if config.instances.is_empty() {
            return Err(ConfigError::NoInstances {
                service: name.to_string(),
            });
        }

        let instances = config
            .instances
            .iter()
            .map(|raw| {
                ServiceInstance::parse(raw).map_err(|message| ConfigError::InvalidInstance {
                    service: name.to_string(),
                    instance: raw.clone(),
                    message,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let custom_headers = config
            .header_pairs()
            .into_iter()
            .map(|(key, value)| parse_header(name, &key, &value))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: name.to_string(),
            timeout: config.timeout(),
            keep_alive: config.keep_alive(),
            custom_headers,
            instances,
            routes: config.routes.clone(),
        })
    }
}

fn parse_header(
    service: &str,
    key: &str,
    value: &str,
) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let invalid = |message: String| ConfigError::InvalidHeader {
        service: service.to_string(),
        name: key.to_string(),
        message,
    };

    let name = HeaderName::from_bytes(key.as_bytes()).map_err(|e| invalid(e.to_string()))?;
    let value = HeaderValue::from_str(value).map_err(|e| invalid(e.to_string()))?;
    Ok((name, value))
}
