//! Route registry and service definitions.
//!
//! Both are built once from the routing table at boot and shared read-only
//! by every request afterwards.

mod registry;
mod service;

pub use registry::RouteRegistry;
pub use service::{ServiceDefinition, ServiceInstance};
