//! HTTP dispatch and forwarding.
//!
//! Matches inbound paths against the route registry, authorizes them,
//! and forwards to the owning service's instances in round-robin order
//! with report-only health tracking.

mod dispatcher;
mod gateway;
mod response;
mod upstream;

pub use dispatcher::Dispatcher;
pub use gateway::GatewayProxy;
pub use upstream::HealthTracker;
