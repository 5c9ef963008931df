//! Per-service clients: round-robin instance selection, transport settings
//! and report-only health tracking.
//!
//! Selection never consults health. An instance that keeps failing stays in
//! rotation; the tracker only records it so operators (and `/readyz`) can
//! see it.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;

use crate::routing::{ServiceDefinition, ServiceInstance};

/// Consecutive failures after which an instance is reported unhealthy.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Health status of a backend instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Tracks forward outcomes per instance.
///
/// Thread-safe via DashMap. Unknown instances are considered healthy.
/// After `failure_threshold` consecutive failures an instance is marked
/// unhealthy; a single success restores it.
pub struct HealthTracker {
    health: DashMap<String, HealthStatus>,
    failures: DashMap<String, u32>,
    failure_threshold: u32,
}

impl HealthTracker {
    /// Tracker that reports an instance after `failure_threshold`
    /// consecutive failures. Zero is treated as one.
    pub fn new(failure_threshold: u32) -> Self {
        Self {
            health: DashMap::new(),
            failures: DashMap::new(),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Records a successful forward. Returns true if the instance was
    /// unhealthy before.
    pub fn record_success(&self, instance: &str) -> bool {
        self.failures.insert(instance.to_string(), 0);
        let previous = self
            .health
            .insert(instance.to_string(), HealthStatus::Healthy);
        previous == Some(HealthStatus::Unhealthy)
    }

    /// Records a failed forward. Returns true if this failure crossed the
    /// threshold.
    pub fn record_failure(&self, instance: &str) -> bool {
        let count = {
            let mut count = self.failures.entry(instance.to_string()).or_insert(0);
            *count += 1;
            *count
        };

        if count >= self.failure_threshold {
            let previous = self
                .health
                .insert(instance.to_string(), HealthStatus::Unhealthy);
            return previous != Some(HealthStatus::Unhealthy);
        }
        false
    }

    /// Instances currently marked unhealthy, sorted.
    pub fn unhealthy_instances(&self) -> Vec<String> {
        let mut unhealthy: Vec<String> = self
            .health
            .iter()
            .filter(|entry| *entry.value() == HealthStatus::Unhealthy)
            .map(|entry| entry.key().clone())
            .collect();
        unhealthy.sort();
        unhealthy
    }
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}

/// Round-robin cursor over a fixed-size instance list.
///
/// The cursor always stays in `0..len`; each call advances it with one
/// atomic read-modify-write, so concurrent callers each get a distinct slot.
#[derive(Debug, Default)]
pub struct RoundRobin {
    cursor: AtomicUsize,
}

impl RoundRobin {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next index in `0..len`. `len` must be non-zero.
    pub fn next_index(&self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }

        // fetch_update never fails when the closure always returns Some.
        match self
            .cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some((current + 1) % len)
            }) {
            Ok(previous) | Err(previous) => previous % len,
        }
    }
}

/// Outbound side of one configured service.
pub struct ServiceClient {
    definition: Arc<ServiceDefinition>,
    balancer: RoundRobin,
    health: Arc<HealthTracker>,
}

impl ServiceClient {
    pub fn new(definition: Arc<ServiceDefinition>, health: Arc<HealthTracker>) -> Self {
        Self {
            definition,
            balancer: RoundRobin::new(),
            health,
        }
    }

    /// Service name.
    pub fn name(&self) -> &str {
        &self.definition.name
    }

    /// Validated configuration this client serves.
    pub fn definition(&self) -> &ServiceDefinition {
        &self.definition
    }

    /// Selects the next instance in configured order, wrapping around.
    pub fn next_instance(&self) -> &ServiceInstance {
        let instances = &self.definition.instances;
        &instances[self.balancer.next_index(instances.len())]
    }

    /// Picks an instance and resolves where the request goes on it.
    pub fn forward(self: &Arc<Self>, target: &str, query: Option<&str>) -> ForwardPlan {
        let instance = self.next_instance().clone();
        let upstream_path = instance.upstream_path(target, query);
        ForwardPlan {
            client: Arc::clone(self),
            instance,
            upstream_path,
        }
    }

    /// Resolves every address behind an instance.
    ///
    /// Runs per request so DNS changes behind an instance name are picked
    /// up without a restart. The lookup is bounded by the service timeout.
    pub async fn resolve(&self, instance: &ServiceInstance) -> Result<Vec<SocketAddr>> {
        let target = instance.socket_target();
        let lookup = tokio::time::timeout(
            self.definition.timeout,
            tokio::net::lookup_host(target.as_str()),
        )
        .await
        .map_err(|_| {
            Error::explain(
                ErrorType::ConnectTimedout,
                format!("timed out resolving '{}'", target),
            )
        })?
        .map_err(|e| {
            Error::explain(
                ErrorType::ConnectNoRoute,
                format!("failed to resolve '{}': {}", target, e),
            )
        })?;

        let addrs: Vec<SocketAddr> = lookup.collect();
        if addrs.is_empty() {
            return Err(Error::explain(
                ErrorType::ConnectNoRoute,
                format!("no address for '{}'", target),
            ));
        }
        Ok(addrs)
    }

    /// Builds the Pingora peer for one resolved address of a plan, carrying
    /// this service's timeout and keep-alive settings.
    pub fn peer(&self, plan: &ForwardPlan, addr: SocketAddr) -> HttpPeer {
        let mut peer = HttpPeer::new(addr, plan.instance.is_tls(), plan.instance.sni());
        let timeout = self.definition.timeout;
        peer.options.connection_timeout = Some(timeout);
        peer.options.total_connection_timeout = Some(timeout);
        peer.options.read_timeout = Some(timeout);
        peer.options.write_timeout = Some(timeout);
        peer.options.idle_timeout = Some(self.definition.keep_alive);
        peer
    }

    /// Forward success callback.
    pub fn record_success(&self, instance: &ServiceInstance) {
        if self.health.record_success(instance.base_url()) {
            tracing::info!(
                service = %self.definition.name,
                instance = instance.base_url(),
                "instance recovered"
            );
        }
    }

    /// Forward failure callback.
    pub fn record_failure(&self, instance: &ServiceInstance, reason: &str) {
        if self.health.record_failure(instance.base_url()) {
            tracing::warn!(
                service = %self.definition.name,
                instance = instance.base_url(),
                reason = reason,
                "instance marked unhealthy, still in rotation"
            );
        }
    }
}

/// Where one request is forwarded.
#[derive(Clone)]
pub struct ForwardPlan {
    pub client: Arc<ServiceClient>,
    pub instance: ServiceInstance,
    /// Path and query sent upstream.
    pub upstream_path: String,
}

impl ForwardPlan {
    /// Name of the service the plan forwards to.
    pub fn service(&self) -> &str {
        self.client.name()
    }

    /// Absolute backend URL, for logs.
    pub fn url(&self) -> String {
        let scheme = if self.instance.is_tls() { "https" } else { "http" };
        format!("{}://{}{}", scheme, self.instance.authority(), self.upstream_path)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use pingora_core::upstreams::peer::Peer;

    use super::*;
    use crate::config::RoutePattern;

    fn make_definition(instances: Vec<&str>) -> Arc<ServiceDefinition> {
        Arc::new(ServiceDefinition {
            name: "billing".to_string(),
            timeout: Duration::from_secs(5),
            keep_alive: Duration::from_millis(1500),
            custom_headers: vec![],
            instances: instances
                .into_iter()
                .map(|raw| ServiceInstance::parse(raw).unwrap())
                .collect(),
            routes: vec![RoutePattern::new("/pay", "/v1/pay")],
        })
    }

    fn make_client(instances: Vec<&str>) -> Arc<ServiceClient> {
        Arc::new(ServiceClient::new(
            make_definition(instances),
            Arc::new(HealthTracker::default()),
        ))
    }

    // ========== Phase 1: HealthTracker ==========

    #[test]
    fn test_health_tracker_new_instances_are_healthy() {
        let tracker = HealthTracker::new(3);
        assert!(tracker.unhealthy_instances().is_empty());
    }

    #[test]
    fn test_health_tracker_threshold_failures_becomes_unhealthy() {
        let tracker = HealthTracker::new(3);
        assert!(!tracker.record_failure("http://a"));
        assert!(!tracker.record_failure("http://a"));
        assert!(tracker.record_failure("http://a"));
        // Further failures do not report a new transition.
        assert!(!tracker.record_failure("http://a"));
        assert_eq!(tracker.unhealthy_instances(), vec!["http://a"]);
    }

    #[test]
    fn test_health_tracker_success_resets_failure_count() {
        let tracker = HealthTracker::new(3);
        tracker.record_failure("http://a");
        tracker.record_failure("http://a");
        assert!(!tracker.record_success("http://a"));
        tracker.record_failure("http://a");
        tracker.record_failure("http://a");
        assert!(tracker.unhealthy_instances().is_empty());
    }

    #[test]
    fn test_health_tracker_success_restores_unhealthy_instance() {
        let tracker = HealthTracker::new(3);
        for _ in 0..3 {
            tracker.record_failure("http://a");
        }
        assert!(tracker.record_success("http://a"));
        assert!(tracker.unhealthy_instances().is_empty());
    }

    #[test]
    fn test_health_tracker_concurrent_updates() {
        use std::thread;

        let tracker = Arc::new(HealthTracker::new(3));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    for _ in 0..100 {
                        if i % 2 == 0 {
                            tracker.record_failure("http://a");
                        } else {
                            tracker.record_success("http://a");
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
    }

    // ========== Phase 2: Round-Robin ==========

    #[test]
    fn test_single_instance_always_selected() {
        let client = make_client(vec!["http://a"]);
        for _ in 0..5 {
            assert_eq!(client.next_instance().base_url(), "http://a");
        }
    }

    #[test]
    fn test_single_instance_does_not_advance_cursor() {
        let rr = RoundRobin::new();
        for _ in 0..5 {
            assert_eq!(rr.next_index(1), 0);
        }
        assert_eq!(rr.next_index(2), 0);
    }

    #[test]
    fn test_two_instances_alternate() {
        let client = make_client(vec!["http://a", "http://b"]);
        let selections: Vec<String> = (0..4)
            .map(|_| client.next_instance().base_url().to_string())
            .collect();
        assert_eq!(selections, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    #[test]
    fn test_three_instances_cycle_in_order() {
        let client = make_client(vec!["http://a", "http://b", "http://c"]);
        let selections: Vec<String> = (0..6)
            .map(|_| client.next_instance().base_url().to_string())
            .collect();
        assert_eq!(
            selections,
            vec!["http://a", "http://b", "http://c", "http://a", "http://b", "http://c"]
        );
    }

    #[test]
    fn test_even_distribution_over_multiple_of_n() {
        let client = make_client(vec!["http://a", "http://b", "http://c"]);

        let mut counts = HashMap::new();
        for _ in 0..99 {
            let url = client.next_instance().base_url().to_string();
            *counts.entry(url).or_insert(0) += 1;
        }

        assert_eq!(counts.get("http://a"), Some(&33));
        assert_eq!(counts.get("http://b"), Some(&33));
        assert_eq!(counts.get("http://c"), Some(&33));
    }

    #[test]
    fn test_unhealthy_instance_stays_in_rotation() {
        let client = make_client(vec!["http://a", "http://b"]);
        let b = ServiceInstance::parse("http://b").unwrap();
        for _ in 0..5 {
            client.record_failure(&b, "connection refused");
        }

        let selections: Vec<String> = (0..4)
            .map(|_| client.next_instance().base_url().to_string())
            .collect();
        assert_eq!(selections, vec!["http://a", "http://b", "http://a", "http://b"]);
    }

    // ========== Phase 3: Concurrency ==========

    #[test]
    fn test_concurrent_threads_visit_each_instance_equally() {
        use std::sync::Mutex;
        use std::thread;

        let client = make_client(vec!["http://a", "http://b", "http://c", "http://d"]);
        let counts = Arc::new(Mutex::new(HashMap::<String, usize>::new()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let client = Arc::clone(&client);
                let counts = Arc::clone(&counts);
                thread::spawn(move || {
                    for _ in 0..1000 {
                        let url = client.next_instance().base_url().to_string();
                        *counts.lock().unwrap().entry(url).or_insert(0) += 1;
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let counts = counts.lock().unwrap();
        for instance in ["http://a", "http://b", "http://c", "http://d"] {
            assert_eq!(counts.get(instance), Some(&2000), "instance {}", instance);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_tasks_visit_each_instance_equally() {
        let client = make_client(vec!["http://a", "http://b", "http://c"]);
        let counts: Arc<DashMap<String, usize>> = Arc::new(DashMap::new());

        let tasks: Vec<_> = (0..6)
            .map(|_| {
                let client = Arc::clone(&client);
                let counts = Arc::clone(&counts);
                tokio::spawn(async move {
                    for _ in 0..300 {
                        let plan = client.forward("/v1/pay", None);
                        *counts.entry(plan.instance.base_url().to_string()).or_insert(0) += 1;
                        tokio::task::yield_now().await;
                    }
                })
            })
            .collect();

        for task in tasks {
            task.await.unwrap();
        }

        for instance in ["http://a", "http://b", "http://c"] {
            assert_eq!(counts.get(instance).map(|c| *c), Some(600));
        }
    }

    #[test]
    fn test_client_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServiceClient>();
        assert_send_sync::<HealthTracker>();
        assert_send_sync::<ForwardPlan>();
    }

    // ========== Phase 4: Forward Plans and Peers ==========

    #[test]
    fn test_forward_builds_upstream_path_and_url() {
        let client = make_client(vec!["http://a:8000/base"]);
        let plan = client.forward("/v1/pay", Some("id=1"));

        assert_eq!(plan.service(), "billing");
        assert_eq!(plan.upstream_path, "/base/v1/pay?id=1");
        assert_eq!(plan.url(), "http://a:8000/base/v1/pay?id=1");
    }

    #[tokio::test]
    async fn test_resolve_literal_address() {
        let client = make_client(vec!["http://127.0.0.1:8080"]);
        let plan = client.forward("/v1/pay", None);

        let addrs = client.resolve(&plan.instance).await.unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:8080".parse::<SocketAddr>().unwrap()]);
    }

    #[tokio::test]
    async fn test_resolve_keeps_every_address() {
        let client = make_client(vec!["http://localhost:8080"]);
        let plan = client.forward("/v1/pay", None);

        let addrs = client.resolve(&plan.instance).await.unwrap();
        assert!(!addrs.is_empty());
        assert!(addrs.iter().all(|addr| addr.port() == 8080));
        assert!(addrs.iter().all(|addr| addr.ip().is_loopback()));
    }

    #[tokio::test]
    async fn test_resolve_unknown_host_is_connect_error() {
        let client = make_client(vec!["http://no-such-host.invalid:8080"]);
        let plan = client.forward("/v1/pay", None);

        let err = client.resolve(&plan.instance).await.unwrap_err();
        assert!(matches!(
            err.etype(),
            ErrorType::ConnectNoRoute | ErrorType::ConnectTimedout
        ));
    }

    #[test]
    fn test_peer_carries_service_timeouts() {
        let client = make_client(vec!["http://127.0.0.1:8080"]);
        let plan = client.forward("/v1/pay", None);
        let addr: SocketAddr = "127.0.0.1:8080".parse().unwrap();

        let peer = client.peer(&plan, addr);
        assert!(!peer.tls());
        assert_eq!(peer.options.read_timeout, Some(Duration::from_secs(5)));
        assert_eq!(peer.options.write_timeout, Some(Duration::from_secs(5)));
        assert_eq!(peer.options.connection_timeout, Some(Duration::from_secs(5)));
        assert_eq!(
            peer.options.total_connection_timeout,
            Some(Duration::from_secs(5))
        );
        assert_eq!(peer.options.idle_timeout, Some(Duration::from_millis(1500)));
    }

    #[test]
    fn test_peer_uses_the_given_address() {
        let client = make_client(vec!["https://127.0.0.1:8443"]);
        let plan = client.forward("/v1/pay", None);
        let addr: SocketAddr = "[::1]:8443".parse().unwrap();

        let peer = client.peer(&plan, addr);
        assert!(peer.tls());
        assert_eq!(peer.sni, "127.0.0.1");
        assert_eq!(peer.address().to_string(), "[::1]:8443");
    }
}
