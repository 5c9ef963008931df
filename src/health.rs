//! HTTP health server for liveness and readiness probes.
//!
//! `/healthz` answers `ok` while the process runs. `/readyz` reports the
//! loaded routing table and any instances the tracker currently marks
//! unhealthy. Unhealthy instances are informational only, so readiness
//! stays 200.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{HeaderValue, CONTENT_TYPE};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use pingora_core::server::ShutdownWatch;
use pingora_core::services::background::BackgroundService;
use serde::Serialize;
use tokio::net::TcpListener;

use crate::proxy::HealthTracker;

/// Data the probes report on.
pub struct HealthState {
    pub tracker: Arc<HealthTracker>,
    pub services: usize,
    pub routes: usize,
}

#[derive(Debug, Serialize)]
struct Readiness {
    status: &'static str,
    services: usize,
    routes: usize,
    unhealthy_instances: Vec<String>,
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

fn readiness(state: &HealthState) -> Response<Full<Bytes>> {
    let unhealthy_instances = state.tracker.unhealthy_instances();
    let report = Readiness {
        status: if unhealthy_instances.is_empty() {
            "ready"
        } else {
            "degraded"
        },
        services: state.services,
        routes: state.routes,
        unhealthy_instances,
    };

    match serde_json::to_vec(&report) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/json; charset=utf-8"),
            );
            response
        }
        Err(e) => {
            tracing::error!(error = %e, "failed to encode readiness report");
            text(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
        }
    }
}

/// Builds the probe response for `path`.
pub fn route(path: &str, state: &HealthState) -> Response<Full<Bytes>> {
    match path {
        "/healthz" => text(StatusCode::OK, "ok"),
        "/readyz" => readiness(state),
        _ => text(StatusCode::NOT_FOUND, "not found"),
    }
}

/// hyper service function for the probe listener.
pub async fn health_handler(
    req: Request<hyper::body::Incoming>,
    state: Arc<HealthState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    Ok(route(req.uri().path(), &state))
}

/// Accepts probe connections on `listener` until the task is dropped.
pub async fn serve(listener: TcpListener, state: Arc<HealthState>) -> std::io::Result<()> {
    loop {
        let (stream, _) = listener.accept().await?;
        let io = TokioIo::new(stream);
        let state = Arc::clone(&state);

        tokio::spawn(async move {
            let service = service_fn(move |req| health_handler(req, Arc::clone(&state)));
            if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
                tracing::debug!(error = %e, "health connection error");
            }
        });
    }
}

/// Runs the probe listener alongside the proxy and stops with the server.
pub struct HealthService {
    addr: SocketAddr,
    state: Arc<HealthState>,
}

impl HealthService {
    /// Probe server for `addr`. Binding happens when the service starts.
    pub fn new(addr: SocketAddr, state: HealthState) -> Self {
        Self {
            addr,
            state: Arc::new(state),
        }
    }
}

#[async_trait]
impl BackgroundService for HealthService {
    async fn start(&self, mut shutdown: ShutdownWatch) {
        let listener = match TcpListener::bind(self.addr).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(addr = %self.addr, error = %e, "failed to bind health server");
                return;
            }
        };
        tracing::info!(addr = %self.addr, "health server listening");

        tokio::select! {
            result = serve(listener, Arc::clone(&self.state)) => {
                if let Err(e) = result {
                    tracing::error!(error = %e, "health server stopped");
                }
            }
            _ = shutdown.changed() => {
                tracing::info!("health server shutting down");
            }
        }
    }
}
