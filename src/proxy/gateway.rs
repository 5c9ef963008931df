//! Pingora ProxyHttp implementation for the gateway.
//!
//! Wires the dispatcher into Pingora's request lifecycle: dispatch in
//! `request_filter`, forward through the selected instance, then relay the
//! backend response with the service's custom headers and CORS added.
//!
//! The per-request state machine lives on [`GatewayCtx`]; the hooks only
//! hand Pingora's events to it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use http::header::HOST;
use http::Uri;
use pingora_core::prelude::*;
use pingora_core::upstreams::peer::HttpPeer;
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{ProxyHttp, Session};

use crate::error::{DispatchError, UpstreamError, UpstreamFailure};

use super::dispatcher::{Dispatcher, InboundRequest};
use super::response::{accepts_json, insert_cors, relay_headers, ErrorResponse};
use super::upstream::ForwardPlan;

/// Per-request context for the gateway proxy.
#[derive(Default)]
pub struct GatewayCtx {
    /// Selected service and instance, set once dispatch succeeds.
    pub plan: Option<ForwardPlan>,
    /// Caller asked for JSON error bodies.
    pub accepts_json: bool,
    /// Addresses resolved for the planned instance, tried in order.
    pub addresses: Vec<SocketAddr>,
    /// Index into `addresses` of the current connect attempt.
    pub attempt: usize,
    /// The exchange with the backend must finish by this instant.
    pub deadline: Option<Instant>,
    /// A failure was already reported to the health tracker.
    pub failure_recorded: bool,
}

impl GatewayCtx {
    /// Peer for the current connect attempt.
    ///
    /// The first call resolves the instance and starts the service
    /// deadline; retries reuse the resolved addresses.
    pub async fn next_peer(&mut self) -> Result<HttpPeer> {
        let Some(plan) = self.plan.as_ref() else {
            return Err(Error::explain(
                ErrorType::InternalError,
                "request was not dispatched",
            ));
        };

        if self.addresses.is_empty() {
            self.deadline = Some(Instant::now() + plan.client.definition().timeout);
            self.addresses = plan.client.resolve(&plan.instance).await?;
        } else {
            check_deadline(self.deadline, Instant::now(), ErrorType::ConnectTimedout)?;
        }

        let addr = self.addresses.get(self.attempt).copied().ok_or_else(|| {
            Error::explain(ErrorType::InternalError, "no resolved address left to try")
        })?;
        Ok(plan.client.peer(plan, addr))
    }

    /// Handles a failed connect. Marks the error retryable while resolved
    /// addresses remain, otherwise reports the instance as failed.
    pub fn connect_failed(&mut self, mut e: Box<Error>) -> Box<Error> {
        if self.attempt + 1 < self.addresses.len() {
            self.attempt += 1;
            tracing::debug!(
                attempt = self.attempt,
                addresses = self.addresses.len(),
                error = %e,
                "connect failed, trying next address"
            );
            e.set_retry(true);
            return e;
        }

        self.record_failure(&e.to_string());
        e
    }

    /// Handles the backend's response header: the forward succeeded, so
    /// the instance is reported healthy and the header is prepared for the
    /// caller.
    pub fn response_received(&mut self, header: &mut ResponseHeader) -> Result<()> {
        check_deadline(self.deadline, Instant::now(), ErrorType::ReadTimedout)?;

        let Some(plan) = self.plan.as_ref() else {
            return insert_cors(header);
        };
        plan.client.record_success(&plan.instance);
        relay_headers(&plan.client.definition().custom_headers, header)
    }

    /// Enforces the deadline while the body is relayed. The final chunk is
    /// always let through.
    pub fn body_received(&self, end_of_stream: bool) -> Result<()> {
        if end_of_stream {
            return Ok(());
        }
        check_deadline(self.deadline, Instant::now(), ErrorType::ReadTimedout)
    }

    /// Reports a failed request and returns the status the caller gets.
    /// Zero means nothing is written.
    pub fn proxy_failed(&mut self, e: &Error) -> u16 {
        if matches!(e.esource(), ErrorSource::Downstream) {
            return downstream_status(e);
        }

        let Some(plan) = self.plan.as_ref() else {
            tracing::error!(error = %e, "request failed before dispatch");
            return 502;
        };

        let err = upstream_error(plan, e);
        tracing::error!(
            service = %err.service,
            instance = %err.instance,
            url = %plan.url(),
            failure = ?err.failure,
            error = %e,
            "upstream request failed"
        );
        self.record_failure(&err.message);
        err.status()
    }

    fn record_failure(&mut self, reason: &str) {
        if self.failure_recorded {
            return;
        }
        if let Some(plan) = self.plan.as_ref() {
            plan.client.record_failure(&plan.instance, reason);
            self.failure_recorded = true;
        }
    }
}

/// Gateway proxy that dispatches requests to configured services.
pub struct GatewayProxy {
    dispatcher: Arc<Dispatcher>,
}

impl GatewayProxy {
    /// Proxy serving every request through `dispatcher`.
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    fn log_rejection(err: &DispatchError) {
        match err {
            DispatchError::Unauthorized { path, reason } => {
                tracing::warn!(path = %path, reason = %reason, "request denied");
            }
            DispatchError::RouteNotFound { path } => {
                tracing::debug!(path = %path, "no route");
            }
        }
    }
}

#[async_trait]
impl ProxyHttp for GatewayProxy {
    type CTX = GatewayCtx;

    fn new_ctx(&self) -> Self::CTX {
        GatewayCtx::default()
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool>
    where
        Self::CTX: Send + Sync,
    {
        let client_ip = session
            .client_addr()
            .and_then(|addr| addr.as_inet())
            .map(|addr| addr.ip());

        let req = session.req_header();
        ctx.accepts_json = accepts_json(&req.headers);
        let inbound = InboundRequest {
            path: req.uri.path(),
            query: req.uri.query(),
            headers: &req.headers,
            client_ip,
        };

        let outcome = self.dispatcher.dispatch(&inbound).await;
        match outcome {
            Ok(plan) => {
                ctx.plan = Some(plan);
                Ok(false)
            }
            Err(err) => {
                Self::log_rejection(&err);
                let response = ErrorResponse::for_status(err.status(), ctx.accepts_json);
                write_error(session, &response).await?;
                Ok(true)
            }
        }
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        Ok(Box::new(ctx.next_peer().await?))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        if let Some(plan) = ctx.plan.as_ref() {
            upstream_request.set_uri(upstream_uri(plan)?);
            upstream_request.insert_header(HOST, plan.instance.authority())?;
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()>
    where
        Self::CTX: Send + Sync,
    {
        ctx.response_received(upstream_response)
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        _body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>>
    where
        Self::CTX: Send + Sync,
    {
        ctx.body_received(end_of_stream)?;
        Ok(None)
    }

    fn fail_to_connect(
        &self,
        _session: &mut Session,
        _peer: &HttpPeer,
        ctx: &mut Self::CTX,
        e: Box<Error>,
    ) -> Box<Error> {
        ctx.connect_failed(e)
    }

    async fn fail_to_proxy(&self, session: &mut Session, e: &Error, ctx: &mut Self::CTX) -> u16
    where
        Self::CTX: Send + Sync,
    {
        let status = ctx.proxy_failed(e);

        if status > 0 && session.response_written().is_none() {
            let response = ErrorResponse::for_status(status, ctx.accepts_json);
            if let Err(write_err) = write_error(session, &response).await {
                tracing::debug!(error = %write_err, "failed to write error response");
            }
        }
        status
    }

    async fn logging(&self, session: &mut Session, _e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = session
            .response_written()
            .map(|r| r.status.as_u16())
            .unwrap_or(0);

        let method = session.req_header().method.as_str();
        let path = session.req_header().uri.path();
        let service = ctx.plan.as_ref().map(|p| p.service()).unwrap_or("-");
        let instance = ctx
            .plan
            .as_ref()
            .map(|p| p.instance.base_url())
            .unwrap_or("-");

        tracing::info!(
            method = method,
            path = path,
            status = status,
            service = service,
            instance = instance,
            "request completed"
        );
    }
}

async fn write_error(session: &mut Session, response: &ErrorResponse) -> Result<()> {
    session
        .write_response_header(Box::new(response.to_header()?), false)
        .await?;
    session
        .write_response_body(Some(response.body.clone()), true)
        .await
}

/// Path and query sent to the backend as a request URI.
pub fn upstream_uri(plan: &ForwardPlan) -> Result<Uri> {
    plan.upstream_path.parse::<Uri>().map_err(|e| {
        Error::explain(
            ErrorType::InternalError,
            format!("invalid upstream path '{}': {}", plan.upstream_path, e),
        )
    })
}

/// Describes a failed forward for the log and the health tracker.
pub fn upstream_error(plan: &ForwardPlan, e: &Error) -> UpstreamError {
    UpstreamError {
        service: plan.service().to_string(),
        instance: plan.instance.base_url().to_string(),
        failure: classify(e),
        message: e.to_string(),
    }
}

/// Maps a Pingora transport error onto the gateway's failure kinds.
pub fn classify(e: &Error) -> UpstreamFailure {
    match e.etype() {
        ErrorType::ConnectTimedout
        | ErrorType::ReadTimedout
        | ErrorType::WriteTimedout
        | ErrorType::TLSHandshakeTimedout => UpstreamFailure::Timeout,
        ErrorType::InvalidHTTPHeader
        | ErrorType::H1Error
        | ErrorType::H2Error
        | ErrorType::InvalidH2 => UpstreamFailure::Protocol,
        _ => UpstreamFailure::Connect,
    }
}

/// Fails with `etype` once `now` is past `deadline`.
fn check_deadline(deadline: Option<Instant>, now: Instant, etype: ErrorType) -> Result<()> {
    match deadline {
        Some(deadline) if now > deadline => Err(Error::explain(
            etype,
            "service timeout elapsed before the backend finished",
        )),
        _ => Ok(()),
    }
}

/// Status for errors caused by the caller. Zero means the caller is gone
/// and nothing is written.
fn downstream_status(e: &Error) -> u16 {
    match e.etype() {
        ErrorType::WriteError | ErrorType::ReadError | ErrorType::ConnectionClosed => 0,
        _ => 400,
    }
}
