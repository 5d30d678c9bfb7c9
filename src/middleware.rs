//! Request middleware.
//!
//! - Request ID: generates a UUID v4 for each incoming request and creates a tracing
//!   span that wraps the entire request lifecycle, then emits one access log event.
//! - Scheme: classifies the request as secure or not from trusted proxy headers.
//! - Recycling and in-flight tracking: feed the worker's request budget and the
//!   timeout watchdog.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ConnectInfo, Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use http::header::{HeaderMap, HeaderName, REFERER, USER_AGENT};
use tracing::Instrument;
use uuid::Uuid;

use crate::error::AppError;
use crate::proxy::{ProxyTrust, Scheme};
use crate::worker::recycle::RequestBudget;
use crate::worker::watchdog::InFlight;

/// Target of access log events, routed to the access log writer
pub const ACCESS_LOG_TARGET: &str = "storefront::access";

/// Extension type for accessing request ID in handlers if needed.
#[derive(Clone, Debug)]
pub struct RequestId(pub Uuid);

/// Extension carrying the scheme a request was classified under.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RequestScheme(pub Scheme);

fn peer_addr(request: &Request) -> Option<SocketAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

fn header_or_dash(headers: &HeaderMap, name: HeaderName) -> String {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string()
}

/// Middleware that generates a request ID, creates a request span and writes
/// the access log line.
///
/// This should be the outermost middleware layer so the span wraps
/// all request processing, including other middleware and handlers.
pub async fn request_id_layer(request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    let method = request.method().clone();
    let uri = request.uri().clone();
    let version = request.version();
    let remote = peer_addr(&request)
        .map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let referer = header_or_dash(request.headers(), REFERER);
    let user_agent = header_or_dash(request.headers(), USER_AGENT);

    let span = tracing::info_span!(
        "request",
        request_id = %request_id,
        method = %method,
        path = %uri.path(),
        scheme = tracing::field::Empty,
        duration_ms = tracing::field::Empty,
    );

    let start = Instant::now();

    let mut request = request;
    request.extensions_mut().insert(RequestId(request_id));

    async move {
        let response = next.run(request).await;
        let duration_ms = start.elapsed().as_millis() as u64;

        tracing::Span::current().record("duration_ms", duration_ms);
        tracing::info!(
            target: ACCESS_LOG_TARGET,
            remote = %remote,
            method = %method,
            path = %uri.path(),
            query = uri.query().unwrap_or(""),
            version = ?version,
            status = response.status().as_u16(),
            referer = %referer,
            user_agent = %user_agent,
            duration_ms,
            "access"
        );

        response
    }
    .instrument(span)
    .await
}

/// Scheme classification settings shared by every request of a server.
#[derive(Clone, Debug)]
pub struct SchemePolicy {
    trust: Arc<ProxyTrust>,
    base: Scheme,
}

impl SchemePolicy {
    /// `tls` is whether the server terminates TLS itself.
    pub fn new(trust: ProxyTrust, tls: bool) -> Self {
        Self {
            trust: Arc::new(trust),
            base: if tls { Scheme::Https } else { Scheme::Http },
        }
    }
}

/// Middleware that classifies the request scheme from trusted proxy headers.
///
/// Contradicting trusted headers are rejected before the application sees them.
pub async fn scheme_layer(
    State(policy): State<SchemePolicy>,
    mut request: Request,
    next: Next,
) -> Response {
    let peer = peer_addr(&request).map(|addr| addr.ip());

    match policy.trust.classify(policy.base, peer, request.headers()) {
        Ok(scheme) => {
            tracing::Span::current().record("scheme", scheme.as_str());
            request.extensions_mut().insert(RequestScheme(scheme));
            next.run(request).await
        }
        Err(e) => {
            tracing::warn!(peer = ?peer, "Rejecting request with contradictory scheme headers");
            AppError::from(e).into_response()
        }
    }
}

/// Middleware that counts served requests toward the worker's recycling limit.
pub async fn recycle_layer(
    State(budget): State<Arc<RequestBudget>>,
    request: Request,
    next: Next,
) -> Response {
    let response = next.run(request).await;
    if budget.record_served() {
        tracing::info!(
            served = budget.served(),
            "Autorestarting worker after current request"
        );
    }
    response
}

/// Middleware that registers the request with the timeout watchdog for as
/// long as it is being processed.
pub async fn in_flight_layer(
    State(in_flight): State<Arc<InFlight>>,
    request: Request,
    next: Next,
) -> Response {
    let _guard = in_flight.begin();
    next.run(request).await
}
