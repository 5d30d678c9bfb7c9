//! HTTP routes and the serving middleware stack.
//!
//! The application router comes from [`crate::app::bootstrap`]; this module
//! wraps it with the layers every server applies. Request tracing is enabled
//! via middleware that generates a unique request ID for each incoming request,
//! allowing correlation of all logs within a request.

pub mod health;

use std::sync::Arc;

use axum::{middleware, Router};
use http::header::{HeaderValue, SERVER};
use tower::limit::GlobalConcurrencyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;

use crate::middleware::{
    in_flight_layer, recycle_layer, request_id_layer, scheme_layer, SchemePolicy,
};
use crate::worker::recycle::RequestBudget;
use crate::worker::watchdog::InFlight;

/// Value of the `Server` response header
pub const SERVER_HEADER: &str = "storefront";

/// Middleware applied around the application router.
#[derive(Clone, Debug)]
pub struct ServingLayers {
    pub scheme: SchemePolicy,
    /// Requests processed at once, unlimited when `None`
    pub concurrency_limit: Option<usize>,
    /// Recycling budget of a worker
    pub budget: Option<Arc<RequestBudget>>,
    /// Requests watched by the timeout watchdog
    pub in_flight: Option<Arc<InFlight>>,
}

impl ServingLayers {
    /// Only the layers every server needs: request ids, access log and scheme.
    pub fn new(scheme: SchemePolicy) -> Self {
        Self {
            scheme,
            concurrency_limit: None,
            budget: None,
            in_flight: None,
        }
    }
}

/// Wraps the application router with the serving middleware.
pub fn create_router(app: Router, layers: ServingLayers) -> Router {
    let mut router = app;

    // Innermost: only requests actually executing count as in flight
    if let Some(in_flight) = layers.in_flight {
        router = router.layer(middleware::from_fn_with_state(in_flight, in_flight_layer));
    }

    if let Some(budget) = layers.budget {
        router = router.layer(middleware::from_fn_with_state(budget, recycle_layer));
    }

    if let Some(limit) = layers.concurrency_limit {
        router = router.layer(GlobalConcurrencyLimitLayer::new(limit));
    }

    router
        .layer(SetResponseHeaderLayer::if_not_present(
            SERVER,
            HeaderValue::from_static(SERVER_HEADER),
        ))
        // Scheme layer - classifies the request from trusted proxy headers
        .layer(middleware::from_fn_with_state(layers.scheme, scheme_layer))
        // Request ID middleware - creates root span with request_id for correlation
        .layer(middleware::from_fn(request_id_layer))
}
