//! Health check endpoint for container orchestration.
//!
//! Provides a simple liveness probe that returns 200 OK when the process is running.
//! Used by Kubernetes, ECS, systemd, and load balancers to verify the service is alive.

use axum::{http::StatusCode, Json};
use serde::Serialize;

/// Body of a liveness probe response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
}

impl HealthStatus {
    pub const HEALTHY: HealthStatus = HealthStatus { status: "healthy" };
}

/// Health check handler.
///
/// This is a liveness probe - it only checks that the process can respond to HTTP,
/// so it reports healthy unconditionally.
pub async fn health() -> (StatusCode, Json<HealthStatus>) {
    (StatusCode::OK, Json(HealthStatus::HEALTHY))
}
