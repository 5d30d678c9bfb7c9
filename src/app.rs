//! Application bootstrap.
//!
//! The storefront itself is built by an external factory; this module only asks
//! the factory for its router and registers the liveness probe on it.

use axum::{routing::get, Router};

use crate::error::AppError;
use crate::routes::health;

/// Path of the liveness probe
pub const HEALTH_PATH: &str = "/health";

/// Builds the application whose routes the workers serve.
///
/// The returned router must not register `GET /health` itself.
pub trait ApplicationFactory {
    fn create_app(&self) -> Result<Router, AppError>;
}

impl<F> ApplicationFactory for F
where
    F: Fn() -> Result<Router, AppError>,
{
    fn create_app(&self) -> Result<Router, AppError> {
        self()
    }
}

/// The storefront application.
///
/// Its request handlers live outside this crate, so the router it contributes
/// here carries no routes of its own.
#[derive(Debug, Clone, Copy, Default)]
pub struct Website;

impl ApplicationFactory for Website {
    fn create_app(&self) -> Result<Router, AppError> {
        Ok(Router::new())
    }
}

/// Build the application through `factory` and register the liveness probe.
pub fn bootstrap<F: ApplicationFactory + ?Sized>(factory: &F) -> Result<Router, AppError> {
    let app = factory.create_app()?;
    tracing::debug!(path = HEALTH_PATH, "Registering liveness probe");
    Ok(app.route(HEALTH_PATH, get(health::health)))
}
