//! Development server.
//!
//! A single process serving the application directly, with debug logging.
//! It runs no workers, so there is no recycling, no request timeout and no
//! concurrency limit. Never use it for production traffic; `serve` is the
//! production path.

use std::net::SocketAddr;

use crate::app::{bootstrap, ApplicationFactory};
use crate::config::ProxyConfig;
use crate::error::AppError;
use crate::http::shutdown;
use crate::middleware::SchemePolicy;
use crate::proxy::ProxyTrust;
use crate::routes::{create_router, ServingLayers};

#[derive(Debug, thiserror::Error)]
pub enum DevServerError {
    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    AppLoad(#[from] AppError),
    #[error("Server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Serve the application on `addr` until Ctrl+C or SIGTERM.
pub async fn run<F: ApplicationFactory>(addr: SocketAddr, factory: &F) -> Result<(), DevServerError> {
    tracing::warn!(
        "This is a development server. Do not use it in a production deployment; \
         run `storefront serve` instead."
    );

    let app = bootstrap(factory)?;
    let trust = match ProxyTrust::from_config(&ProxyConfig::default()) {
        Ok(trust) => trust,
        Err(e) => return Err(AppError::Internal(e.to_string()).into()),
    };
    let router = create_router(app, ServingLayers::new(SchemePolicy::new(trust, false)));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| DevServerError::Bind { addr, source })?;
    tracing::info!("Starting development server at http://{}", listener.local_addr()?);
    tracing::debug!("Debug mode: on");

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let signal = shutdown::shutdown_signal().await;
        tracing::info!(signal, "Stopping development server");
    })
    .await?;

    Ok(())
}
