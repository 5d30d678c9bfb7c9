//! HTTP/HTTPS server startup logic.
//!
//! Supports two modes:
//! - Plain: no TLS
//! - TLS: user-provided certificate files

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use axum_server::Handle;
use hyper_util::rt::{TokioExecutor, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use tokio::net::TcpSocket;

use crate::config::ServerConfig;

use super::shutdown;

/// Server startup error
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind server: {0}")]
    Bind(#[from] std::io::Error),

    #[error("Failed to load TLS configuration: {0}")]
    TlsConfig(String),

    #[error("Server error: {0}")]
    Server(String),
}

impl ServerError {
    /// Whether the error happened before the server accepted its first connection.
    pub fn is_boot_failure(&self) -> bool {
        matches!(self, ServerError::Bind(_) | ServerError::TlsConfig(_))
    }
}

/// Bind a listening socket that other workers can bind as well.
///
/// Must be called from within a Tokio runtime.
pub fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<std::net::TcpListener, ServerError> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;

    let listener = socket.listen(backlog)?;
    Ok(listener.into_std()?)
}

/// Start the HTTP/HTTPS server on an already bound listener.
///
/// This function blocks until the server shuts down.
pub async fn start_server(
    app: Router,
    listener: std::net::TcpListener,
    config: &ServerConfig,
    handle: Handle,
) -> Result<(), ServerError> {
    let keepalive = config.server.keepalive();

    match config.tls.pem_files() {
        None => start_plain_server(app, listener, keepalive, handle).await,
        Some((cert_path, key_path)) => {
            start_tls_server(app, listener, cert_path, key_path, keepalive, handle).await
        }
    }
}

/// Keep-alive on with an idle window, or off entirely.
fn configure_http(builder: &mut Builder<TokioExecutor>, keepalive: Option<Duration>) {
    match keepalive {
        Some(idle) => {
            builder
                .http1()
                .keep_alive(true)
                .timer(TokioTimer::new())
                .header_read_timeout(idle);
        }
        None => {
            builder.http1().keep_alive(false);
        }
    }
}

/// Start a plain HTTP server (no TLS).
async fn start_plain_server(
    app: Router,
    listener: std::net::TcpListener,
    keepalive: Option<Duration>,
    handle: Handle,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, keepalive = ?keepalive, "Starting HTTP server (no TLS)");

    let mut server = axum_server::from_tcp(listener).handle(handle);
    configure_http(server.http_builder(), keepalive);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}

/// Start HTTPS server with user-provided certificates.
async fn start_tls_server(
    app: Router,
    listener: std::net::TcpListener,
    cert_path: &Path,
    key_path: &Path,
    keepalive: Option<Duration>,
    handle: Handle,
) -> Result<(), ServerError> {
    let addr = listener.local_addr()?;
    tracing::info!(
        %addr,
        cert = %cert_path.display(),
        key = %key_path.display(),
        "Starting HTTPS server"
    );

    let rustls_config = RustlsConfig::from_pem_file(cert_path, key_path)
        .await
        .map_err(|e| ServerError::TlsConfig(format!("Failed to load certificates: {}", e)))?;

    // Setup SIGHUP handler for certificate reload
    shutdown::setup_reload_handler(
        rustls_config.clone(),
        cert_path.to_path_buf(),
        key_path.to_path_buf(),
    );

    let mut server = axum_server::from_tcp_rustls(listener, rustls_config).handle(handle);
    configure_http(server.http_builder(), keepalive);

    server
        .serve(app.into_make_service_with_connect_info::<SocketAddr>())
        .await
        .map_err(|e| ServerError::Server(e.to_string()))
}
