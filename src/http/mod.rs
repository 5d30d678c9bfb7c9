//! HTTP server module with TLS support.
//!
//! Workers serve on a socket they bound themselves, in one of two modes:
//! - **Plain**: HTTP, usually behind a TLS-terminating proxy
//! - **TLS**: user-provided certificate and key files
//!
//! The server includes:
//! - HTTP/1 keep-alive tuning from `server.keepalive`
//! - Graceful shutdown on SIGTERM/SIGINT
//! - Certificate hot-reload via SIGHUP (TLS mode)

mod server;
pub mod shutdown;

pub use server::{bind_listener, start_server, ServerError};
