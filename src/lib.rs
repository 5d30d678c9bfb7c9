//! Storefront - pre-fork serving shell
//!
//! A supervisor process spawns, recycles and replaces worker processes that
//! serve the storefront application and its liveness probe, configured by a
//! single immutable TOML configuration.

pub mod app;
pub mod config;
pub mod dev;
pub mod error;
pub mod http;
pub mod logging;
pub mod middleware;
pub mod proxy;
pub mod routes;
pub mod supervisor;
pub mod worker;

pub use app::{bootstrap, ApplicationFactory, Website};
pub use config::ServerConfig;
pub use error::AppError;
