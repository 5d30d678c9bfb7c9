//! Worker processes.
//!
//! A worker is one re-execution of the binary spawned by the supervisor. It
//! builds the async runtime matching its worker class, binds the shared
//! listening socket, drops privileges, loads the application and serves until
//! it is told to stop, used up its request budget, or timed out on a request.
//!
//! Exit codes tell the supervisor what happened:
//!
//! | code | meaning |
//! |---|---|
//! | 0 | clean exit (shutdown or recycling) |
//! | 3 | boot error (bind, TLS files, privileges) |
//! | 4 | application failed to load |
//! | 5 | a request exceeded `server.timeout` |

pub mod privileges;
pub mod recycle;
pub mod watchdog;

use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use tokio::runtime::{Builder, Runtime};

use crate::app::{bootstrap, ApplicationFactory};
use crate::config::{ConfigError, ServerConfig, WorkerClass};
use crate::error::AppError;
use crate::http::{self, shutdown, ServerError};
use crate::middleware::SchemePolicy;
use crate::proxy::ProxyTrust;
use crate::routes::{create_router, ServingLayers};

use privileges::PrivilegeError;
use recycle::RequestBudget;
use watchdog::InFlight;

pub const EXIT_OK: i32 = 0;
/// Generic failure after the worker booted
pub const EXIT_FAILURE: i32 = 1;
pub const EXIT_BOOT_ERROR: i32 = 3;
pub const EXIT_APP_LOAD_ERROR: i32 = 4;
pub const EXIT_TIMEOUT: i32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("Failed to build runtime: {0}")]
    Runtime(std::io::Error),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Server(#[from] ServerError),

    #[error(transparent)]
    Privileges(#[from] PrivilegeError),

    #[error(transparent)]
    AppLoad(#[from] AppError),

    #[error("Failed to start watchdog: {0}")]
    Watchdog(std::io::Error),
}

impl WorkerError {
    /// Process exit code reported to the supervisor
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::AppLoad(_) => EXIT_APP_LOAD_ERROR,
            WorkerError::Server(e) if !e.is_boot_failure() => EXIT_FAILURE,
            _ => EXIT_BOOT_ERROR,
        }
    }
}

/// Builds the runtime a worker class runs on.
pub fn build_runtime(class: WorkerClass) -> std::io::Result<Runtime> {
    match class {
        WorkerClass::Sync => Builder::new_current_thread().enable_all().build(),
        WorkerClass::Async => Builder::new_multi_thread().enable_all().build(),
    }
}

/// One worker process.
pub struct Worker<F> {
    id: usize,
    config: ServerConfig,
    factory: F,
}

impl<F: ApplicationFactory> Worker<F> {
    pub fn new(id: usize, config: ServerConfig, factory: F) -> Self {
        Self {
            id,
            config,
            factory,
        }
    }

    /// Run the worker to completion on its own runtime.
    pub fn run(self) -> Result<(), WorkerError> {
        let runtime =
            build_runtime(self.config.server.worker_class).map_err(WorkerError::Runtime)?;
        runtime.block_on(self.serve())
    }

    async fn serve(self) -> Result<(), WorkerError> {
        let server = &self.config.server;
        let grace = server.graceful_timeout();

        let addr = server.socket_addr()?;
        let listener = http::bind_listener(addr, server.backlog)?;
        privileges::drop_privileges(&self.config.process)?;

        let app = bootstrap(&self.factory)?;

        let trust = ProxyTrust::from_config(&self.config.proxy)
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let scheme = SchemePolicy::new(trust, self.config.tls.pem_files().is_some());

        let budget = Arc::new(RequestBudget::from_config(server));
        let in_flight = Arc::new(InFlight::new());
        if let Some(timeout) = server.timeout() {
            watchdog::spawn_watchdog(Arc::clone(&in_flight), timeout, self.id)
                .map_err(WorkerError::Watchdog)?;
        }

        let router = create_router(
            app,
            ServingLayers {
                scheme,
                concurrency_limit: Some(server.concurrency_limit()),
                budget: Some(Arc::clone(&budget)),
                in_flight: Some(in_flight),
            },
        );

        let handle = Handle::new();
        shutdown::setup_shutdown_handler(handle.clone(), grace);
        spawn_recycler(Arc::clone(&budget), handle.clone(), grace);

        tracing::info!(
            worker = self.id,
            pid = std::process::id(),
            %addr,
            worker_class = %server.worker_class,
            max_requests = ?budget.limit(),
            "Booted worker"
        );

        http::start_server(router, listener, &self.config, handle).await?;

        tracing::info!(
            worker = self.id,
            served = budget.served(),
            "Worker exiting"
        );
        Ok(())
    }
}

/// Stop accepting connections once the request budget is used up.
fn spawn_recycler(budget: Arc<RequestBudget>, handle: Handle, grace: Duration) {
    tokio::spawn(async move {
        budget.exhausted().await;
        handle.graceful_shutdown(Some(grace));
    });
}
