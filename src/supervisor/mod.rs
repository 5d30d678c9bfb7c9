//! Worker supervisor.
//!
//! The supervisor owns no listening socket. It spawns `server.workers`
//! re-executions of the current binary in worker mode, hands each one the
//! resolved configuration through the environment, and keeps that many alive:
//! a worker that exits (recycled, timed out, crashed) is replaced in the same
//! slot. A worker that fails to boot or to load the application halts the
//! whole supervisor, since its replacement would fail the same way.
//!
//! On SIGTERM/SIGINT every worker receives SIGTERM and gets
//! `server.graceful_timeout` to finish before it is killed.

pub mod process;

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch};

use crate::config::{ConfigError, ServerConfig, WORKER_CONFIG_ENV};
use crate::http::shutdown;
use crate::worker::{EXIT_APP_LOAD_ERROR, EXIT_BOOT_ERROR, EXIT_OK, EXIT_TIMEOUT};

use process::{Pidfile, ProcessError};

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: io::Error,
    },

    #[error("Worker {worker} failed to boot")]
    WorkerBoot { worker: usize },

    #[error("Worker {worker} failed to load the application")]
    AppLoad { worker: usize },
}

/// A worker that lived shorter than this is replaced only after [`RESPAWN_DELAY`]
pub const MIN_WORKER_LIFETIME: Duration = Duration::from_secs(1);

pub const RESPAWN_DELAY: Duration = Duration::from_secs(1);

/// What the supervisor does after a worker exits while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitAction {
    Respawn,
    Halt,
}

/// Boot and load failures halt; everything else is replaced.
///
/// `code` is `None` when the worker was killed by a signal.
pub fn exit_action(code: Option<i32>) -> ExitAction {
    match code {
        Some(EXIT_BOOT_ERROR) | Some(EXIT_APP_LOAD_ERROR) => ExitAction::Halt,
        _ => ExitAction::Respawn,
    }
}

/// Pause before replacing a worker, so one that dies right after boot is not
/// re-forked in a tight loop.
pub fn respawn_delay(lifetime: Duration) -> Option<Duration> {
    (lifetime < MIN_WORKER_LIFETIME).then_some(RESPAWN_DELAY)
}

/// Reported by a worker's watcher task once the process is gone.
#[derive(Debug)]
struct WorkerExit {
    worker: usize,
    pid: Option<u32>,
    code: Option<i32>,
    lifetime: Duration,
}

pub struct Supervisor {
    config: ServerConfig,
    executable: PathBuf,
    log_filter: Option<String>,
}

impl Supervisor {
    /// `executable` is re-executed in worker mode; `log_filter` is forwarded to workers.
    pub fn new(config: ServerConfig, executable: PathBuf, log_filter: Option<String>) -> Self {
        Self {
            config,
            executable,
            log_filter,
        }
    }

    /// Run until a shutdown signal arrives or a worker cannot boot.
    pub async fn run(self) -> Result<(), SupervisorError> {
        let worker_config = self.config.to_toml_string()?;
        let _pidfile = self
            .config
            .process
            .pidfile
            .as_deref()
            .map(Pidfile::create)
            .transpose()?;

        let count = self.config.server.worker_count();
        let grace = self.config.server.graceful_timeout();

        tracing::info!(
            pid = std::process::id(),
            bind = %self.config.server.bind,
            workers = count,
            worker_class = %self.config.server.worker_class,
            proc_name = %self.config.process.proc_name,
            "Starting supervisor"
        );

        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let mut running: HashMap<usize, Option<u32>> = HashMap::with_capacity(count);
        let mut outcome = Ok(());

        for worker in 0..count {
            match self.spawn_worker(worker, &worker_config, &exit_tx, &stop_rx, grace) {
                Ok(pid) => {
                    running.insert(worker, pid);
                }
                Err(e) => {
                    outcome = Err(e);
                    break;
                }
            }
        }

        let shutdown = shutdown::shutdown_signal();
        tokio::pin!(shutdown);

        while outcome.is_ok() {
            tokio::select! {
                signal = &mut shutdown => {
                    tracing::info!(signal, "Received shutdown signal, stopping workers");
                    break;
                }
                Some(exit) = exit_rx.recv() => {
                    running.remove(&exit.worker);
                    log_exit(&exit);

                    if exit_action(exit.code) == ExitAction::Halt {
                        outcome = Err(if exit.code == Some(EXIT_APP_LOAD_ERROR) {
                            SupervisorError::AppLoad { worker: exit.worker }
                        } else {
                            SupervisorError::WorkerBoot { worker: exit.worker }
                        });
                        break;
                    }

                    if let Some(delay) = respawn_delay(exit.lifetime) {
                        tracing::warn!(
                            worker = exit.worker,
                            delay_ms = delay.as_millis() as u64,
                            "Worker exited right after boot, delaying respawn"
                        );
                        tokio::select! {
                            signal = &mut shutdown => {
                                tracing::info!(signal, "Received shutdown signal, stopping workers");
                                break;
                            }
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }

                    match self.spawn_worker(exit.worker, &worker_config, &exit_tx, &stop_rx, grace) {
                        Ok(pid) => {
                            running.insert(exit.worker, pid);
                        }
                        Err(e) => outcome = Err(e),
                    }
                }
            }
        }

        let _ = stop_tx.send(true);
        while !running.is_empty() {
            match exit_rx.recv().await {
                Some(exit) => {
                    running.remove(&exit.worker);
                    tracing::debug!(worker = exit.worker, pid = ?exit.pid, code = ?exit.code, "Worker stopped");
                }
                None => break,
            }
        }

        tracing::info!("Supervisor exiting");
        outcome
    }

    fn spawn_worker(
        &self,
        worker: usize,
        worker_config: &str,
        exits: &mpsc::UnboundedSender<WorkerExit>,
        stop: &watch::Receiver<bool>,
        grace: Duration,
    ) -> Result<Option<u32>, SupervisorError> {
        let mut command = Command::new(&self.executable);
        if let Some(filter) = &self.log_filter {
            command.arg("--log-level").arg(filter);
        }
        command
            .arg("worker")
            .arg("--worker-id")
            .arg(worker.to_string())
            .env(WORKER_CONFIG_ENV, worker_config)
            .stdin(Stdio::null())
            .stdout(Stdio::inherit())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.arg0(format!("{}: worker", self.config.process.proc_name));

        let child = command
            .spawn()
            .map_err(|source| SupervisorError::Spawn { worker, source })?;
        let pid = child.id();
        tracing::info!(worker, pid = ?pid, "Booting worker");

        tokio::spawn(watch_worker(
            worker,
            child,
            stop.clone(),
            grace,
            exits.clone(),
        ));
        Ok(pid)
    }
}

fn log_exit(exit: &WorkerExit) {
    match exit.code {
        Some(EXIT_OK) => {
            tracing::info!(worker = exit.worker, pid = ?exit.pid, "Worker exited, replacing it")
        }
        Some(EXIT_TIMEOUT) => {
            tracing::error!(worker = exit.worker, pid = ?exit.pid, "Worker timed out, replacing it")
        }
        Some(EXIT_BOOT_ERROR) => {
            tracing::error!(worker = exit.worker, pid = ?exit.pid, "Worker failed to boot")
        }
        Some(EXIT_APP_LOAD_ERROR) => {
            tracing::error!(worker = exit.worker, pid = ?exit.pid, "App failed to load")
        }
        Some(code) => tracing::error!(
            worker = exit.worker,
            pid = ?exit.pid,
            code,
            "Worker exited with failure, replacing it"
        ),
        None => tracing::error!(
            worker = exit.worker,
            pid = ?exit.pid,
            "Worker was killed by a signal, replacing it"
        ),
    }
}

/// Wait for the worker to exit on its own, or stop it when the supervisor stops.
async fn watch_worker(
    worker: usize,
    mut child: Child,
    mut stop: watch::Receiver<bool>,
    grace: Duration,
    exits: mpsc::UnboundedSender<WorkerExit>,
) {
    let pid = child.id();
    let started = Instant::now();

    let exited = tokio::select! {
        status = child.wait() => Some(status),
        _ = stop.wait_for(|stopping| *stopping) => None,
    };
    let status = match exited {
        Some(status) => status,
        None => terminate(&mut child, grace).await,
    };

    let code = match status {
        Ok(status) => status.code(),
        Err(e) => {
            tracing::error!(worker, pid = ?pid, error = %e, "Failed to wait for worker");
            None
        }
    };

    let _ = exits.send(WorkerExit {
        worker,
        pid,
        code,
        lifetime: started.elapsed(),
    });
}

/// SIGTERM, then SIGKILL once `grace` has passed.
async fn terminate(child: &mut Child, grace: Duration) -> io::Result<ExitStatus> {
    request_stop(child);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => status,
        Err(_) => {
            tracing::warn!(
                pid = ?child.id(),
                grace_secs = grace.as_secs(),
                "Worker did not stop in time, killing it"
            );
            child.kill().await?;
            child.wait().await
        }
    }
}

#[cfg(unix)]
fn request_stop(child: &mut Child) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        tracing::warn!(pid, error = %e, "Failed to send SIGTERM to worker");
    }
}

#[cfg(not(unix))]
fn request_stop(child: &mut Child) {
    if let Err(e) = child.start_kill() {
        tracing::warn!(error = %e, "Failed to stop worker");
    }
}
