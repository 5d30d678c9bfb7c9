//! Request timeout watchdog.
//!
//! Every request in progress is registered in an [`InFlight`] table. A plain OS
//! thread polls the oldest entry and terminates the worker when it has been
//! running longer than the configured timeout, so a handler blocking the async
//! runtime cannot also block its own deadline. The supervisor then replaces the
//! worker.

use std::collections::BTreeMap;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::EXIT_TIMEOUT;

/// Longest pause between two watchdog checks
const MAX_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Start times of the requests currently being processed.
#[derive(Debug, Default)]
pub struct InFlight {
    next_id: AtomicU64,
    started: Mutex<BTreeMap<u64, Instant>>,
}

/// Deregisters its request when dropped, including on cancellation.
#[derive(Debug)]
pub struct InFlightGuard {
    table: Arc<InFlight>,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.table.lock().remove(&self.id);
    }
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<u64, Instant>> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn begin(self: &Arc<Self>) -> InFlightGuard {
        self.begin_at(Instant::now())
    }

    fn begin_at(self: &Arc<Self>, started: Instant) -> InFlightGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.lock().insert(id, started);
        InFlightGuard {
            table: Arc::clone(self),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Age of the longest-running request at `now`.
    pub fn oldest_age(&self, now: Instant) -> Option<Duration> {
        // Ids grow monotonically, so the first entry started first
        self.lock()
            .values()
            .next()
            .map(|started| now.saturating_duration_since(*started))
    }

    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.oldest_age(now).is_some_and(|age| age > timeout)
    }
}

/// Spawn the watchdog thread for a worker.
pub fn spawn_watchdog(
    in_flight: Arc<InFlight>,
    timeout: Duration,
    worker_id: usize,
) -> io::Result<thread::JoinHandle<()>> {
    let interval = timeout.min(MAX_CHECK_INTERVAL);
    thread::Builder::new()
        .name(format!("watchdog-{worker_id}"))
        .spawn(move || loop {
            thread::sleep(interval);
            if in_flight.is_overdue(Instant::now(), timeout) {
                tracing::error!(
                    worker = worker_id,
                    timeout_secs = timeout.as_secs(),
                    in_flight = in_flight.len(),
                    "WORKER TIMEOUT: request exceeded deadline, terminating worker"
                );
                std::process::exit(EXIT_TIMEOUT);
            }
        })
}
