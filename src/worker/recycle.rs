//! Request budget for proactive worker recycling.
//!
//! Each worker draws its own limit in `[max_requests, max_requests + jitter]`
//! so workers booted together do not all restart at the same moment.

use std::future;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;
use tokio::sync::Notify;

use crate::config::BindConfig;

/// Per-worker recycling limit, `None` when recycling is disabled.
pub fn recycle_limit<R: Rng + ?Sized>(max_requests: u64, jitter: u64, rng: &mut R) -> Option<u64> {
    if max_requests == 0 {
        return None;
    }
    let extra = if jitter > 0 { rng.gen_range(0..=jitter) } else { 0 };
    Some(max_requests.saturating_add(extra))
}

/// Counts served requests and signals once the limit is reached.
#[derive(Debug)]
pub struct RequestBudget {
    limit: Option<u64>,
    served: AtomicU64,
    exhausted: Notify,
}

impl RequestBudget {
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit,
            served: AtomicU64::new(0),
            exhausted: Notify::new(),
        }
    }

    pub fn from_config(config: &BindConfig) -> Self {
        Self::new(recycle_limit(
            config.max_requests,
            config.max_requests_jitter,
            &mut rand::thread_rng(),
        ))
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    pub fn served(&self) -> u64 {
        self.served.load(Ordering::Relaxed)
    }

    /// Record one served request. Returns true exactly once, when this request
    /// used up the budget.
    pub fn record_served(&self) -> bool {
        let served = self.served.fetch_add(1, Ordering::AcqRel) + 1;
        if self.limit == Some(served) {
            self.exhausted.notify_one();
            true
        } else {
            false
        }
    }

    /// Resolves once the budget is used up; never resolves when recycling is disabled.
    pub async fn exhausted(&self) {
        if self.limit.is_none() {
            return future::pending().await;
        }
        self.exhausted.notified().await;
    }
}
