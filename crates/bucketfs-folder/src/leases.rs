//! Bounded concurrent task group ("leases").
//!
//! A lease is one slot of a semaphore; work runs as a spawned task holding
//! its lease until completion. Aborting the group cancels waiting acquirers
//! and running tasks cooperatively.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

/// Semaphore-bounded task group with cooperative abort.
pub struct ParallelLeases {
    name: &'static str,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
}

impl ParallelLeases {
    /// Creates a group running at most `limit` tasks at once.
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self {
            name,
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Token cancelled when the group is aborted; hand it to spawned work
    /// that has its own cancellation points.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Waits for a lease, then spawns `fut` holding it. Returns false
    /// without spawning when the group was aborted first.
    pub async fn run_one<F>(&self, label: String, fut: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.cancel.is_cancelled() {
            return false;
        }
        let permit = tokio::select! {
            _ = self.cancel.cancelled() => return false,
            permit = self.semaphore.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => return false,
            },
        };
        let cancel = self.cancel.clone();
        let name = self.name;
        self.tracker.spawn(async move {
            let _lease = permit;
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!(group = name, label = %label, "lease aborted");
                }
                _ = fut => {}
            }
        });
        true
    }

    /// Waits until every spawned task has finished.
    pub async fn wait_all_done(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }

    /// Aborts outstanding work and waits for running tasks to wind down.
    pub async fn abort_and_wait(&self) {
        self.cancel.cancel();
        self.wait_all_done().await;
    }
}
