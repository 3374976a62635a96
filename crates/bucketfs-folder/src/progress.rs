//! Asynchronous progress reporting for long passes.
//!
//! The notifier keeps byte counters updated from many tasks and a ticker
//! task that periodically publishes a snapshot and logs it, so progress is
//! visible even while individual items take minutes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Published progress state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    /// Work completed so far, in the pass's unit (usually bytes).
    pub done: u64,
    /// Total work expected.
    pub total: u64,
}

impl ProgressSnapshot {
    /// Completed fraction in `[0, 1]`; 0 when the total is unknown.
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            (self.done.min(self.total)) as f64 / self.total as f64
        }
    }
}

struct ProgressState {
    label: String,
    done: AtomicU64,
    total: AtomicU64,
    tx: watch::Sender<ProgressSnapshot>,
}

impl ProgressState {
    fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            done: self.done.load(Ordering::Relaxed),
            total: self.total.load(Ordering::Relaxed),
        }
    }

    fn publish(&self) {
        let snap = self.snapshot();
        let _ = self.tx.send(snap);
    }
}

/// Progress notifier with a periodic reporting task.
pub struct AsyncProgressNotifier {
    state: Arc<ProgressState>,
    rx: watch::Receiver<ProgressSnapshot>,
    cancel: CancellationToken,
}

impl AsyncProgressNotifier {
    /// Starts a notifier reporting every `interval` under `label`.
    pub fn start(label: impl Into<String>, total: u64, interval: Duration) -> Self {
        let (tx, rx) = watch::channel(ProgressSnapshot { done: 0, total });
        let state = Arc::new(ProgressState {
            label: label.into(),
            done: AtomicU64::new(0),
            total: AtomicU64::new(total),
            tx,
        });
        let cancel = CancellationToken::new();

        let ticker_state = state.clone();
        let ticker_cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = ticker_cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                let snap = ticker_state.snapshot();
                ticker_state.publish();
                info!(
                    label = %ticker_state.label,
                    done = snap.done,
                    total = snap.total,
                    pct = (snap.fraction() * 100.0).round(),
                    "progress"
                );
            }
        });

        Self { state, rx, cancel }
    }

    /// Adds `delta` units of completed work.
    pub fn update(&self, delta: u64) {
        self.state.done.fetch_add(delta, Ordering::Relaxed);
        self.state.publish();
    }

    /// Raises the completed counter to `value` (monotone). Used by passes
    /// that only know a coarse position, such as the first byte of the
    /// current hash during sorted enumeration.
    pub fn set_done(&self, value: u64) {
        self.state.done.fetch_max(value, Ordering::Relaxed);
        self.state.publish();
    }

    /// Replaces the expected total.
    pub fn set_total(&self, total: u64) {
        self.state.total.store(total, Ordering::Relaxed);
        self.state.publish();
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> ProgressSnapshot {
        self.state.snapshot()
    }

    /// Channel receiving published snapshots.
    pub fn subscribe(&self) -> watch::Receiver<ProgressSnapshot> {
        self.rx.clone()
    }

    /// Stops the reporting task and logs the final state.
    pub fn stop(&self) {
        self.cancel.cancel();
        let snap = self.state.snapshot();
        info!(
            label = %self.state.label,
            done = snap.done,
            total = snap.total,
            "progress finished"
        );
    }
}

impl Drop for AsyncProgressNotifier {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_update_and_snapshot() {
        let notifier = AsyncProgressNotifier::start("pull", 100, Duration::from_secs(60));
        notifier.update(30);
        notifier.update(20);
        let snap = notifier.snapshot();
        assert_eq!(snap.done, 50);
        assert_eq!(snap.total, 100);
        assert!((snap.fraction() - 0.5).abs() < 1e-9);
        notifier.stop();
    }

    #[tokio::test]
    async fn test_set_done_is_monotone() {
        let notifier = AsyncProgressNotifier::start("scan", 255, Duration::from_secs(60));
        notifier.set_done(10);
        notifier.set_done(5);
        assert_eq!(notifier.snapshot().done, 10);
        notifier.set_done(200);
        assert_eq!(notifier.snapshot().done, 200);
        notifier.stop();
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let notifier = AsyncProgressNotifier::start("pull", 10, Duration::from_secs(60));
        let mut rx = notifier.subscribe();
        notifier.update(10);
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().done, 10);
        notifier.stop();
    }

    #[test]
    fn test_fraction_with_zero_total() {
        let snap = ProgressSnapshot { done: 5, total: 0 };
        assert_eq!(snap.fraction(), 0.0);
    }
}
