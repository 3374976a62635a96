//! Background checked-delete service.
//!
//! Reclamation candidates are enqueued by hash; a single worker re-validates
//! each block's state under race before touching it. The destructive step is
//! guarded by a time-stamped `deletion-by` announcement and a grace period
//! longer than the expected listing latency of any other participant, so a
//! concurrent reserver either sees the announcement and backs off, or its
//! fresh `used-by` tag is seen here and the delete is dropped.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::key::{BlockHash, FRESHNESS_WINDOW};
use crate::store::BlockStore;

/// Configuration for the checked-delete service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckedDeleteConfig {
    /// Grace period between announcing a delete and performing it. Must not
    /// be shorter than the store's `deletion-by` freshness window: the
    /// worker's own announcement has to age out before the re-check, and a
    /// racing reader needs the full window to land its `used-by` tag.
    /// Default matches the freshness window.
    pub grace: std::time::Duration,
    /// Capacity of the request queue. Default is 1024.
    pub queue_capacity: usize,
}

impl Default for CheckedDeleteConfig {
    fn default() -> Self {
        Self {
            grace: FRESHNESS_WINDOW,
            queue_capacity: 1024,
        }
    }
}

/// Counters published by the checked-delete worker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CheckedDeleteStats {
    /// Requests taken off the queue.
    pub requested: u64,
    /// Blocks physically deleted.
    pub deleted: u64,
    /// Requests dropped because the block was not available and free.
    pub skipped_unavailable: u64,
    /// Requests dropped because the block was re-reserved during the grace
    /// period.
    pub skipped_contended: u64,
    /// Requests dropped on store errors.
    pub failed: u64,
}

/// Handle to the background checked-delete worker.
///
/// Dropping the handle or cancelling its token stops the worker; pending
/// requests are discarded, which is safe because the next enumeration pass
/// re-offers every free block.
pub struct AsyncCheckedDeleteService {
    sender: mpsc::Sender<BlockHash>,
    stats: watch::Receiver<CheckedDeleteStats>,
    cancel: CancellationToken,
}

impl AsyncCheckedDeleteService {
    /// Spawns the worker on `store`.
    pub fn start(
        cancel: CancellationToken,
        store: Arc<dyn BlockStore>,
        config: CheckedDeleteConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let (stats_tx, stats_rx) = watch::channel(CheckedDeleteStats::default());
        let worker = Worker {
            store,
            config,
            cancel: cancel.clone(),
            stats_tx,
            stats: CheckedDeleteStats::default(),
        };
        tokio::spawn(worker.run(receiver));
        Self {
            sender,
            stats: stats_rx,
            cancel,
        }
    }

    /// Enqueues a block for checked deletion. Returns false when the worker
    /// has shut down or the queue is full; the request is then simply lost
    /// until the next enumeration pass.
    pub async fn request_checked_delete(&self, hash: BlockHash) -> bool {
        self.sender.try_send(hash).is_ok()
    }

    /// Snapshot of the worker's counters.
    pub fn stats(&self) -> CheckedDeleteStats {
        self.stats.borrow().clone()
    }

    /// Stops the worker, discarding pending requests.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the worker is still accepting requests.
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }
}

struct Worker {
    store: Arc<dyn BlockStore>,
    config: CheckedDeleteConfig,
    cancel: CancellationToken,
    stats_tx: watch::Sender<CheckedDeleteStats>,
    stats: CheckedDeleteStats,
}

impl Worker {
    async fn run(mut self, mut receiver: mpsc::Receiver<BlockHash>) {
        loop {
            let hash = tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = receiver.recv() => match request {
                    Some(hash) => hash,
                    None => break,
                },
            };
            self.process(hash).await;
            let _ = self.stats_tx.send(self.stats.clone());
        }
        debug!("checked-delete worker stopped");
    }

    async fn process(&mut self, hash: BlockHash) {
        self.stats.requested += 1;

        let state = match self.store.get_block_hash_state(&hash).await {
            Ok(state) => state,
            Err(err) => {
                warn!(hash = %hash, error = %err, "state query failed, dropping delete request");
                self.stats.failed += 1;
                return;
            }
        };
        if !state.is_available_and_free() {
            debug!(hash = %hash, "block not free, dropping delete request");
            self.stats.skipped_unavailable += 1;
            return;
        }

        if let Err(err) = self.store.announce_delete(&hash).await {
            warn!(hash = %hash, error = %err, "delete announcement failed");
            self.stats.failed += 1;
            return;
        }

        // give a racing reserver time to land its tag or observe ours; if we
        // stop here the announcement simply ages out
        tokio::select! {
            _ = self.cancel.cancelled() => return,
            _ = tokio::time::sleep(self.config.grace) => {}
        }

        let recheck = match self.store.get_block_hash_state(&hash).await {
            Ok(state) => state,
            Err(err) => {
                warn!(hash = %hash, error = %err, "re-check failed, dropping delete request");
                self.stats.failed += 1;
                self.de_announce(&hash).await;
                return;
            }
        };

        // sleeping the full freshness window means our own announcement has
        // aged out by now; any reader that saw it fresh has backed off, and
        // any reservation taken during the grace period shows up here
        if recheck.is_available_and_free() {
            match self.store.unchecked_delete(&hash).await {
                Ok(()) => {
                    info!(hash = %hash, "reclaimed unreferenced block");
                    self.stats.deleted += 1;
                }
                Err(err) => {
                    warn!(hash = %hash, error = %err, "physical delete failed");
                    self.stats.failed += 1;
                }
            }
        } else {
            debug!(hash = %hash, "block re-reserved during grace period, backing off");
            self.stats.skipped_contended += 1;
        }
        self.de_announce(&hash).await;
    }

    async fn de_announce(&self, hash: &BlockHash) {
        if let Err(err) = self.store.de_announce_delete(hash).await {
            warn!(hash = %hash, error = %err, "failed to remove delete announcement");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::{MemoryBucket, ObjectBucket};
    use crate::key::{tag_key, USE_TAG};
    use crate::store::{BlockFetch, BlockStoreConfig, BucketBlockStore};
    use std::time::Duration;

    fn quick_config() -> BlockStoreConfig {
        BlockStoreConfig {
            freshness_window: Duration::from_millis(100),
            retry_pause: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn service_on(
        bucket: Arc<MemoryBucket>,
    ) -> (Arc<BucketBlockStore>, AsyncCheckedDeleteService) {
        let store = Arc::new(BucketBlockStore::with_bucket(
            bucket,
            "reclaimer",
            quick_config(),
        ));
        let service = AsyncCheckedDeleteService::start(
            CancellationToken::new(),
            store.clone(),
            CheckedDeleteConfig {
                grace: Duration::from_millis(150),
                queue_capacity: 16,
            },
        );
        (store, service)
    }

    fn hash(byte: u8) -> BlockHash {
        BlockHash::new(vec![byte; 4])
    }

    async fn settle(service: &AsyncCheckedDeleteService, pred: impl Fn(&CheckedDeleteStats) -> bool) {
        for _ in 0..100 {
            if pred(&service.stats()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("delete service did not settle: {:?}", service.stats());
    }

    #[tokio::test]
    async fn test_free_block_is_reclaimed() {
        let bucket = Arc::new(MemoryBucket::new());
        let (store, service) = service_on(bucket.clone());
        let h = hash(1);
        store.reserve_and_set(&h, b"junk").await.unwrap();
        store.delete_reservation(&h).await.unwrap();

        assert!(service.request_checked_delete(h.clone()).await);
        settle(&service, |s| s.deleted == 1).await;

        assert_eq!(
            store.reserve_and_get(&h, false).await.unwrap(),
            BlockFetch::Missing
        );
        // the announcement was cleaned up as well
        let state = store.get_block_hash_state(&h).await.unwrap();
        assert!(!state.deletion_pending);
    }

    #[tokio::test]
    async fn test_reserved_block_is_never_deleted() {
        let bucket = Arc::new(MemoryBucket::new());
        let (store, service) = service_on(bucket.clone());
        let h = hash(2);
        store.reserve_and_set(&h, b"held").await.unwrap();

        assert!(service.request_checked_delete(h.clone()).await);
        settle(&service, |s| s.skipped_unavailable == 1).await;

        assert!(store.reserve_and_get(&h, false).await.unwrap().found());
    }

    #[tokio::test]
    async fn test_reservation_during_grace_aborts_delete() {
        let bucket = Arc::new(MemoryBucket::new());
        let (store, service) = service_on(bucket.clone());
        let h = hash(3);
        store.reserve_and_set(&h, b"racy").await.unwrap();
        store.delete_reservation(&h).await.unwrap();

        assert!(service.request_checked_delete(h.clone()).await);
        // land a peer reservation while the worker sleeps out its grace
        tokio::time::sleep(Duration::from_millis(10)).await;
        bucket
            .put(&tag_key(&h, USE_TAG, "peer"), b"")
            .await
            .unwrap();

        settle(&service, |s| {
            s.skipped_contended == 1 || s.skipped_unavailable == 1
        })
        .await;
        assert_eq!(service.stats().deleted, 0);
        assert!(store.reserve_and_get(&h, false).await.unwrap().found());
        let state = store.get_block_hash_state(&h).await.unwrap();
        assert!(!state.deletion_pending);
    }

    #[tokio::test]
    async fn test_close_stops_worker() {
        let bucket = Arc::new(MemoryBucket::new());
        let (_store, service) = service_on(bucket);
        service.close();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!service.is_running());
    }
}
