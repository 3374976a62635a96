//! Read-through block cache for the read-only mount path.
//!
//! Concurrent readers of the same file routinely request the same block.
//! Each cache entry carries its own async lock, so the first reader
//! downloads while the rest wait on that entry alone, and every block is
//! fetched from the bucket at most once.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use bucketfs_store::{BlockFetch, BlockHash, BlockStore};

use crate::error::FolderResult;

#[derive(Default)]
struct CacheSlot {
    filled: bool,
    /// `None` after fill means the bucket has no such block.
    data: Option<Vec<u8>>,
}

/// Per-entry-locked read-through cache over a block store.
pub struct BlockDataCache {
    store: Arc<dyn BlockStore>,
    entries: Mutex<HashMap<BlockHash, Arc<tokio::sync::Mutex<CacheSlot>>>>,
}

impl BlockDataCache {
    /// Creates an empty cache reading through `store`.
    pub fn new(store: Arc<dyn BlockStore>) -> Self {
        Self {
            store,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the block's bytes, downloading through the store on first
    /// use. `None` means the bucket holds no such block; store errors are
    /// not cached, so a later call retries.
    pub async fn get(&self, hash: &BlockHash) -> FolderResult<Option<Vec<u8>>> {
        let slot = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(hash.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(CacheSlot::default())))
                .clone()
        };

        let mut slot = slot.lock().await;
        if slot.filled {
            return Ok(slot.data.clone());
        }
        match self.store.reserve_and_get(hash, true).await? {
            BlockFetch::Present(data) => {
                slot.filled = true;
                slot.data = Some(data.unwrap_or_default());
            }
            BlockFetch::Missing => {
                slot.filled = true;
                slot.data = None;
            }
        }
        Ok(slot.data.clone())
    }

    /// Number of cached entries, filled or in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all cached entries.
    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bucketfs_store::{
        BlockStoreConfig, BucketBlockStore, HashBlockState, HashBlockStateMap, MemoryBucket,
        ProgressFn, StoreResult,
    };
    use std::sync::atomic::{AtomicU64, Ordering};
    use tokio_util::sync::CancellationToken;

    /// Wraps a store and counts body downloads.
    struct CountingStore {
        inner: BucketBlockStore,
        downloads: AtomicU64,
    }

    #[async_trait]
    impl BlockStore for CountingStore {
        async fn reserve_and_get(
            &self,
            hash: &BlockHash,
            download_data: bool,
        ) -> StoreResult<BlockFetch> {
            if download_data {
                self.downloads.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.reserve_and_get(hash, download_data).await
        }

        async fn reserve_and_set(&self, hash: &BlockHash, data: &[u8]) -> StoreResult<()> {
            self.inner.reserve_and_set(hash, data).await
        }

        async fn delete_reservation(&self, hash: &BlockHash) -> StoreResult<()> {
            self.inner.delete_reservation(hash).await
        }

        async fn announce_delete(&self, hash: &BlockHash) -> StoreResult<()> {
            self.inner.announce_delete(hash).await
        }

        async fn de_announce_delete(&self, hash: &BlockHash) -> StoreResult<()> {
            self.inner.de_announce_delete(hash).await
        }

        async fn unchecked_delete(&self, hash: &BlockHash) -> StoreResult<()> {
            self.inner.unchecked_delete(hash).await
        }

        async fn get_block_hash_state(&self, hash: &BlockHash) -> StoreResult<HashBlockState> {
            self.inner.get_block_hash_state(hash).await
        }

        async fn get_block_hashes_cache(
            &self,
            cancel: &CancellationToken,
            progress: ProgressFn<'_>,
        ) -> StoreResult<HashBlockStateMap> {
            self.inner.get_block_hashes_cache(cancel, progress).await
        }

        async fn get_block_hashes_count_hint(&self) -> usize {
            self.inner.get_block_hashes_count_hint().await
        }

        async fn get_meta(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
            self.inner.get_meta(name).await
        }

        async fn set_meta(&self, name: &str, data: &[u8]) -> StoreResult<()> {
            self.inner.set_meta(name, data).await
        }

        async fn delete_meta(&self, name: &str) -> StoreResult<()> {
            self.inner.delete_meta(name).await
        }

        fn is_read_only(&self) -> bool {
            self.inner.is_read_only()
        }
    }

    fn counting_store() -> Arc<CountingStore> {
        Arc::new(CountingStore {
            inner: BucketBlockStore::with_bucket(
                Arc::new(MemoryBucket::new()),
                "reader",
                BlockStoreConfig::default(),
            ),
            downloads: AtomicU64::new(0),
        })
    }

    #[tokio::test]
    async fn test_concurrent_readers_download_once() {
        let store = counting_store();
        let hash = BlockHash::new(vec![0x11; 4]);
        store.inner.reserve_and_set(&hash, b"shared").await.unwrap();

        let cache = Arc::new(BlockDataCache::new(store.clone()));
        let mut tasks = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let hash = hash.clone();
            tasks.push(tokio::spawn(async move { cache.get(&hash).await }));
        }
        for task in tasks {
            let data = task.await.unwrap().unwrap().unwrap();
            assert_eq!(data, b"shared");
        }
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_missing_block_is_cached_as_absent() {
        let store = counting_store();
        let hash = BlockHash::new(vec![0x22; 4]);
        let cache = BlockDataCache::new(store.clone());

        assert_eq!(cache.get(&hash).await.unwrap(), None);
        assert_eq!(cache.get(&hash).await.unwrap(), None);
        assert_eq!(store.downloads.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_forgets_entries() {
        let store = counting_store();
        let hash = BlockHash::new(vec![0x33; 4]);
        store.inner.reserve_and_set(&hash, b"x").await.unwrap();
        let cache = BlockDataCache::new(store.clone());

        cache.get(&hash).await.unwrap();
        assert!(!cache.is_empty());
        cache.clear();
        assert!(cache.is_empty());
        cache.get(&hash).await.unwrap();
        assert_eq!(store.downloads.load(Ordering::SeqCst), 2);
    }
}
