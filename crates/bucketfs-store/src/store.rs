//! The block store: content-addressed bodies plus the cross-participant
//! reservation and deletion protocol.
//!
//! Every coordination primitive is an object in the shared bucket. A
//! participant reserves a block by writing a zero-byte `used-by` tag and
//! announces an impending delete with a `deletion-by` tag whose modification
//! time starts the freshness window. Readers that see a fresh deletion tag
//! back off and retry, which resolves the delete-versus-read race without a
//! coordinator.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bucket::{open_bucket_url, ObjectBucket};
use crate::enumerate::{iterate_blocks, iterate_prefix};
use crate::error::{StoreError, StoreResult};
use crate::key::{
    block_key, fresh_within, meta_key, parse_block_key, tag_key, BlockHash, BlockKey, DELETE_TAG,
    FRESHNESS_WINDOW, USE_TAG,
};
use crate::state::{HashBlockState, HashBlockStateMap};

/// Metadata object holding the approximate block count of the bucket.
pub const COUNT_HINT_META: &str = "BlockCountHint";

/// Lower bound and fallback for the block count hint. The hint only
/// pre-sizes maps, so a floor is harmless.
pub const COUNT_HINT_MINIMUM: usize = 100;

/// Progress callback for full enumeration: cumulative record count and the
/// hash most recently seen.
pub type ProgressFn<'a> = &'a (dyn Fn(usize, &BlockHash) + Send + Sync);

/// Outcome of [`BlockStore::reserve_and_get`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockFetch {
    /// No block body is stored under the hash.
    Missing,
    /// The body exists and our reservation (on writable handles) is
    /// recorded. The bytes are included when the download was requested.
    Present(Option<Vec<u8>>),
}

impl BlockFetch {
    /// Whether the block body exists.
    pub fn found(&self) -> bool {
        matches!(self, BlockFetch::Present(_))
    }

    /// The downloaded bytes, if any.
    pub fn into_data(self) -> Option<Vec<u8>> {
        match self {
            BlockFetch::Present(data) => data,
            BlockFetch::Missing => None,
        }
    }
}

/// The block-store capability set shared by the bucket-backed store and its
/// decorators.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Records our reservation and reports whether the block body exists,
    /// downloading it when `download_data` is set. Backs off and retries
    /// while a fresh `deletion-by` tag is present.
    async fn reserve_and_get(
        &self,
        hash: &BlockHash,
        download_data: bool,
    ) -> StoreResult<BlockFetch>;

    /// Writes our reservation tag, then the block body. Idempotent for the
    /// same hash and bytes.
    async fn reserve_and_set(&self, hash: &BlockHash, data: &[u8]) -> StoreResult<()>;

    /// Removes our `used-by` tag. The block body is left alone.
    async fn delete_reservation(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Writes our `deletion-by` tag, refreshing its modification time.
    async fn announce_delete(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Removes our `deletion-by` tag.
    async fn de_announce_delete(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Deletes the block body unconditionally. Stray tags are left behind;
    /// enumeration drops records without a body, so they are harmless until
    /// reclaimed.
    async fn unchecked_delete(&self, hash: &BlockHash) -> StoreResult<()>;

    /// Accumulates the state of a single block from a listing of its keys.
    async fn get_block_hash_state(&self, hash: &BlockHash) -> StoreResult<HashBlockState>;

    /// Enumerates the whole bucket into a state map and refreshes the stored
    /// count hint. `progress` receives the running record count and the hash
    /// most recently seen.
    async fn get_block_hashes_cache(
        &self,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> StoreResult<HashBlockStateMap>;

    /// Reads the stored block count hint, lower-bounded at
    /// [`COUNT_HINT_MINIMUM`]; read or parse failures fall back to the same
    /// floor.
    async fn get_block_hashes_count_hint(&self) -> usize;

    /// Reads a metadata object; `None` when absent.
    async fn get_meta(&self, name: &str) -> StoreResult<Option<Vec<u8>>>;

    /// Writes a metadata object. Dropped with a warning on read-only handles.
    async fn set_meta(&self, name: &str, data: &[u8]) -> StoreResult<()>;

    /// Deletes a metadata object. Dropped with a warning on read-only handles.
    async fn delete_meta(&self, name: &str) -> StoreResult<()>;

    /// Whether this handle may write tags and bodies. A handle is read-only
    /// exactly when its participant id is empty.
    fn is_read_only(&self) -> bool;
}

/// Tuning knobs for a [`BucketBlockStore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStoreConfig {
    /// Freshness window for `deletion-by` tags. Default is one minute.
    pub freshness_window: std::time::Duration,
    /// Pause before re-probing a block under a fresh deletion tag. Default
    /// is one minute; deletions in flight are rare, so a long pause does not
    /// hurt throughput.
    pub retry_pause: std::time::Duration,
    /// Page size for the single-block probe. Ten entries is enough to see
    /// the body plus every tag that matters. Default is 10.
    pub probe_page_size: usize,
    /// Page size for enumeration listings. Default is 4096.
    pub list_page_size: usize,
    /// Shard listings allowed in flight at once during enumeration.
    /// Default is 2.
    pub parallel_requests: usize,
    /// Independent bucket connections used for enumeration. Default is 1.
    pub parallel_connections: usize,
}

impl Default for BlockStoreConfig {
    fn default() -> Self {
        Self {
            freshness_window: FRESHNESS_WINDOW,
            retry_pause: FRESHNESS_WINDOW,
            probe_page_size: 10,
            list_page_size: 4096,
            parallel_requests: 2,
            parallel_connections: 1,
        }
    }
}

/// Outcome of the single-block probe inside `reserve_and_get`.
enum Probe {
    Missing,
    Present,
    RetryLater,
}

/// Block store backed by an object bucket.
#[derive(Clone)]
pub struct BucketBlockStore {
    url: Option<String>,
    bucket: Arc<dyn ObjectBucket>,
    participant_id: String,
    config: BlockStoreConfig,
    cancel: CancellationToken,
}

impl BucketBlockStore {
    /// Opens the bucket named by `url` with default configuration. An empty
    /// `participant_id` yields a read-only handle.
    pub fn open(url: &str, participant_id: impl Into<String>) -> StoreResult<Self> {
        Self::open_with(url, participant_id, BlockStoreConfig::default())
    }

    /// Opens the bucket named by `url` with explicit configuration.
    pub fn open_with(
        url: &str,
        participant_id: impl Into<String>,
        config: BlockStoreConfig,
    ) -> StoreResult<Self> {
        let bucket = open_bucket_url(url)?;
        Ok(Self {
            url: Some(url.to_string()),
            bucket,
            participant_id: participant_id.into(),
            config,
            cancel: CancellationToken::new(),
        })
    }

    /// Wraps an existing bucket handle. Used by tests and by callers that
    /// share one in-memory bucket between participants.
    pub fn with_bucket(
        bucket: Arc<dyn ObjectBucket>,
        participant_id: impl Into<String>,
        config: BlockStoreConfig,
    ) -> Self {
        Self {
            url: None,
            bucket,
            participant_id: participant_id.into(),
            config,
            cancel: CancellationToken::new(),
        }
    }

    /// Attaches a cancellation token governing this handle's internal waits.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Direct access to the underlying bucket, for external listing such as
    /// participant discovery.
    pub fn raw_access(&self) -> Arc<dyn ObjectBucket> {
        Arc::clone(&self.bucket)
    }

    /// The configuration in effect.
    pub fn config(&self) -> &BlockStoreConfig {
        &self.config
    }

    /// Our participant id; empty for read-only handles.
    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    /// A second handle to the same bucket for parallel listing. URLs are
    /// reopened so the connection is independent; handles without a URL
    /// (and `mem://`, whose reopen would be a fresh empty bucket) share the
    /// existing connection.
    pub(crate) fn reconnect(&self) -> StoreResult<Self> {
        match &self.url {
            Some(url) if !url.starts_with("mem:") => Ok(Self::open_with(
                url,
                self.participant_id.clone(),
                self.config.clone(),
            )?
            .with_cancel(self.cancel.clone())),
            _ => Ok(self.clone()),
        }
    }

    fn ensure_writable(&self, op: &'static str) -> StoreResult<()> {
        if self.is_read_only() {
            return Err(StoreError::ReadOnly { op });
        }
        Ok(())
    }

    async fn put_tag(&self, hash: &BlockHash, kind: &str, refresh_time: bool) -> StoreResult<()> {
        self.ensure_writable("put tag")?;
        let key = tag_key(hash, kind, &self.participant_id);
        if !refresh_time && self.bucket.exists(&key).await? {
            return Ok(());
        }
        self.bucket.put(&key, &[]).await
    }

    async fn remove_tag(&self, hash: &BlockHash, kind: &str) -> StoreResult<()> {
        self.ensure_writable("remove tag")?;
        let key = tag_key(hash, kind, &self.participant_id);
        self.bucket.delete(&key).await
    }

    /// Writes our reservation (writable handles) and inspects one listing
    /// page under the block's key. Transient failures read as "missing";
    /// the caller may retry the whole operation.
    async fn probe(&self, hash: &BlockHash) -> Probe {
        if !self.is_read_only() {
            if let Err(err) = self.put_tag(hash, USE_TAG, false).await {
                warn!(hash = %hash, error = %err, "reservation tag write failed");
                return Probe::Missing;
            }
        }

        let prefix = block_key(hash);
        let page = match self
            .bucket
            .list_page(&prefix, None, self.config.probe_page_size)
            .await
        {
            Ok(page) => page,
            Err(err) => {
                warn!(hash = %hash, error = %err, "block probe listing failed");
                return Probe::Missing;
            }
        };

        let mut data_seen = false;
        let mut fresh_delete = false;
        for entry in &page.entries {
            match parse_block_key(&entry.key) {
                BlockKey::Data { .. } => data_seen = true,
                BlockKey::Delete { .. } => {
                    if fresh_within(entry.modified, self.config.freshness_window) {
                        fresh_delete = true;
                    }
                }
                BlockKey::Use { .. } | BlockKey::Other => {}
            }
        }

        if fresh_delete {
            // a reclaimer is mid-deletion; wait for it to finish or back off
            return Probe::RetryLater;
        }
        if !data_seen {
            return Probe::Missing;
        }
        Probe::Present
    }
}

#[async_trait]
impl BlockStore for BucketBlockStore {
    async fn reserve_and_get(
        &self,
        hash: &BlockHash,
        download_data: bool,
    ) -> StoreResult<BlockFetch> {
        if hash.is_empty() {
            return Ok(BlockFetch::Missing);
        }

        loop {
            match self.probe(hash).await {
                Probe::Present => break,
                Probe::Missing => return Ok(BlockFetch::Missing),
                Probe::RetryLater => {
                    debug!(hash = %hash, "deletion pending, waiting before retry");
                    tokio::select! {
                        _ = self.cancel.cancelled() => return Err(StoreError::Cancelled),
                        _ = tokio::time::sleep(self.config.retry_pause) => {}
                    }
                }
            }
        }

        if !download_data {
            return Ok(BlockFetch::Present(None));
        }
        let data = self.bucket.get(&block_key(hash)).await?;
        Ok(BlockFetch::Present(Some(data)))
    }

    async fn reserve_and_set(&self, hash: &BlockHash, data: &[u8]) -> StoreResult<()> {
        if self.is_read_only() {
            warn!(hash = %hash, "reserve_and_set dropped: read-only handle");
            return Ok(());
        }
        // the reservation must exist before the body does
        self.put_tag(hash, USE_TAG, false).await?;
        self.bucket.put(&block_key(hash), data).await
    }

    async fn delete_reservation(&self, hash: &BlockHash) -> StoreResult<()> {
        self.remove_tag(hash, USE_TAG).await
    }

    async fn announce_delete(&self, hash: &BlockHash) -> StoreResult<()> {
        self.put_tag(hash, DELETE_TAG, true).await
    }

    async fn de_announce_delete(&self, hash: &BlockHash) -> StoreResult<()> {
        self.remove_tag(hash, DELETE_TAG).await
    }

    async fn unchecked_delete(&self, hash: &BlockHash) -> StoreResult<()> {
        self.ensure_writable("unchecked delete")?;
        self.bucket.delete(&block_key(hash)).await
    }

    async fn get_block_hash_state(&self, hash: &BlockHash) -> StoreResult<HashBlockState> {
        let mut last = None;
        iterate_prefix(self, &self.cancel, &hash.to_hex(), |d| {
            last = Some(d.state);
        })
        .await?;
        Ok(last.unwrap_or_default())
    }

    async fn get_block_hashes_cache(
        &self,
        cancel: &CancellationToken,
        progress: ProgressFn<'_>,
    ) -> StoreResult<HashBlockStateMap> {
        let started = Instant::now();
        let hint = self.get_block_hashes_count_hint().await;
        let mut map = HashBlockStateMap::with_capacity(hint);
        iterate_blocks(self, cancel, |d| {
            map.insert(d.hash.clone(), d.state);
            progress(map.len(), &d.hash);
        })
        .await?;

        let count = map.len();
        self.set_meta(COUNT_HINT_META, count.to_string().as_bytes())
            .await?;
        info!(
            count,
            elapsed_secs = started.elapsed().as_secs_f64(),
            "full block enumeration complete"
        );
        Ok(map)
    }

    async fn get_block_hashes_count_hint(&self) -> usize {
        let data = match self.get_meta(COUNT_HINT_META).await {
            Ok(Some(data)) => data,
            Ok(None) | Err(_) => {
                debug!(minimum = COUNT_HINT_MINIMUM, "no stored count hint");
                return COUNT_HINT_MINIMUM;
            }
        };
        match std::str::from_utf8(&data)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
        {
            Some(hint) => hint.max(COUNT_HINT_MINIMUM),
            None => {
                info!(
                    minimum = COUNT_HINT_MINIMUM,
                    "count hint unparseable, using floor"
                );
                COUNT_HINT_MINIMUM
            }
        }
    }

    async fn get_meta(&self, name: &str) -> StoreResult<Option<Vec<u8>>> {
        match self.bucket.get(&meta_key(name)).await {
            Ok(data) => Ok(Some(data)),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn set_meta(&self, name: &str, data: &[u8]) -> StoreResult<()> {
        if self.is_read_only() {
            warn!(name, "set_meta dropped: read-only handle");
            return Ok(());
        }
        self.bucket.put(&meta_key(name), data).await
    }

    async fn delete_meta(&self, name: &str) -> StoreResult<()> {
        if self.is_read_only() {
            warn!(name, "delete_meta dropped: read-only handle");
            return Ok(());
        }
        self.bucket.delete(&meta_key(name)).await
    }

    fn is_read_only(&self) -> bool {
        self.participant_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::MemoryBucket;
    use std::time::{Duration, SystemTime};

    fn quick_config() -> BlockStoreConfig {
        BlockStoreConfig {
            freshness_window: Duration::from_millis(200),
            retry_pause: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn store_pair() -> (Arc<MemoryBucket>, BucketBlockStore, BucketBlockStore) {
        let bucket = Arc::new(MemoryBucket::new());
        let a = BucketBlockStore::with_bucket(bucket.clone(), "dev-a", quick_config());
        let b = BucketBlockStore::with_bucket(bucket.clone(), "dev-b", quick_config());
        (bucket, a, b)
    }

    fn hash(byte: u8) -> BlockHash {
        BlockHash::new(vec![byte; 4])
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (_bucket, a, _b) = store_pair();
        let h = hash(1);
        a.reserve_and_set(&h, b"hello").await.unwrap();
        let fetched = a.reserve_and_get(&h, true).await.unwrap();
        assert_eq!(fetched, BlockFetch::Present(Some(b"hello".to_vec())));
    }

    #[tokio::test]
    async fn test_reserve_and_get_without_download() {
        let (_bucket, a, _b) = store_pair();
        let h = hash(2);
        a.reserve_and_set(&h, b"body").await.unwrap();
        let fetched = a.reserve_and_get(&h, false).await.unwrap();
        assert_eq!(fetched, BlockFetch::Present(None));
        assert!(fetched.found());
    }

    #[tokio::test]
    async fn test_missing_block() {
        let (_bucket, a, _b) = store_pair();
        assert_eq!(
            a.reserve_and_get(&hash(3), true).await.unwrap(),
            BlockFetch::Missing
        );
        assert_eq!(
            a.reserve_and_get(&BlockHash::new(vec![]), true).await.unwrap(),
            BlockFetch::Missing
        );
    }

    #[tokio::test]
    async fn test_reserve_and_set_is_idempotent() {
        let (bucket, a, _b) = store_pair();
        let h = hash(4);
        a.reserve_and_set(&h, b"data").await.unwrap();
        let after_one = bucket.len();
        a.reserve_and_set(&h, b"data").await.unwrap();
        a.reserve_and_set(&h, b"data").await.unwrap();
        assert_eq!(bucket.len(), after_one);
    }

    #[tokio::test]
    async fn test_cross_participant_reservations() {
        let (_bucket, a, b) = store_pair();
        let h = hash(5);
        a.reserve_and_set(&h, b"shared").await.unwrap();
        let fetched = b.reserve_and_get(&h, true).await.unwrap();
        assert_eq!(fetched.into_data().unwrap(), b"shared");

        let seen_by_a = a.get_block_hash_state(&h).await.unwrap();
        assert!(seen_by_a.reserved_by_me);
        assert!(seen_by_a.reserved_by_others);

        let seen_by_b = b.get_block_hash_state(&h).await.unwrap();
        assert!(seen_by_b.reserved_by_me);
        assert!(seen_by_b.reserved_by_others);
    }

    #[tokio::test]
    async fn test_delete_reservation_leaves_body() {
        let (_bucket, a, _b) = store_pair();
        let h = hash(6);
        a.reserve_and_set(&h, b"x").await.unwrap();
        a.delete_reservation(&h).await.unwrap();
        let state = a.get_block_hash_state(&h).await.unwrap();
        assert!(state.data_exists);
        assert!(state.is_available_and_free());
    }

    #[tokio::test]
    async fn test_unchecked_delete_removes_body() {
        let (_bucket, a, _b) = store_pair();
        let h = hash(7);
        a.reserve_and_set(&h, b"x").await.unwrap();
        a.unchecked_delete(&h).await.unwrap();
        assert_eq!(
            a.reserve_and_get(&h, true).await.unwrap(),
            BlockFetch::Missing
        );
    }

    #[tokio::test]
    async fn test_fresh_deletion_tag_blocks_reader_until_deannounce() {
        let (_bucket, a, b) = store_pair();
        let h = hash(8);
        a.reserve_and_set(&h, b"contended").await.unwrap();
        a.announce_delete(&h).await.unwrap();

        let reader = {
            let b = b.clone();
            let h = h.clone();
            tokio::spawn(async move { b.reserve_and_get(&h, true).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished());

        a.de_announce_delete(&h).await.unwrap();
        let fetched = reader.await.unwrap().unwrap();
        assert_eq!(fetched.into_data().unwrap(), b"contended");
    }

    #[tokio::test]
    async fn test_stale_deletion_tag_is_ignored() {
        let (bucket, a, b) = store_pair();
        let h = hash(9);
        a.reserve_and_set(&h, b"old-delete").await.unwrap();
        a.announce_delete(&h).await.unwrap();
        bucket.set_modified(
            &tag_key(&h, DELETE_TAG, "dev-a"),
            SystemTime::now() - Duration::from_secs(3600),
        );

        let fetched = b.reserve_and_get(&h, true).await.unwrap();
        assert!(fetched.found());
        let state = b.get_block_hash_state(&h).await.unwrap();
        assert!(!state.deletion_pending);
    }

    #[tokio::test]
    async fn test_announce_refreshes_mod_time() {
        let (bucket, a, _b) = store_pair();
        let h = hash(10);
        a.reserve_and_set(&h, b"x").await.unwrap();
        a.announce_delete(&h).await.unwrap();
        let key = tag_key(&h, DELETE_TAG, "dev-a");
        let old = SystemTime::now() - Duration::from_secs(3600);
        bucket.set_modified(&key, old);
        a.announce_delete(&h).await.unwrap();
        let page = bucket.list_page(&key, None, 2).await.unwrap();
        assert!(page.entries[0].modified > old);
    }

    #[tokio::test]
    async fn test_use_tag_put_does_not_refresh_mod_time() {
        let (bucket, a, _b) = store_pair();
        let h = hash(11);
        a.reserve_and_set(&h, b"x").await.unwrap();
        let key = tag_key(&h, USE_TAG, "dev-a");
        let old = SystemTime::now() - Duration::from_secs(3600);
        bucket.set_modified(&key, old);
        a.reserve_and_get(&h, false).await.unwrap();
        let page = bucket.list_page(&key, None, 2).await.unwrap();
        assert_eq!(page.entries[0].modified, old);
    }

    #[tokio::test]
    async fn test_count_hint_floor_and_fallback() {
        let (_bucket, a, _b) = store_pair();
        assert_eq!(a.get_block_hashes_count_hint().await, 100);

        a.set_meta(COUNT_HINT_META, b"300").await.unwrap();
        assert_eq!(a.get_block_hashes_count_hint().await, 300);

        a.set_meta(COUNT_HINT_META, b"7").await.unwrap();
        assert_eq!(a.get_block_hashes_count_hint().await, 100);

        a.set_meta(COUNT_HINT_META, b"abc").await.unwrap();
        assert_eq!(a.get_block_hashes_count_hint().await, 100);
    }

    #[tokio::test]
    async fn test_meta_round_trip() {
        let (_bucket, a, _b) = store_pair();
        assert_eq!(a.get_meta("Thing").await.unwrap(), None);
        a.set_meta("Thing", b"value").await.unwrap();
        assert_eq!(a.get_meta("Thing").await.unwrap().unwrap(), b"value");
        a.delete_meta("Thing").await.unwrap();
        assert_eq!(a.get_meta("Thing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_read_only_handle() {
        let (bucket, a, _b) = store_pair();
        let h = hash(12);
        a.reserve_and_set(&h, b"data").await.unwrap();

        let ro = BucketBlockStore::with_bucket(bucket.clone(), "", quick_config());
        assert!(ro.is_read_only());

        // reads work without leaving a reservation behind
        let fetched = ro.reserve_and_get(&h, true).await.unwrap();
        assert_eq!(fetched.into_data().unwrap(), b"data");
        let state = a.get_block_hash_state(&h).await.unwrap();
        assert!(!state.reserved_by_others);

        // body/meta writes are dropped, tag mutations refused
        let before = bucket.len();
        ro.reserve_and_set(&hash(13), b"nope").await.unwrap();
        ro.set_meta("X", b"nope").await.unwrap();
        assert_eq!(bucket.len(), before);
        assert!(matches!(
            ro.delete_reservation(&h).await,
            Err(StoreError::ReadOnly { .. })
        ));
        assert!(matches!(
            ro.announce_delete(&h).await,
            Err(StoreError::ReadOnly { .. })
        ));
        assert!(matches!(
            ro.unchecked_delete(&h).await,
            Err(StoreError::ReadOnly { .. })
        ));
    }

    #[tokio::test]
    async fn test_cache_writes_count_hint() {
        let (_bucket, a, _b) = store_pair();
        for i in 0..3u8 {
            a.reserve_and_set(&hash(20 + i), b"x").await.unwrap();
        }
        let cancel = CancellationToken::new();
        let map = a.get_block_hashes_cache(&cancel, &|_, _| {}).await.unwrap();
        assert_eq!(map.len(), 3);
        assert_eq!(
            a.get_meta(COUNT_HINT_META).await.unwrap().unwrap(),
            b"3".to_vec()
        );
        for state in map.values() {
            assert!(state.is_available_and_reserved_by_me());
        }
    }
}
