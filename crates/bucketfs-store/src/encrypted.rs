//! Block-store decorator for encrypted folders.
//!
//! Blocks arriving here are already ciphertext addressed by the hash of
//! their plaintext. The wrapper additionally records the hash of the stored
//! bytes themselves under a metadata key, so bit rot in the bucket can later
//! be detected by re-hashing the ciphertext and comparing.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;

use crate::error::StoreResult;
use crate::key::BlockHash;
use crate::state::{HashBlockState, HashBlockStateMap};
use crate::store::{BlockFetch, BlockStore, ProgressFn};

/// Metadata-key prefix mapping a block hash to the hash of its stored bytes.
pub const REAL_HASH_META_PREFIX: &str = "real_hashes";

/// Decorator recording a second hash of the stored ciphertext.
pub struct EncryptedBlockStore<S> {
    inner: S,
}

impl<S: BlockStore> EncryptedBlockStore<S> {
    /// Wraps `inner`.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// The wrapped store.
    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn real_hash_meta_name(hash: &BlockHash) -> String {
        format!("{}/{}", REAL_HASH_META_PREFIX, hash.to_hex())
    }
}

#[async_trait]
impl<S: BlockStore> BlockStore for EncryptedBlockStore<S> {
    async fn reserve_and_get(
        &self,
        hash: &BlockHash,
        download_data: bool,
    ) -> StoreResult<BlockFetch> {
        self.inner.reserve_and_get(hash, download_data).await
    }

    async fn reserve_and_set(&self, hash: &BlockHash, data: &[u8]) -> StoreResult<()> {
        let real_hash = Sha256::digest(data);
        self.inner
            .set_meta(&Self::real_hash_meta_name(hash), &real_hash)
            .await?;
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
