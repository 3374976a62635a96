#![warn(missing_docs)]

//! Content-addressed block storage over a shared object bucket.
//!
//! Blocks are immutable byte sequences keyed by their hash and stored in an
//! opaque object bucket (S3, GCS, Azure Blob, a local directory or memory).
//! Multiple independent participants share one bucket: each announces the
//! blocks it still needs with zero-byte `used-by` tags, announces impending
//! deletes with time-stamped `deletion-by` tags, and reclaims unreferenced
//! blocks through a checked-delete protocol that needs no coordinator.

pub mod bucket;
pub mod cloud_bucket;
pub mod delete;
pub mod encrypted;
pub mod enumerate;
pub mod error;
pub mod fs_bucket;
pub mod key;
pub mod state;
pub mod store;

pub use bucket::{open_bucket_url, ListEntry, ListPage, MemoryBucket, ObjectBucket};
pub use cloud_bucket::CloudBucket;
pub use delete::{AsyncCheckedDeleteService, CheckedDeleteConfig, CheckedDeleteStats};
pub use encrypted::{EncryptedBlockStore, REAL_HASH_META_PREFIX};
pub use enumerate::{iterate_blocks, iterate_prefix};
pub use error::{StoreError, StoreResult};
pub use fs_bucket::FsBucket;
pub use key::{
    block_key, fresh_within, meta_key, parse_block_key, tag_key, BlockHash, BlockKey,
    BLOCK_PREFIX, DELETE_TAG, FRESHNESS_WINDOW, META_PREFIX, USE_TAG,
};
pub use state::{HashAndState, HashBlockState, HashBlockStateMap, StateBuilder};
pub use store::{
    BlockFetch, BlockStore, BlockStoreConfig, BucketBlockStore, ProgressFn, COUNT_HINT_META,
    COUNT_HINT_MINIMUM,
};
