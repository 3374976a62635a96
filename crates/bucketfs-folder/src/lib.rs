//! Virtual-folder driver over the bucketfs block store.
//!
//! Orchestrates per-file block retrieval against a shared bucket: pull
//! passes fetch missing blocks from peers and reserve them, scan passes
//! verify the local file set against a full bucket enumeration and trigger
//! reclamation of blocks nobody references. Persisted file manifests make
//! the folder mountable from bucket metadata alone.

pub mod blockcache;
pub mod discover;
pub mod driver;
pub mod error;
pub mod leases;
pub mod manifest;
pub mod progress;
pub mod service;

pub use blockcache::BlockDataCache;
pub use discover::{list_device_ids, list_folder_ids};
pub use driver::{
    get_block_data_from_cache_or_download, BlockFetcher, BlockSource, FolderConfig, FolderDriver,
    FolderPass, PullOptions, PullSummary, ScanSummary,
};
pub use error::{FolderError, FolderResult};
pub use leases::ParallelLeases;
pub use manifest::{
    manifest_meta_name, BlockInfo, Counter, FileManifest, VersionVector, MANIFEST_META_PREFIX,
};
pub use progress::{AsyncProgressNotifier, ProgressSnapshot};
pub use service::{FolderService, FolderServiceConfig, ENCRYPTION_TOKEN_META};
