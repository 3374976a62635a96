//! Long-running virtual-folder service.
//!
//! Owns the block store (wrapped for encrypted folders), the driver and the
//! background reclamation service, and exposes the pass-level operations as
//! one façade. The encryption token identifying an encrypted folder lives in
//! bucket metadata so any participant can discover it.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;

use bucketfs_store::{
    BlockStore, BlockStoreConfig, BucketBlockStore, CheckedDeleteConfig, EncryptedBlockStore,
};

use crate::driver::{
    BlockFetcher, FolderConfig, FolderDriver, PullOptions, PullSummary, ScanSummary,
};
use crate::error::FolderResult;
use crate::manifest::{manifest_meta_name, FileManifest};

/// Metadata object holding the folder's encryption token.
pub const ENCRYPTION_TOKEN_META: &str = "EncryptionToken";

/// Configuration for a folder service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderServiceConfig {
    /// Bucket URL (`mem://`, `file://`, `s3://`, `gs://`, `azblob://`).
    pub bucket_url: String,
    /// Whether blocks arrive as ciphertext; enables the hash-recording
    /// wrapper.
    pub receive_encrypted: bool,
    /// Driver tuning, including our device and folder ids.
    pub driver: FolderConfig,
    /// Store tuning.
    #[serde(default)]
    pub store: BlockStoreConfig,
    /// Reclamation tuning.
    #[serde(default)]
    pub reclaim: CheckedDeleteConfig,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredEncryptionToken {
    folder_id: String,
    token: Vec<u8>,
}

/// A running virtual folder: store, driver and reclamation in one handle.
pub struct FolderService {
    store: Arc<dyn BlockStore>,
    driver: FolderDriver,
    cancel: CancellationToken,
    device_id: String,
    folder_id: String,
}

impl FolderService {
    /// Opens the bucket and assembles the service. The store handle carries
    /// the device id, so an empty one yields a read-only folder.
    pub fn open(config: FolderServiceConfig, cancel: CancellationToken) -> FolderResult<Self> {
        let inner = BucketBlockStore::open_with(
            &config.bucket_url,
            config.driver.device_id.clone(),
            config.store.clone(),
        )?
        .with_cancel(cancel.clone());

        let store: Arc<dyn BlockStore> = if config.receive_encrypted {
            Arc::new(EncryptedBlockStore::new(inner))
        } else {
            Arc::new(inner)
        };

        Ok(Self::with_store(store, config, cancel))
    }

    /// Assembles the service around an existing store. Used by tests and by
    /// callers that share one bucket between participants.
    pub fn with_store(
        store: Arc<dyn BlockStore>,
        config: FolderServiceConfig,
        cancel: CancellationToken,
    ) -> Self {
        let device_id = config.driver.device_id.clone();
        let folder_id = config.driver.folder_id.clone();
        let driver = FolderDriver::with_delete_config(
            store.clone(),
            config.driver,
            config.reclaim,
            cancel.clone(),
        );
        info!(folder = %folder_id, "virtual folder service ready");
        Self {
            store,
            driver,
            cancel,
            device_id,
            folder_id,
        }
    }

    /// The block store in use.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// The pass driver.
    pub fn driver(&self) -> &FolderDriver {
        &self.driver
    }

    /// Pulls `files`, fetching missing blocks through `fetcher`. With
    /// `only_missing` set, files whose persisted manifest already matches
    /// are skipped.
    pub async fn pull(
        &self,
        files: &[FileManifest],
        fetcher: Arc<dyn BlockFetcher>,
        only_missing: bool,
    ) -> FolderResult<PullSummary> {
        let pass = self
            .driver
            .start_scan_or_pull(PullOptions {
                only_missing,
                only_check: false,
            })
            .await?;
        let summary = pass.pull(files, fetcher).await?;
        pass.finish(files).await?;
        Ok(summary)
    }

    /// Scans `files` against a fresh enumeration, resets incomplete files,
    /// then reclaims unreferenced storage.
    pub async fn scan_and_reclaim(
        &self,
        files: &mut [FileManifest],
    ) -> FolderResult<ScanSummary> {
        let pass = self
            .driver
            .start_scan_or_pull(PullOptions {
                only_missing: false,
                only_check: true,
            })
            .await?;
        let summary = pass.scan(files).await?;
        pass.finish(files).await?;
        Ok(summary)
    }

    /// Loads a previously stored file manifest. A corrupt manifest reads as
    /// absent, so the file is simply treated as not held and pulled again.
    pub async fn load_file_manifest(&self, path: &str) -> FolderResult<Option<FileManifest>> {
        self.driver.load_file_manifest(path).await
    }

    /// Stores a file's manifest for external mounts.
    pub async fn store_file_manifest(&self, manifest: &FileManifest) -> FolderResult<()> {
        let name = manifest_meta_name(&self.device_id, &self.folder_id, &manifest.name);
        self.store.set_meta(&name, &manifest.to_json()?).await?;
        Ok(())
    }

    /// Reads the folder's encryption token, if one was stored.
    pub async fn read_encryption_token(&self) -> FolderResult<Option<Vec<u8>>> {
        let Some(data) = self.store.get_meta(ENCRYPTION_TOKEN_META).await? else {
            return Ok(None);
        };
        let stored: StoredEncryptionToken = serde_json::from_slice(&data)?;
        Ok(Some(stored.token))
    }

    /// Stores the folder's encryption token.
    pub async fn write_encryption_token(&self, token: &[u8]) -> FolderResult<()> {
        let stored = StoredEncryptionToken {
            folder_id: self.folder_id.clone(),
            token: token.to_vec(),
        };
        self.store
            .set_meta(ENCRYPTION_TOKEN_META, &serde_json::to_vec(&stored)?)
            .await?;
        Ok(())
    }

    /// Shuts the service down; the reclamation worker discards pending
    /// requests and in-flight passes abort at their next cancellation point.
    pub fn shutdown(&self) {
        info!(folder = %self.folder_id, "virtual folder service stopping");
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bucketfs_store::MemoryBucket;
    use std::time::Duration;

    fn service() -> FolderService {
        let bucket = Arc::new(MemoryBucket::new());
        let store: Arc<dyn BlockStore> = Arc::new(BucketBlockStore::with_bucket(
            bucket,
            "dev-a",
            BlockStoreConfig::default(),
        ));
        FolderService::with_store(
            store,
            FolderServiceConfig {
                bucket_url: "mem://".into(),
                receive_encrypted: false,
                driver: FolderConfig::new("dev-a", "folder-1"),
                store: BlockStoreConfig::default(),
                reclaim: CheckedDeleteConfig {
                    grace: Duration::from_millis(150),
                    queue_capacity: 16,
                },
            },
            CancellationToken::new(),
        )
    }

    #[tokio::test]
    async fn test_manifest_round_trip_and_corrupt_fallback() {
        let service = service();
        assert_eq!(service.load_file_manifest("a/b.txt").await.unwrap(), None);

        let manifest = crate::manifest::FileManifest::file(
            "a/b.txt",
            vec![crate::manifest::BlockInfo {
                hash: bucketfs_store::BlockHash::new(vec![1; 4]),
                offset: 0,
                size: 64,
            }],
        );
        service.store_file_manifest(&manifest).await.unwrap();
        assert_eq!(
            service.load_file_manifest("a/b.txt").await.unwrap(),
            Some(manifest)
        );

        // corruption reads as absent rather than failing the scan
        service
            .store()
            .set_meta("LocalHaveMeta/dev-a/folder-1/a/b.txt", b"{broken")
            .await
            .unwrap();
        assert_eq!(service.load_file_manifest("a/b.txt").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_encryption_token_round_trip() {
        let service = service();
        assert_eq!(service.read_encryption_token().await.unwrap(), None);
        service.write_encryption_token(b"opaque-token").await.unwrap();
        assert_eq!(
            service.read_encryption_token().await.unwrap().unwrap(),
            b"opaque-token"
        );
    }

    #[tokio::test]
    async fn test_open_mem_url() {
        let config = FolderServiceConfig {
            bucket_url: "mem://".into(),
            receive_encrypted: false,
            driver: FolderConfig::new("dev-a", "folder-1"),
            store: BlockStoreConfig::default(),
            reclaim: CheckedDeleteConfig::default(),
        };
        let service = FolderService::open(config, CancellationToken::new()).unwrap();
        assert!(!service.store().is_read_only());
        service.shutdown();
    }

    #[tokio::test]
    async fn test_encrypted_folder_records_real_hashes() {
        let config = FolderServiceConfig {
            bucket_url: "mem://".into(),
            receive_encrypted: true,
            driver: FolderConfig::new("dev-a", "folder-enc"),
            store: BlockStoreConfig::default(),
            reclaim: CheckedDeleteConfig::default(),
        };
        let service = FolderService::open(config, CancellationToken::new()).unwrap();
        let hash = bucketfs_store::BlockHash::new(vec![0x0c; 4]);
        service
            .store()
            .reserve_and_set(&hash, b"ciphertext")
            .await
            .unwrap();
        let recorded = service
            .store()
            .get_meta(&format!("real_hashes/{}", hash.to_hex()))
            .await
            .unwrap();
        assert!(recorded.is_some());
        assert_eq!(recorded.unwrap().len(), 32);
    }
}
