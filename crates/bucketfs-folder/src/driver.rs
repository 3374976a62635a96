//! Pull and scan passes over file manifests.
//!
//! A pull walks every file and makes sure each referenced block exists in
//! the bucket with our reservation on it, fetching missing bodies through
//! the external transfer collaborator. A scan builds the full block state
//! map once, verifies every file against it, and afterwards reclaims blocks
//! nobody references any more.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use bucketfs_store::{
    AsyncCheckedDeleteService, BlockFetch, BlockHash, BlockStore, CheckedDeleteConfig,
    HashBlockStateMap, StoreError,
};

use crate::error::{FolderError, FolderResult};
use crate::leases::ParallelLeases;
use crate::manifest::{manifest_meta_name, BlockInfo, FileManifest};
use crate::progress::AsyncProgressNotifier;

/// How a block's bytes were obtained during a pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSource {
    /// The block was already in the bucket.
    Cached,
    /// The block was fetched from a peer and stored.
    Downloaded,
}

/// External collaborator fetching block bodies from peers.
#[async_trait]
pub trait BlockFetcher: Send + Sync {
    /// Fetches the raw bytes of `block` belonging to `file`.
    async fn fetch_block(&self, file: &FileManifest, block: &BlockInfo) -> FolderResult<Vec<u8>>;
}

/// Mode selection for one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOptions {
    /// Pull only files not already held: a file whose persisted manifest
    /// matches the requested one is skipped. Scan passes ignore this.
    pub only_missing: bool,
    /// Verify and reclaim instead of fetching.
    pub only_check: bool,
}

/// Tuning knobs for the folder driver.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct FolderConfig {
    /// Our participant id, also the manifest namespace.
    pub device_id: String,
    /// Folder id, the second manifest namespace component.
    pub folder_id: String,
    /// Concurrent file-level leases. Default is 60.
    pub file_leases: usize,
    /// Concurrent block-level leases within one file. Default is 10.
    pub block_leases: usize,
    /// Attempts per block before the file is marked failed. Default is 6.
    pub pull_attempts: u32,
    /// Pause between block attempts. Default is one minute.
    pub pull_retry_pause: std::time::Duration,
    /// Progress reporting interval. Default is five seconds.
    pub progress_interval: std::time::Duration,
}

impl FolderConfig {
    /// Configuration with defaults for the given identity.
    pub fn new(device_id: impl Into<String>, folder_id: impl Into<String>) -> Self {
        Self {
            device_id: device_id.into(),
            folder_id: folder_id.into(),
            ..Default::default()
        }
    }
}

impl Default for FolderConfig {
    fn default() -> Self {
        Self {
            device_id: String::new(),
            folder_id: String::new(),
            file_leases: 60,
            block_leases: 10,
            pull_attempts: 6,
            pull_retry_pause: std::time::Duration::from_secs(60),
            progress_interval: std::time::Duration::from_secs(5),
        }
    }
}

/// Result of a pull pass.
#[derive(Debug, Clone, Default)]
pub struct PullSummary {
    /// Files whose every block is now present and reserved.
    pub files_completed: u64,
    /// Files skipped in only-missing mode because their persisted manifest
    /// already matches.
    pub files_skipped: u64,
    /// Files that still miss blocks after all retries.
    pub files_failed: Vec<String>,
    /// Blocks that were already in the bucket.
    pub blocks_from_cache: u64,
    /// Blocks fetched from peers and stored.
    pub blocks_downloaded: u64,
}

/// Result of a scan pass.
#[derive(Debug, Clone, Default)]
pub struct ScanSummary {
    /// Files whose blocks are all present and reserved by us.
    pub files_ok: u64,
    /// Files marked incomplete; their version was reset so they will be
    /// pulled again.
    pub files_incomplete: Vec<String>,
}

#[derive(Default)]
struct PullCounters {
    cached: AtomicU64,
    downloaded: AtomicU64,
}

/// Drives pull and scan passes against one block store.
pub struct FolderDriver {
    store: Arc<dyn BlockStore>,
    delete_service: AsyncCheckedDeleteService,
    config: FolderConfig,
    cancel: CancellationToken,
}

impl FolderDriver {
    /// Creates a driver with a default checked-delete service.
    pub fn new(store: Arc<dyn BlockStore>, config: FolderConfig, cancel: CancellationToken) -> Self {
        Self::with_delete_config(store, config, CheckedDeleteConfig::default(), cancel)
    }

    /// Creates a driver with an explicit checked-delete configuration.
    pub fn with_delete_config(
        store: Arc<dyn BlockStore>,
        config: FolderConfig,
        delete_config: CheckedDeleteConfig,
        cancel: CancellationToken,
    ) -> Self {
        let delete_service =
            AsyncCheckedDeleteService::start(cancel.child_token(), store.clone(), delete_config);
        Self {
            store,
            delete_service,
            config,
            cancel,
        }
    }

    /// The block store this driver works against.
    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// The background reclamation service.
    pub fn delete_service(&self) -> &AsyncCheckedDeleteService {
        &self.delete_service
    }

    /// The configuration in effect.
    pub fn config(&self) -> &FolderConfig {
        &self.config
    }

    /// Loads a previously stored file manifest. A corrupt manifest reads as
    /// absent, so the file is simply treated as not held and pulled again.
    pub async fn load_file_manifest(&self, path: &str) -> FolderResult<Option<FileManifest>> {
        let name = manifest_meta_name(&self.config.device_id, &self.config.folder_id, path);
        let Some(data) = self.store.get_meta(&name).await? else {
            return Ok(None);
        };
        match FileManifest::from_json(&data) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(err) => {
                warn!(path, error = %err, "corrupt file manifest, treating as absent");
                Ok(None)
            }
        }
    }

    /// Begins a pass. In scan mode this enumerates the whole bucket into a
    /// state map first, reporting coarse progress through the first byte of
    /// the current hash, which advances monotonically because the listing
    /// is sorted.
    pub async fn start_scan_or_pull(&self, opts: PullOptions) -> FolderResult<FolderPass<'_>> {
        let check_map = if opts.only_check {
            let notifier = AsyncProgressNotifier::start(
                format!("{}/enumerate", self.config.folder_id),
                u64::from(u8::MAX),
                self.config.progress_interval,
            );
            let result = self
                .store
                .get_block_hashes_cache(&self.cancel, &|_count, hash| {
                    if let Some(byte) = hash.first_byte() {
                        notifier.set_done(u64::from(byte));
                    }
                })
                .await;
            notifier.stop();
            Some(Arc::new(result?))
        } else {
            None
        };
        Ok(FolderPass {
            driver: self,
            opts,
            check_map,
        })
    }
}

/// One pull or scan pass started by [`FolderDriver::start_scan_or_pull`].
pub struct FolderPass<'a> {
    driver: &'a FolderDriver,
    opts: PullOptions,
    check_map: Option<Arc<HashBlockStateMap>>,
}

impl FolderPass<'_> {
    /// The options this pass was started with.
    pub fn options(&self) -> PullOptions {
        self.opts
    }

    /// The scan state map, present in scan mode.
    pub fn check_map(&self) -> Option<&HashBlockStateMap> {
        self.check_map.as_deref()
    }

    /// Pulls every file: verifies or fetches each block, then persists the
    /// file's manifest. Directories complete immediately. In only-missing
    /// mode, files whose persisted manifest already matches are skipped
    /// without touching the bucket.
    pub async fn pull(
        &self,
        files: &[FileManifest],
        fetcher: Arc<dyn BlockFetcher>,
    ) -> FolderResult<PullSummary> {
        let driver = self.driver;
        let total: u64 = files.iter().map(|f| f.size).sum();
        let notifier = Arc::new(AsyncProgressNotifier::start(
            format!("{}/pull", driver.config.folder_id),
            total,
            driver.config.progress_interval,
        ));
        let leases = ParallelLeases::new("folder-pull", driver.config.file_leases);
        let summary = Arc::new(Mutex::new(PullSummary::default()));
        let counters = Arc::new(PullCounters::default());

        for file in files {
            if driver.cancel.is_cancelled() {
                break;
            }
            if file.is_directory {
                notifier.update(file.size);
                summary.lock().unwrap().files_completed += 1;
                continue;
            }
            if self.opts.only_missing {
                let held = matches!(
                    driver.load_file_manifest(&file.name).await,
                    Ok(Some(stored)) if stored == *file
                );
                if held {
                    notifier.update(file.size);
                    summary.lock().unwrap().files_skipped += 1;
                    continue;
                }
            }

            let file = file.clone();
            let label = file.name.clone();
            let store = driver.store.clone();
            let fetcher = fetcher.clone();
            let config = driver.config.clone();
            let cancel = driver.cancel.clone();
            let notifier = notifier.clone();
            let summary = summary.clone();
            let counters = counters.clone();
            leases
                .run_one(label, async move {
                    let name = file.name.clone();
                    let result =
                        pull_one_file(store, fetcher, config, cancel, notifier, counters, file)
                            .await;
                    match result {
                        Ok(()) => summary.lock().unwrap().files_completed += 1,
                        Err(err) => {
                            warn!(file = %name, error = %err, "failed to pull all blocks");
                            summary.lock().unwrap().files_failed.push(name);
                        }
                    }
                })
                .await;
        }
        leases.wait_all_done().await;
        notifier.stop();

        if driver.cancel.is_cancelled() {
            return Err(FolderError::Cancelled);
        }

        let mut summary = summary.lock().unwrap().clone();
        summary.blocks_from_cache = counters.cached.load(Ordering::Relaxed);
        summary.blocks_downloaded = counters.downloaded.load(Ordering::Relaxed);
        Ok(summary)
    }

    /// Verifies every file against the scan map. Files with unavailable
    /// blocks get their version reset to the empty vector so peers offer
    /// them again.
    pub async fn scan(&self, files: &mut [FileManifest]) -> FolderResult<ScanSummary> {
        let driver = self.driver;
        let check_map = self.check_map.clone().ok_or(FolderError::MissingBlocks {
            file: "scan started without a state map".into(),
        })?;

        let total: u64 = files.iter().map(|f| f.size).sum();
        let notifier = Arc::new(AsyncProgressNotifier::start(
            format!("{}/scan", driver.config.folder_id),
            total,
            driver.config.progress_interval,
        ));
        let leases = ParallelLeases::new("folder-scan", driver.config.file_leases);
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, bool)>();

        for (index, file) in files.iter().enumerate() {
            if driver.cancel.is_cancelled() {
                break;
            }
            if file.is_directory {
                notifier.update(file.size);
                continue;
            }
            let file = file.clone();
            let label = file.name.clone();
            let store = driver.store.clone();
            let check_map = check_map.clone();
            let cancel = driver.cancel.clone();
            let notifier = notifier.clone();
            let tx = tx.clone();
            leases
                .run_one(label, async move {
                    let ok = scan_one_file(&store, &check_map, &file, &notifier, &cancel).await;
                    let _ = tx.send((index, ok));
                })
                .await;
        }
        drop(tx);
        leases.wait_all_done().await;
        notifier.stop();

        if driver.cancel.is_cancelled() {
            return Err(FolderError::Cancelled);
        }

        let mut summary = ScanSummary::default();
        while let Some((index, ok)) = rx.recv().await {
            if ok {
                summary.files_ok += 1;
            } else {
                let file = &mut files[index];
                // the empty vector is strictly older than any peer's version
                // and conflicts with nothing, so the file is simply pulled
                // again
                file.version.reset();
                summary.files_incomplete.push(file.name.clone());
            }
        }
        summary.files_incomplete.sort();
        Ok(summary)
    }

    /// Finishes the pass. After a scan this reclaims storage: free blocks
    /// are offered to the checked-delete service, and our own reservations
    /// on blocks no held file references are dropped first.
    pub async fn finish(self, held: &[FileManifest]) -> FolderResult<()> {
        let Some(check_map) = self.check_map else {
            return Ok(());
        };
        let driver = self.driver;

        let used_hashes: HashSet<&BlockHash> = held
            .iter()
            .flat_map(|f| f.blocks.iter().map(|b| &b.hash))
            .collect();

        let mut offered = 0u64;
        let mut released = 0u64;
        for (hash, state) in check_map.iter() {
            if state.is_available_and_free() {
                driver
                    .delete_service
                    .request_checked_delete(hash.clone())
                    .await;
                offered += 1;
            } else if state.is_available_and_reserved_by_me() && !used_hashes.contains(hash) {
                driver.store.delete_reservation(hash).await?;
                driver
                    .delete_service
                    .request_checked_delete(hash.clone())
                    .await;
                released += 1;
            }
        }
        info!(offered, released, "reclamation pass complete");
        Ok(())
    }
}

/// Returns a block's bytes, reserving it in the bucket; a missing body is
/// fetched from peers and stored under our reservation.
pub async fn get_block_data_from_cache_or_download(
    store: &dyn BlockStore,
    fetcher: &dyn BlockFetcher,
    file: &FileManifest,
    block: &BlockInfo,
) -> FolderResult<(Vec<u8>, BlockSource)> {
    match store.reserve_and_get(&block.hash, true).await? {
        BlockFetch::Present(data) => Ok((data.unwrap_or_default(), BlockSource::Cached)),
        BlockFetch::Missing => {
            let data = fetcher.fetch_block(file, block).await?;
            store.reserve_and_set(&block.hash, &data).await?;
            Ok((data, BlockSource::Downloaded))
        }
    }
}

async fn pull_one_file(
    store: Arc<dyn BlockStore>,
    fetcher: Arc<dyn BlockFetcher>,
    config: FolderConfig,
    cancel: CancellationToken,
    notifier: Arc<AsyncProgressNotifier>,
    counters: Arc<PullCounters>,
    file: FileManifest,
) -> FolderResult<()> {
    let file = Arc::new(file);
    let leases = ParallelLeases::new("file-blocks", config.block_leases);
    let failure: Arc<Mutex<Option<FolderError>>> = Arc::new(Mutex::new(None));

    for block in file.blocks.clone() {
        if cancel.is_cancelled() {
            break;
        }
        let label = format!("{}@{}", file.name, block.offset);
        let store = store.clone();
        let fetcher = fetcher.clone();
        let file = file.clone();
        let cancel = cancel.clone();
        let notifier = notifier.clone();
        let counters = counters.clone();
        let failure = failure.clone();
        let attempts = config.pull_attempts;
        let pause = config.pull_retry_pause;
        leases
            .run_one(label, async move {
                let result = pull_block_with_retry(
                    store.as_ref(),
                    fetcher.as_ref(),
                    &file,
                    &block,
                    attempts,
                    pause,
                    &cancel,
                )
                .await;
                match result {
                    Ok(source) => {
                        match source {
                            BlockSource::Cached => counters.cached.fetch_add(1, Ordering::Relaxed),
                            BlockSource::Downloaded => {
                                counters.downloaded.fetch_add(1, Ordering::Relaxed)
                            }
                        };
                        notifier.update(u64::from(block.size));
                    }
                    Err(err) => {
                        failure.lock().unwrap().get_or_insert(err);
                    }
                }
            })
            .await;
    }

    leases.wait_all_done().await;
    if cancel.is_cancelled() {
        return Err(FolderError::Cancelled);
    }
    if let Some(err) = failure.lock().unwrap().take() {
        return Err(err);
    }

    store
        .set_meta(
            &manifest_meta_name(&config.device_id, &config.folder_id, &file.name),
            &file.to_json()?,
        )
        .await?;
    debug!(file = %file.name, "stored file manifest");
    Ok(())
}

async fn pull_block_with_retry(
    store: &dyn BlockStore,
    fetcher: &dyn BlockFetcher,
    file: &FileManifest,
    block: &BlockInfo,
    attempts: u32,
    pause: std::time::Duration,
    cancel: &CancellationToken,
) -> FolderResult<BlockSource> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match get_block_data_from_cache_or_download(store, fetcher, file, block).await {
            Ok((_, source)) => return Ok(source),
            Err(err) if err.is_cancelled() => return Err(err),
            Err(err) => {
                if attempt >= attempts.max(1) {
                    return Err(err);
                }
                debug!(
                    file = %file.name,
                    hash = %block.hash,
                    attempt,
                    error = %err,
                    "block pull failed, will retry"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(FolderError::Cancelled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
    }
}

async fn scan_one_file(
    store: &Arc<dyn BlockStore>,
    check_map: &HashBlockStateMap,
    file: &FileManifest,
    notifier: &AsyncProgressNotifier,
    cancel: &CancellationToken,
) -> bool {
    let mut all_ok = true;
    for block in &file.blocks {
        let ok = match check_map.get(&block.hash) {
            Some(state) if state.is_available_and_reserved_by_me() => true,
            Some(_) => {
                // present but not held by us; re-reserve, checking existence
                // again since an unheld block may have vanished meanwhile
                match store.reserve_and_get(&block.hash, false).await {
                    Ok(fetch) => fetch.found(),
                    Err(StoreError::Cancelled) => return true,
                    Err(err) => {
                        debug!(file = %file.name, hash = %block.hash, error = %err,
                            "re-reservation failed");
                        false
                    }
                }
            }
            None => false,
        };
        if !ok {
            debug!(file = %file.name, offset = block.offset, hash = %block.hash,
                "block unavailable during scan");
        }
        all_ok = all_ok && ok;
        notifier.update(u64::from(block.size));
        if cancel.is_cancelled() {
            // leave the file untouched; the pass reports cancellation
            return true;
        }
    }
    all_ok
}
