//! Participant and folder discovery from persisted manifests.
//!
//! An external mount knows only the bucket URL. The participants that wrote
//! manifests, and the folders each one holds, are recoverable from the
//! `meta/LocalHaveMeta/<device>/<folder>/...` key layout alone.

use std::sync::Arc;

use bucketfs_store::{meta_key, ObjectBucket};

use crate::error::FolderResult;
use crate::manifest::MANIFEST_META_PREFIX;

const DISCOVERY_PAGE_SIZE: usize = 1000;

/// Lists the participant ids that have stored manifests in `bucket`.
pub async fn list_device_ids(bucket: &Arc<dyn ObjectBucket>) -> FolderResult<Vec<String>> {
    let prefix = format!("{}/", meta_key(MANIFEST_META_PREFIX));
    list_child_components(bucket, &prefix).await
}

/// Lists the folder ids stored by `device_id`.
pub async fn list_folder_ids(
    bucket: &Arc<dyn ObjectBucket>,
    device_id: &str,
) -> FolderResult<Vec<String>> {
    let prefix = format!("{}/{}/", meta_key(MANIFEST_META_PREFIX), device_id);
    list_child_components(bucket, &prefix).await
}

/// Collects the distinct first path components below `prefix`. Listing is
/// sorted, so duplicates arrive adjacent and one-entry deduplication
/// suffices.
async fn list_child_components(
    bucket: &Arc<dyn ObjectBucket>,
    prefix: &str,
) -> FolderResult<Vec<String>> {
    let mut names: Vec<String> = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = bucket
            .list_page(prefix, token.as_deref(), DISCOVERY_PAGE_SIZE)
            .await?;
        for entry in &page.entries {
            let Some(rest) = entry.key.strip_prefix(prefix) else {
                continue;
            };
            let Some(first) = rest.split('/').next().filter(|s| !s.is_empty()) else {
                continue;
            };
            if names.last().map(String::as_str) != Some(first) {
                names.push(first.to_string());
            }
        }
        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }
    Ok(names)
}
