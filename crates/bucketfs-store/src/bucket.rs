//! Uniform object-bucket abstraction over heterogeneous object stores.
//!
//! The block store speaks to its backend exclusively through [`ObjectBucket`]:
//! whole-object get/put/delete/exists plus paged listing. Every backend lists
//! keys in byte-lexicographic order; the reservation protocol and the
//! enumeration engine are built on that single guarantee.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::error::{StoreError, StoreResult};

/// One listed object.
#[derive(Debug, Clone)]
pub struct ListEntry {
    /// Full storage key.
    pub key: String,
    /// Object size in bytes.
    pub size: u64,
    /// Last modification time.
    pub modified: SystemTime,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Entries in byte-lexicographic key order.
    pub entries: Vec<ListEntry>,
    /// Token resuming the listing after the last entry; `None` when the
    /// listing may be exhausted.
    pub next_token: Option<String>,
}

/// Object-bucket operations common to all backends.
///
/// Listings return keys greater than or equal to `prefix` (strictly greater
/// than `start_after` when resuming) that start with `prefix`, in
/// byte-lexicographic order.
#[async_trait]
pub trait ObjectBucket: Send + Sync {
    /// Reads the full body stored under `key`.
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>>;

    /// Writes `data` under `key`, replacing any previous object and
    /// refreshing its modification time.
    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()>;

    /// Removes the object stored under `key`.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Whether an object exists under `key`.
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Lists up to `limit` keys starting with `prefix`, resuming strictly
    /// after `start_after` when given.
    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage>;
}

struct MemoryObject {
    data: Vec<u8>,
    modified: SystemTime,
}

/// In-memory bucket backend.
///
/// Backs `mem://` URLs and most tests. Keys live in a sorted map, so paging
/// is byte-lexicographic by construction. Each put refreshes the stored
/// modification time.
#[derive(Default)]
pub struct MemoryBucket {
    objects: Mutex<BTreeMap<String, MemoryObject>>,
}

impl MemoryBucket {
    /// Creates an empty bucket.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.lock().unwrap().len()
    }

    /// Whether the bucket holds no objects.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Overrides the stored modification time of `key`. Lets tests age a
    /// deletion tag past the freshness window without sleeping.
    pub fn set_modified(&self, key: &str, modified: SystemTime) {
        if let Some(obj) = self.objects.lock().unwrap().get_mut(key) {
            obj.modified = modified;
        }
    }
}

#[async_trait]
impl ObjectBucket for MemoryBucket {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(key)
            .map(|obj| obj.data.clone())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.objects.lock().unwrap().insert(
            key.to_string(),
            MemoryObject {
                data: data.to_vec(),
                modified: SystemTime::now(),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.objects
            .lock()
            .unwrap()
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound {
                key: key.to_string(),
            })
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        Ok(self.objects.lock().unwrap().contains_key(key))
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        let objects = self.objects.lock().unwrap();
        let lower = match start_after {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Included(prefix.to_string()),
        };
        let mut entries = Vec::new();
        let mut next_token = None;
        for (key, obj) in objects.range::<String, _>((lower, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                if key.as_str() < prefix {
                    continue;
                }
                break;
            }
            if entries.len() == limit {
                next_token = entries.last().map(|e: &ListEntry| e.key.clone());
                break;
            }
            entries.push(ListEntry {
                key: key.clone(),
                size: obj.data.len() as u64,
                modified: obj.modified,
            });
        }
        Ok(ListPage {
            entries,
            next_token,
        })
    }
}

/// Opens a bucket selected by URL scheme.
///
/// Supported schemes: `mem://` (fresh in-memory bucket), `file://<path>`
/// (local directory), `s3://bucket[/prefix]`, `gs://bucket[/prefix]` and
/// `azblob://container[/prefix]`. Credentials for the cloud schemes come
/// from the backend's usual environment variables.
pub fn open_bucket_url(url: &str) -> StoreResult<Arc<dyn ObjectBucket>> {
    let parsed = url::Url::parse(url).map_err(|_| StoreError::UnsupportedUrl {
        url: url.to_string(),
    })?;
    match parsed.scheme() {
        "mem" => Ok(Arc::new(MemoryBucket::new())),
        "file" => Ok(Arc::new(crate::fs_bucket::FsBucket::new(parsed.path()))),
        "s3" | "gs" | "azblob" => crate::cloud_bucket::open_cloud_bucket(&parsed),
        _ => Err(StoreError::UnsupportedUrl {
            url: url.to_string(),
        }),
    }
}
