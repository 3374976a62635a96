//! Cloud bucket backends: S3, Google Cloud Storage and Azure Blob.
//!
//! Adapts the `object_store` crate to [`ObjectBucket`]. The reservation key
//! schema uses raw string prefixes (`blocks/<hex>`), which do not align with
//! `object_store`'s path-segment prefixes, so listings page with an offset
//! and filter client-side. All three services return keys in
//! byte-lexicographic order, which the enumeration engine requires anyway.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::azure::MicrosoftAzureBuilder;
use object_store::gcp::GoogleCloudStorageBuilder;
use object_store::path::Path as ObjectPath;
use object_store::prefix::PrefixStore;
use object_store::{DynObjectStore, ObjectMeta, ObjectStore, PutPayload};

use crate::bucket::{ListEntry, ListPage, ObjectBucket};
use crate::error::{StoreError, StoreResult};

/// Bucket backend over an `object_store` implementation.
pub struct CloudBucket {
    store: Arc<DynObjectStore>,
}

impl CloudBucket {
    /// Wraps an already-built `object_store` instance.
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self { store }
    }
}

fn entry_from_meta(meta: &ObjectMeta) -> ListEntry {
    ListEntry {
        key: meta.location.to_string(),
        size: meta.size as u64,
        modified: meta.last_modified.into(),
    }
}

fn map_get_err(key: &str, err: object_store::Error) -> StoreError {
    match err {
        object_store::Error::NotFound { .. } => StoreError::NotFound {
            key: key.to_string(),
        },
        other => StoreError::Backend(other),
    }
}

#[async_trait]
impl ObjectBucket for CloudBucket {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let result = self
            .store
            .get(&ObjectPath::from(key))
            .await
            .map_err(|e| map_get_err(key, e))?;
        let bytes = result.bytes().await.map_err(|e| map_get_err(key, e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        self.store
            .put(&ObjectPath::from(key), PutPayload::from(data.to_vec()))
            .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.store
            .delete(&ObjectPath::from(key))
            .await
            .map_err(|e| map_get_err(key, e))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        match self.store.head(&ObjectPath::from(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(err) => Err(StoreError::Backend(err)),
        }
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        let mut entries = Vec::new();
        let offset = match start_after {
            Some(token) => token.to_string(),
            None => {
                // Offsets are exclusive, and the prefix itself may name an
                // object (the bare block body): probe it separately.
                if !prefix.is_empty() && !prefix.ends_with('/') {
                    match self.store.head(&ObjectPath::from(prefix)).await {
                        Ok(meta) => entries.push(entry_from_meta(&meta)),
                        Err(object_store::Error::NotFound { .. }) => {}
                        Err(err) => return Err(StoreError::Backend(err)),
                    }
                }
                prefix.to_string()
            }
        };

        let offset_path = ObjectPath::from(offset.as_str());
        let mut stream = self.store.list_with_offset(None, &offset_path);
        while entries.len() < limit {
            match stream.next().await {
                Some(item) => {
                    let meta = item?;
                    let key = meta.location.to_string();
                    if !key.starts_with(prefix) {
                        if key.as_str() < prefix {
                            continue;
                        }
                        return Ok(ListPage {
                            entries,
                            next_token: None,
                        });
                    }
                    entries.push(entry_from_meta(&meta));
                }
                None => {
                    return Ok(ListPage {
                        entries,
                        next_token: None,
                    })
                }
            }
        }
        let next_token = entries.last().map(|e| e.key.clone());
        Ok(ListPage {
            entries,
            next_token,
        })
    }
}

/// Builds the cloud backend selected by `url`'s scheme. The URL's host names
/// the bucket or container; a non-empty path becomes a key prefix.
pub(crate) fn open_cloud_bucket(url: &url::Url) -> StoreResult<Arc<dyn ObjectBucket>> {
    let unsupported = || StoreError::UnsupportedUrl {
        url: url.to_string(),
    };
    let container = url.host_str().filter(|h| !h.is_empty()).ok_or_else(unsupported)?;
    let prefix = url.path().trim_matches('/');

    let store: Arc<DynObjectStore> = match url.scheme() {
        "s3" => with_prefix(
            AmazonS3Builder::from_env()
                .with_bucket_name(container)
                .build()?,
            prefix,
        ),
        "gs" => with_prefix(
            GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(container)
                .build()?,
            prefix,
        ),
        "azblob" => with_prefix(
            MicrosoftAzureBuilder::from_env()
                .with_container_name(container)
                .build()?,
            prefix,
        ),
        _ => return Err(unsupported()),
    };

    Ok(Arc::new(CloudBucket::new(store)))
}

fn with_prefix<T: ObjectStore>(store: T, prefix: &str) -> Arc<DynObjectStore> {
    if prefix.is_empty() {
        Arc::new(store)
    } else {
        Arc::new(PrefixStore::new(store, prefix))
    }
}
