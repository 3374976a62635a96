//! Local-directory bucket backend.
//!
//! Backs `file://` URLs; intended for development and single-machine tests.
//! Keys map to relative paths below the root directory. Listings walk the
//! tree and sort, so paging is byte-lexicographic like the cloud backends.

use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use async_trait::async_trait;

use crate::bucket::{ListEntry, ListPage, ObjectBucket};
use crate::error::{StoreError, StoreResult};

/// Bucket stored as plain files under a root directory.
pub struct FsBucket {
    root: PathBuf,
}

impl FsBucket {
    /// Creates a bucket rooted at `root`. The directory is created lazily on
    /// the first write.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> StoreResult<PathBuf> {
        let rel = Path::new(key);
        let clean = !key.is_empty()
            && rel
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !clean {
            return Err(StoreError::NotFound {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(rel))
    }
}

fn not_found(key: &str, err: std::io::Error) -> StoreError {
    if err.kind() == std::io::ErrorKind::NotFound {
        StoreError::NotFound {
            key: key.to_string(),
        }
    } else {
        StoreError::Io(err)
    }
}

fn walk(dir: &Path, root: &Path, out: &mut Vec<(String, u64, SystemTime)>) -> std::io::Result<()> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let meta = entry.metadata()?;
        if meta.is_dir() {
            walk(&path, root, out)?;
        } else {
            let Ok(rel) = path.strip_prefix(root) else {
                continue;
            };
            let key = rel
                .components()
                .filter_map(|c| c.as_os_str().to_str())
                .collect::<Vec<_>>()
                .join("/");
            let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            out.push((key, meta.len(), modified));
        }
    }
    Ok(())
}

#[async_trait]
impl ObjectBucket for FsBucket {
    async fn get(&self, key: &str) -> StoreResult<Vec<u8>> {
        let path = self.path_for(key)?;
        tokio::fs::read(&path).await.map_err(|e| not_found(key, e))
    }

    async fn put(&self, key: &str, data: &[u8]) -> StoreResult<()> {
        let path = self.path_for(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, data).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.path_for(key)?;
        tokio::fs::remove_file(&path)
            .await
            .map_err(|e| not_found(key, e))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.path_for(key)?;
        Ok(tokio::fs::try_exists(&path).await?)
    }

    async fn list_page(
        &self,
        prefix: &str,
        start_after: Option<&str>,
        limit: usize,
    ) -> StoreResult<ListPage> {
        let root = self.root.clone();
        let prefix = prefix.to_string();
        let start_after = start_after.map(str::to_string);
        let page = tokio::task::spawn_blocking(move || -> StoreResult<ListPage> {
            let mut all = Vec::new();
            walk(&root, &root, &mut all)?;
            all.sort_by(|a, b| a.0.cmp(&b.0));

            let mut entries = Vec::new();
            let mut next_token = None;
            for (key, size, modified) in all {
                if !key.starts_with(&prefix) {
                    continue;
                }
                if let Some(token) = &start_after {
                    if key.as_str() <= token.as_str() {
                        continue;
                    }
                }
                if entries.len() == limit {
                    next_token = entries.last().map(|e: &ListEntry| e.key.clone());
                    break;
                }
                entries.push(ListEntry {
                    key,
                    size,
                    modified,
                });
            }
            Ok(ListPage {
                entries,
                next_token,
            })
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::other(e)))??;
        Ok(page)
    }
}
