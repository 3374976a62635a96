//! File manifests persisted alongside the blocks they reference.
//!
//! After a file is pulled completely, its manifest is serialised to JSON and
//! stored under `meta/LocalHaveMeta/<device>/<folder>/<path>`. An external
//! mount can then reconstruct the folder tree from bucket metadata alone.

use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use bucketfs_store::BlockHash;

use crate::error::FolderResult;

/// Metadata-key prefix for persisted file manifests.
pub const MANIFEST_META_PREFIX: &str = "LocalHaveMeta";

/// Reference to one block of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    /// Content hash of the block.
    pub hash: BlockHash,
    /// Byte offset of the block within the file.
    pub offset: u64,
    /// Size of the block in bytes.
    pub size: u32,
}

/// One participant's counter within a version vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    /// Participant the counter belongs to.
    pub id: u64,
    /// Monotonic change counter.
    pub value: u64,
}

/// Version vector ordering file mutations across participants.
///
/// The empty vector is strictly older than every non-empty one; resetting a
/// file's version to it forces the file to be pulled again from peers
/// without conflicting with anyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionVector {
    /// The counters, one per participant that modified the file.
    pub counters: Vec<Counter>,
}

impl VersionVector {
    /// Whether this is the empty (strictly oldest) version.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Resets to the empty version.
    pub fn reset(&mut self) {
        self.counters.clear();
    }
}

fn epoch() -> SystemTime {
    SystemTime::UNIX_EPOCH
}

/// Per-file manifest: identity, version and the blocks making up the body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifest {
    /// Path of the file relative to the folder root.
    pub name: String,
    /// Total size in bytes.
    pub size: u64,
    /// Last modification time.
    #[serde(default = "epoch")]
    pub modified: SystemTime,
    /// Whether the entry is a directory (no blocks).
    #[serde(default)]
    pub is_directory: bool,
    /// Version of this file as last synced.
    #[serde(default)]
    pub version: VersionVector,
    /// Block list; empty for directories.
    #[serde(default)]
    pub blocks: Vec<BlockInfo>,
}

impl FileManifest {
    /// Creates a file manifest from its block list.
    pub fn file(name: impl Into<String>, blocks: Vec<BlockInfo>) -> Self {
        let size = blocks.iter().map(|b| u64::from(b.size)).sum();
        Self {
            name: name.into(),
            size,
            modified: SystemTime::now(),
            is_directory: false,
            version: VersionVector::default(),
            blocks,
        }
    }

    /// Creates a directory manifest.
    pub fn directory(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size: 0,
            modified: SystemTime::now(),
            is_directory: true,
            version: VersionVector::default(),
            blocks: Vec::new(),
        }
    }

    /// Serialises to the persisted JSON form.
    pub fn to_json(&self) -> FolderResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parses the persisted JSON form.
    pub fn from_json(data: &[u8]) -> FolderResult<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Metadata name under which a file's manifest is stored.
pub fn manifest_meta_name(device_id: &str, folder_id: &str, path: &str) -> String {
    format!("{}/{}/{}/{}", MANIFEST_META_PREFIX, device_id, folder_id, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(byte: u8, offset: u64) -> BlockInfo {
        BlockInfo {
            hash: BlockHash::new(vec![byte; 4]),
            offset,
            size: 128 * 1024,
        }
    }

    #[test]
    fn test_json_round_trip() {
        let manifest = FileManifest::file("photos/cat.jpg", vec![block(1, 0), block(2, 131072)]);
        let json = manifest.to_json().unwrap();
        let back = FileManifest::from_json(&json).unwrap();
        assert_eq!(back, manifest);
        assert_eq!(back.size, 2 * 128 * 1024);
    }

    #[test]
    fn test_corrupt_json_is_an_error() {
        assert!(FileManifest::from_json(b"{not json").is_err());
        assert!(FileManifest::from_json(b"").is_err());
    }

    #[test]
    fn test_version_reset() {
        let mut manifest = FileManifest::file("a", vec![block(1, 0)]);
        manifest.version.counters.push(Counter { id: 7, value: 3 });
        assert!(!manifest.version.is_empty());
        manifest.version.reset();
        assert!(manifest.version.is_empty());
    }

    #[test]
    fn test_manifest_meta_name_layout() {
        assert_eq!(
            manifest_meta_name("dev1", "folder1", "docs/readme.txt"),
            "LocalHaveMeta/dev1/folder1/docs/readme.txt"
        );
    }

    #[test]
    fn test_directory_manifest_has_no_blocks() {
        let dir = FileManifest::directory("docs");
        assert!(dir.is_directory);
        assert!(dir.blocks.is_empty());
        assert_eq!(dir.size, 0);
    }
}
