//! Key schema mapping block hashes and tags onto bucket keys.
//!
//! A block body lives at `blocks/<hex>`; a participant's relation to a block
//! is a zero-byte tag at `blocks/<hex>.<kind>.<participant>`. All hashes
//! encode to equal-length lowercase hex and the `.` separator sorts below
//! the hex alphabet, so in a byte-lexicographic listing every key belonging
//! to one block is adjacent: the bare body key first, its tags immediately
//! after, the next hash after that. The enumeration engine depends on this
//! adjacency and on nothing else about the backend's listing.

use std::fmt;
use std::time::{Duration, SystemTime};

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};

/// Key prefix for block bodies and their tags.
pub const BLOCK_PREFIX: &str = "blocks";

/// Key prefix for metadata objects.
pub const META_PREFIX: &str = "meta";

/// Tag kind announcing that a participant still needs a block.
pub const USE_TAG: &str = "used-by";

/// Tag kind announcing that a participant intends to delete a block soon.
pub const DELETE_TAG: &str = "deletion-by";

/// Freshness window for `deletion-by` tags, and the grace period between
/// announcing a delete and performing it. Tags older than this are stale
/// leftovers and ignored by readers.
pub const FRESHNESS_WINDOW: Duration = Duration::from_secs(60);

/// A block's content hash. The byte string is opaque to the store; keys
/// render it as lowercase hex.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockHash(Vec<u8>);

impl BlockHash {
    /// Wraps raw hash bytes.
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// The raw hash bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// True for the zero-length hash, which never names a block.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lowercase hex rendering, as used in keys.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.0)
    }

    /// Parses a hex rendering back into a hash.
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        hex::decode(s)
            .map(Self)
            .map_err(|_| StoreError::InvalidHash(s.to_string()))
    }

    /// First byte of the hash, used as a coarse progress monotone during
    /// sorted enumeration.
    pub fn first_byte(&self) -> Option<u8> {
        self.0.first().copied()
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash({})", self.to_hex())
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for BlockHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for BlockHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        BlockHash::from_hex(&s).map_err(D::Error::custom)
    }
}

/// Storage key of a block body.
pub fn block_key(hash: &BlockHash) -> String {
    format!("{}/{}", BLOCK_PREFIX, hash.to_hex())
}

/// Storage key of one participant's tag on a block.
pub fn tag_key(hash: &BlockHash, kind: &str, participant: &str) -> String {
    format!("{}.{}.{}", block_key(hash), kind, participant)
}

/// Storage key of a named metadata object.
pub fn meta_key(name: &str) -> String {
    format!("{}/{}", META_PREFIX, name)
}

/// A parsed storage key from a listing under [`BLOCK_PREFIX`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKey {
    /// The bare block body.
    Data {
        /// Hex rendering of the block hash.
        hash_hex: String,
    },
    /// A `used-by` tag.
    Use {
        /// Hex rendering of the block hash.
        hash_hex: String,
        /// The participant holding the reservation.
        participant: String,
    },
    /// A `deletion-by` tag. Only its modification time matters beyond the hash.
    Delete {
        /// Hex rendering of the block hash.
        hash_hex: String,
    },
    /// A key with an unrecognised suffix shape.
    Other,
}

/// Parses a full storage key (`blocks/...`) into its block-key shape.
pub fn parse_block_key(key: &str) -> BlockKey {
    let Some(rest) = key.strip_prefix(BLOCK_PREFIX).and_then(|r| r.strip_prefix('/')) else {
        return BlockKey::Other;
    };
    let mut elements = rest.split('.');
    let hash_hex = elements.next().unwrap_or_default().to_string();
    match elements.next() {
        None => BlockKey::Data { hash_hex },
        Some(kind) if kind == USE_TAG => match elements.next() {
            Some(participant) => BlockKey::Use {
                hash_hex,
                participant: participant.to_string(),
            },
            None => BlockKey::Other,
        },
        Some(kind) if kind == DELETE_TAG => BlockKey::Delete { hash_hex },
        Some(_) => BlockKey::Other,
    }
}

/// Whether a tag modified at `modified` is still within `window` of now.
/// Timestamps from the future count as fresh.
pub fn fresh_within(modified: SystemTime, window: Duration) -> bool {
    SystemTime::now()
        .duration_since(modified)
        .map(|age| age < window)
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hash(bytes: &[u8]) -> BlockHash {
        BlockHash::new(bytes)
    }

    #[test]
    fn test_hex_round_trip() {
        let h = hash(&[0x00, 0xab, 0xff]);
        assert_eq!(h.to_hex(), "00abff");
        assert_eq!(BlockHash::from_hex("00abff").unwrap(), h);
    }

    #[test]
    fn test_invalid_hex_rejected() {
        assert!(BlockHash::from_hex("zz").is_err());
        assert!(BlockHash::from_hex("abc").is_err());
    }

    #[test]
    fn test_key_shapes() {
        let h = hash(&[0x12, 0x34]);
        assert_eq!(block_key(&h), "blocks/1234");
        assert_eq!(tag_key(&h, USE_TAG, "dev1"), "blocks/1234.used-by.dev1");
        assert_eq!(
            tag_key(&h, DELETE_TAG, "dev2"),
            "blocks/1234.deletion-by.dev2"
        );
        assert_eq!(meta_key("BlockCountHint"), "meta/BlockCountHint");
    }

    #[test]
    fn test_parse_block_key() {
        assert_eq!(
            parse_block_key("blocks/abcd"),
            BlockKey::Data {
                hash_hex: "abcd".into()
            }
        );
        assert_eq!(
            parse_block_key("blocks/abcd.used-by.dev1"),
            BlockKey::Use {
                hash_hex: "abcd".into(),
                participant: "dev1".into()
            }
        );
        assert_eq!(
            parse_block_key("blocks/abcd.deletion-by.dev1"),
            BlockKey::Delete {
                hash_hex: "abcd".into()
            }
        );
        assert_eq!(parse_block_key("blocks/abcd.something.x"), BlockKey::Other);
        assert_eq!(parse_block_key("meta/abcd"), BlockKey::Other);
    }

    #[test]
    fn test_one_block_keys_are_adjacent_in_sorted_order() {
        let a = hash(&[0xab, 0xcd]);
        let b = hash(&[0xab, 0xce]);
        let mut keys = vec![
            tag_key(&b, USE_TAG, "dev1"),
            block_key(&b),
            tag_key(&a, DELETE_TAG, "dev2"),
            block_key(&a),
            tag_key(&a, USE_TAG, "dev1"),
        ];
        keys.sort();
        assert_eq!(
            keys,
            vec![
                "blocks/abcd",
                "blocks/abcd.deletion-by.dev2",
                "blocks/abcd.used-by.dev1",
                "blocks/abce",
                "blocks/abce.used-by.dev1",
            ]
        );
    }

    #[test]
    fn test_fresh_within() {
        let now = SystemTime::now();
        assert!(fresh_within(now, Duration::from_secs(60)));
        assert!(!fresh_within(
            now - Duration::from_secs(120),
            Duration::from_secs(60)
        ));
        // clock skew: future timestamps are fresh
        assert!(fresh_within(now + Duration::from_secs(5), Duration::from_secs(60)));
    }

    #[test]
    fn test_serde_as_hex_string() {
        let h = hash(&[0xde, 0xad]);
        let json = serde_json::to_string(&h).unwrap();
        assert_eq!(json, "\"dead\"");
        let back: BlockHash = serde_json::from_str(&json).unwrap();
        assert_eq!(back, h);
    }
}
