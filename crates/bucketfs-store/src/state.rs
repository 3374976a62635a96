//! Per-block reservation state and the streaming listing accumulator.

use std::collections::HashMap;

use crate::key::BlockHash;

/// Derived reservation state of one block, computed from a listing and never
/// stored anywhere.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HashBlockState {
    /// The block body itself is present.
    pub data_exists: bool,
    /// A `used-by` tag with our participant id exists.
    pub reserved_by_me: bool,
    /// A `used-by` tag with some other participant id exists.
    pub reserved_by_others: bool,
    /// A fresh `deletion-by` tag exists; readers treat the block as absent
    /// until the tag ages out or is removed.
    pub deletion_pending: bool,
}

impl HashBlockState {
    /// Body present and no fresh deletion announced.
    pub fn is_available(&self) -> bool {
        self.data_exists && !self.deletion_pending
    }

    /// Available and reserved by nobody: a reclamation candidate.
    pub fn is_available_and_free(&self) -> bool {
        self.is_available() && !self.reserved_by_me && !self.reserved_by_others
    }

    /// Available and carrying our own reservation.
    pub fn is_available_and_reserved_by_me(&self) -> bool {
        self.is_available() && self.reserved_by_me
    }
}

/// A hash paired with its accumulated state, as emitted by enumeration.
#[derive(Debug, Clone)]
pub struct HashAndState {
    /// The block hash.
    pub hash: BlockHash,
    /// Its accumulated reservation state.
    pub state: HashBlockState,
}

/// In-memory result of one full enumeration pass.
pub type HashBlockStateMap = HashMap<BlockHash, HashBlockState>;

/// Single-pass accumulator over a sorted listing of block keys.
///
/// Feed it every listed object in key order; each call returns the completed
/// record of the previous hash once a key for a different hash arrives.
/// Records are only emitted for blocks whose body was seen, so orphan tags
/// produce nothing. Tags listed before their block's body are ignored; the
/// key schema guarantees the body sorts first (see [`crate::key`]).
pub struct StateBuilder {
    own_id: String,
    current_hex: String,
    current: HashBlockState,
}

impl StateBuilder {
    /// Creates a builder accumulating reservations relative to `own_id`.
    pub fn new(own_id: impl Into<String>) -> Self {
        Self {
            own_id: own_id.into(),
            current_hex: String::new(),
            current: HashBlockState::default(),
        }
    }

    fn roll(&mut self, hash_hex: &str) -> Option<HashAndState> {
        if hash_hex == self.current_hex {
            return None;
        }
        let finished = self.take_current();
        self.current_hex = hash_hex.to_string();
        finished
    }

    fn take_current(&mut self) -> Option<HashAndState> {
        let state = std::mem::take(&mut self.current);
        if !state.data_exists {
            return None;
        }
        let hash = BlockHash::from_hex(&self.current_hex).ok()?;
        Some(HashAndState { hash, state })
    }

    /// Records the bare block body.
    pub fn add_data(&mut self, hash_hex: &str) -> Option<HashAndState> {
        let finished = self.roll(hash_hex);
        self.current.data_exists = true;
        finished
    }

    /// Records a `used-by` tag held by `participant`.
    pub fn add_use(&mut self, hash_hex: &str, participant: &str) -> Option<HashAndState> {
        let finished = self.roll(hash_hex);
        if self.current.is_available() {
            if participant == self.own_id {
                self.current.reserved_by_me = true;
            } else {
                self.current.reserved_by_others = true;
            }
        }
        finished
    }

    /// Records a fresh `deletion-by` tag. Stale tags must be filtered out by
    /// the caller, which owns the listing entry's modification time.
    pub fn add_delete(&mut self, hash_hex: &str) -> Option<HashAndState> {
        let finished = self.roll(hash_hex);
        self.current.deletion_pending = true;
        finished
    }

    /// Flushes the record of the last hash seen, if its body existed.
    pub fn finish(mut self) -> Option<HashAndState> {
        self.take_current()
    }
}
