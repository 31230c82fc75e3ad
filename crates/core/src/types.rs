use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::SyncError;

/// Height of a block within the chain
pub type Height = u64;

/// An inclusive, non-empty range of block heights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct HeightRange {
    start: Height,
    end: Height,
}

impl HeightRange {
    /// Create a new range, rejecting `start > end`
    pub fn new(start: Height, end: Height) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidRange { start, end });
        }
        Ok(Self { start, end })
    }

    /// First height of the range
    pub fn start(&self) -> Height {
        self.start
    }

    /// Last height of the range (inclusive)
    pub fn end(&self) -> Height {
        self.end
    }

    /// Number of heights in the range, saturating for the full `u64` span
    pub fn len(&self) -> u64 {
        (self.end - self.start).saturating_add(1)
    }

    /// A valid range always holds at least one height
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Check whether a height lies inside the range
    pub fn contains(&self, height: Height) -> bool {
        height >= self.start && height <= self.end
    }

    /// Split the range into consecutive sub-ranges of at most `size` heights.
    ///
    /// A `size` of zero is treated as one.
    pub fn windows(&self, size: u64) -> Windows {
        Windows {
            next: Some(self.start),
            end: self.end,
            size: size.max(1),
        }
    }

    /// Iterate over every height in the range
    pub fn heights(&self) -> impl Iterator<Item = Height> {
        self.start..=self.end
    }
}

impl fmt::Display for HeightRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

/// Iterator over the windows of a [`HeightRange`]
#[derive(Debug, Clone)]
pub struct Windows {
    next: Option<Height>,
    end: Height,
    size: u64,
}

impl Iterator for Windows {
    type Item = HeightRange;

    fn next(&mut self) -> Option<Self::Item> {
        let start = self.next?;
        let end = start.saturating_add(self.size - 1).min(self.end);
        self.next = if end == self.end { None } else { Some(end + 1) };
        Some(HeightRange { start, end })
    }
}

/// A block hash
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl BlockHash {
    /// Create a new block hash from bytes
    pub fn new(value: [u8; 32]) -> Self {
        Self(value)
    }

    /// Get the underlying bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to hex string for display
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// A block fetched from a peer during synchronization.
///
/// The hash commits to the height, the parent hash and the payload, so a
/// block whose content was altered in transit fails [`SyncedBlock::verify_hash`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncedBlock {
    /// Height of the block
    pub height: Height,

    /// Hash of the parent block
    pub parent_hash: BlockHash,

    /// Opaque block body
    pub payload: Vec<u8>,

    /// Hash of this block
    pub hash: BlockHash,
}

impl SyncedBlock {
    /// Create a new block, computing its hash
    pub fn new(height: Height, parent_hash: BlockHash, payload: Vec<u8>) -> Self {
        let hash = Self::compute_hash(height, &parent_hash, &payload);
        Self {
            height,
            parent_hash,
            payload,
            hash,
        }
    }

    /// Hash the block contents
    pub fn compute_hash(height: Height, parent_hash: &BlockHash, payload: &[u8]) -> BlockHash {
        let mut hasher = Sha256::new();
        hasher.update(height.to_be_bytes());
        hasher.update(parent_hash.as_bytes());
        hasher.update(payload);
        let result = hasher.finalize();
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&result);
        BlockHash(hash)
    }

    /// Check that the stored hash matches the block contents
    pub fn verify_hash(&self) -> bool {
        Self::compute_hash(self.height, &self.parent_hash, &self.payload) == self.hash
    }
}
