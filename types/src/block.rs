//! Block identifiers, the externally reported block view, and the persisted
//! "last processed block" pointer.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{decode_hash32, TypesError};

/// A 32-byte block hash, as reported by the chain source.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockHash([u8; 32]);

impl Default for BlockHash {
    fn default() -> Self {
        Self::ZERO
    }
}

impl BlockHash {
    pub const ZERO: Self = Self([0u8; 32]);

    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl FromStr for BlockHash {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hash32("block hash", s).map(Self)
    }
}

impl fmt::Debug for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockHash(")?;
        for b in &self.0[..4] {
            write!(f, "{:02x}", b)?;
        }
        write!(f, "\u{2026})")
    }
}

impl fmt::Display for BlockHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// A block as reported by the chain source. Read-only; never persisted here.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: BlockHash,
    /// `None` only for the genesis block.
    pub previous_hash: Option<BlockHash>,
    pub confirmations: u32,
    /// Whether the chain source still considers this block part of the
    /// canonical chain.
    pub is_valid: bool,
}

/// The single persisted "last processed block" record.
///
/// Created once from the chain tip, then mutated in place and never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPointer {
    pub id: String,
    pub hash: BlockHash,
}

impl BlockPointer {
    /// Document id of the singleton pointer.
    pub const SINGLETON_ID: &'static str = "last_block";

    pub fn new(hash: BlockHash) -> Self {
        Self {
            id: Self::SINGLETON_ID.to_string(),
            hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GENESIS: &str = "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f";

    #[test]
    fn parse_and_display_round_trip() {
        let hash: BlockHash = GENESIS.parse().unwrap();
        assert_eq!(hash.to_string(), GENESIS);
        assert!(!hash.is_zero());
    }

    #[test]
    fn rejects_short_hash() {
        let err = "abcd".parse::<BlockHash>().unwrap_err();
        assert_eq!(
            err,
            TypesError::InvalidLength {
                kind: "block hash",
                len: 2
            }
        );
    }

    #[test]
    fn rejects_non_hex() {
        assert!("zz".repeat(32).parse::<BlockHash>().is_err());
    }

    #[test]
    fn debug_is_abbreviated() {
        let hash = BlockHash::new([0xab; 32]);
        assert_eq!(format!("{:?}", hash), "BlockHash(abababab\u{2026})");
    }

    #[test]
    fn pointer_uses_singleton_id() {
        let pointer = BlockPointer::new(BlockHash::ZERO);
        assert_eq!(pointer.id, BlockPointer::SINGLETON_ID);
    }
}
