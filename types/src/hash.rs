//! Normalized transaction identifier.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{decode_hash32, TypesError};

/// A 32-byte normalized transaction id.
///
/// Unlike a raw transaction id it does not change when a transaction is
/// malleated or re-mined in a different block, so it is the stable key that
/// ties a payment to the transaction that paid it.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NormalizedTxId([u8; 32]);

impl NormalizedTxId {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl FromStr for NormalizedTxId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        decode_hash32("normalized tx id", s).map(Self)
    }
}

impl fmt::Debug for NormalizedTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NormalizedTxId({})", hex::encode(&self.0[..4]))
    }
}

impl fmt::Display for NormalizedTxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}
