//! Parse errors for domain types.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid hex in {kind}: {reason}")]
    InvalidHex { kind: &'static str, reason: String },

    #[error("{kind} must be 32 bytes, got {len}")]
    InvalidLength { kind: &'static str, len: usize },

    #[error("invalid payment address: {0:?}")]
    InvalidAddress(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

/// Decode a 64-character hex string into 32 bytes.
pub(crate) fn decode_hash32(kind: &'static str, s: &str) -> Result<[u8; 32], TypesError> {
    let bytes = hex::decode(s.trim()).map_err(|e| TypesError::InvalidHex {
        kind,
        reason: e.to_string(),
    })?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| TypesError::InvalidLength { kind, len })
}
