//! Transactions observed on the chain during a reconciliation pass.

use serde::{Deserialize, Serialize};

use crate::{BlockHash, NormalizedTxId, PaymentAddress};

/// A wallet transaction reported by the chain source.
///
/// Ephemeral: sourced fresh on every pass and never persisted as-is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObservedTransaction {
    pub normalized_tx_id: Option<NormalizedTxId>,
    /// Raw transaction id, kept for diagnostics.
    pub tx_id: Option<String>,
    pub address: Option<PaymentAddress>,
    /// Received amount in satoshis.
    pub amount: u64,
    /// `None` means seen in the mempool but not yet mined.
    pub block_hash: Option<BlockHash>,
    pub confirmations: u32,
}

impl ObservedTransaction {
    pub fn is_mined(&self) -> bool {
        self.block_hash.is_some()
    }
}
