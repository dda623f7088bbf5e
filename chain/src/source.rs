//! The chain source port.

use async_trait::async_trait;
use tally_types::{Block, BlockHash, ObservedTransaction};

use crate::ChainError;

/// Wallet activity reported since a given block.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SinceBlock {
    pub transactions: Vec<ObservedTransaction>,
    /// The chain tip the listing was taken against.
    pub new_tip: BlockHash,
}

/// An external, authoritative view of the chain.
///
/// Implementations own request-level timeouts and retries; the reconciler
/// treats every error as transient and retries on its next pass.
#[async_trait]
pub trait ChainSource: Send + Sync {
    /// Hash of the block the source currently considers the chain tip.
    async fn current_tip(&self) -> Result<BlockHash, ChainError>;

    /// Look up a block. `Ok(None)` means the source has never heard of it.
    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError>;

    /// Every wallet transaction since `hash`, and the tip the listing ends at.
    async fn list_since(&self, hash: &BlockHash) -> Result<SinceBlock, ChainError>;
}
