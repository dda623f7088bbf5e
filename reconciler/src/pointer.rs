//! The persisted "last processed block" pointer.

use std::sync::Arc;

use tracing::info;

use tally_chain::ChainSource;
use tally_store::{LedgerStore, PointerStore};
use tally_types::{BlockHash, BlockPointer};

use crate::ReconcileError;

pub struct BlockPointerStore {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSource>,
}

impl BlockPointerStore {
    pub fn new(store: Arc<dyn LedgerStore>, chain: Arc<dyn ChainSource>) -> Self {
        Self { store, chain }
    }

    pub fn get(&self) -> Result<Option<BlockPointer>, ReconcileError> {
        Ok(self.store.get_block_pointer()?)
    }

    /// The persisted pointer, seeded from the chain tip on first use.
    pub async fn ensure(&self) -> Result<BlockPointer, ReconcileError> {
        if let Some(pointer) = self.get()? {
            return Ok(pointer);
        }
        let tip = self.chain.current_tip().await?;
        let pointer = BlockPointer::new(tip);
        self.store.put_block_pointer(&pointer)?;
        info!(hash = %tip, "seeded block pointer from chain tip");
        Ok(pointer)
    }

    /// Move the pointer to `new_hash`. Writes nothing when it already points
    /// there. Returns whether the pointer moved.
    pub fn advance(&self, pointer: &mut BlockPointer, new_hash: BlockHash) -> Result<bool, ReconcileError> {
        if pointer.hash == new_hash {
            return Ok(false);
        }
        let mut moved = pointer.clone();
        moved.hash = new_hash;
        self.store.put_block_pointer(&moved)?;
        info!(from = %pointer.hash, to = %new_hash, "block pointer advanced");
        *pointer = moved;
        Ok(true)
    }
}
