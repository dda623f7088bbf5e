//! Nullable chain source: a scriptable block tree for testing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tally_chain::{ChainError, ChainSource, SinceBlock};
use tally_types::{Block, BlockHash, ObservedTransaction};

#[derive(Default)]
struct ChainState {
    tip: BlockHash,
    blocks: HashMap<BlockHash, Block>,
    /// Canned `list_since` answers keyed by the `since` hash.
    since: HashMap<BlockHash, SinceBlock>,
    /// Fallback answer when no canned response matches.
    transactions: Vec<ObservedTransaction>,
    get_block_calls: Vec<BlockHash>,
    list_since_calls: Vec<BlockHash>,
}

/// A chain source whose blocks, tip and wallet activity are set by the test.
///
/// Unknown blocks are reported as absent. `list_since` returns the canned
/// response registered for the requested hash, or every pushed transaction
/// together with the current tip.
#[derive(Default)]
pub struct NullChain {
    state: Mutex<ChainState>,
    fail_tip: AtomicBool,
    fail_blocks: AtomicBool,
    fail_list_since: AtomicBool,
}

impl NullChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the hash `current_tip` reports.
    pub fn set_tip(&self, tip: BlockHash) {
        self.state.lock().unwrap().tip = tip;
    }

    pub fn add_block(&self, block: Block) {
        self.state.lock().unwrap().blocks.insert(block.hash, block);
    }

    /// Add a valid block on top of `previous`.
    pub fn add_valid_block(&self, hash: BlockHash, previous: Option<BlockHash>, confirmations: u32) {
        self.add_block(Block {
            hash,
            previous_hash: previous,
            confirmations,
            is_valid: true,
        });
    }

    /// Mark a known block as reorganized away.
    pub fn invalidate(&self, hash: &BlockHash) {
        if let Some(block) = self.state.lock().unwrap().blocks.get_mut(hash) {
            block.is_valid = false;
            block.confirmations = 0;
        }
    }

    /// Forget a block entirely, as if the node had never seen it.
    pub fn forget(&self, hash: &BlockHash) {
        self.state.lock().unwrap().blocks.remove(hash);
    }

    /// Register the answer `list_since(since)` returns.
    pub fn set_since(&self, since: BlockHash, response: SinceBlock) {
        self.state.lock().unwrap().since.insert(since, response);
    }

    /// Add a transaction to the fallback `list_since` answer.
    pub fn push_transaction(&self, tx: ObservedTransaction) {
        self.state.lock().unwrap().transactions.push(tx);
    }

    /// Replace the fallback `list_since` answer.
    pub fn set_transactions(&self, txs: Vec<ObservedTransaction>) {
        self.state.lock().unwrap().transactions = txs;
    }

    pub fn fail_tip(&self, fail: bool) {
        self.fail_tip.store(fail, Ordering::SeqCst);
    }

    pub fn fail_blocks(&self, fail: bool) {
        self.fail_blocks.store(fail, Ordering::SeqCst);
    }

    pub fn fail_list_since(&self, fail: bool) {
        self.fail_list_since.store(fail, Ordering::SeqCst);
    }

    /// Hashes passed to `get_block`, in call order.
    pub fn get_block_calls(&self) -> Vec<BlockHash> {
        self.state.lock().unwrap().get_block_calls.clone()
    }

    /// Hashes passed to `list_since`, in call order.
    pub fn list_since_calls(&self) -> Vec<BlockHash> {
        self.state.lock().unwrap().list_since_calls.clone()
    }

    fn injected(what: &str) -> ChainError {
        ChainError::Transport(format!("injected {what} failure"))
    }
}

#[async_trait]
impl ChainSource for NullChain {
    async fn current_tip(&self) -> Result<BlockHash, ChainError> {
        if self.fail_tip.load(Ordering::SeqCst) {
            return Err(Self::injected("tip"));
        }
        Ok(self.state.lock().unwrap().tip)
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.get_block_calls.push(*hash);
        if self.fail_blocks.load(Ordering::SeqCst) {
            return Err(Self::injected("get_block"));
        }
        Ok(state.blocks.get(hash).cloned())
    }

    async fn list_since(&self, hash: &BlockHash) -> Result<SinceBlock, ChainError> {
        let mut state = self.state.lock().unwrap();
        state.list_since_calls.push(*hash);
        if self.fail_list_since.load(Ordering::SeqCst) {
            return Err(Self::injected("list_since"));
        }
        if let Some(canned) = state.since.get(hash) {
            return Ok(canned.clone());
        }
        Ok(SinceBlock {
            transactions: state.transactions.clone(),
            new_tip: state.tip,
        })
    }
}
