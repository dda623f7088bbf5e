//! Walking back from the pointer to the newest still-valid block.

use std::sync::Arc;

use tracing::{debug, error, warn, Instrument};

use tally_chain::ChainSource;
use tally_types::BlockHash;

use crate::metrics::ReconcilerMetrics;
use crate::payment::PaymentReconciler;
use crate::spans::walk_span;
use crate::ReconcileError;

/// Where a walk ended and what it cleaned up on the way.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Walk {
    /// The first valid block found, starting at the pointer.
    pub valid: BlockHash,
    /// Invalid blocks passed, newest first.
    pub invalid: Vec<BlockHash>,
    /// Payments detached from the invalid blocks.
    pub payments_cleared: usize,
}

impl Walk {
    pub fn reorged(&self) -> bool {
        !self.invalid.is_empty()
    }
}

/// Follows parent links from a block until the chain source reports one as
/// valid, detaching payments from every invalid block on the way.
///
/// The walk is an explicit loop bounded by `max_depth` invalid blocks. It
/// must finish before anything is listed since the resulting block, since a
/// listing from an invalid block is meaningless.
pub struct ReorgWalker {
    chain: Arc<dyn ChainSource>,
    payments: Arc<PaymentReconciler>,
    metrics: Arc<ReconcilerMetrics>,
    max_depth: usize,
}

impl ReorgWalker {
    pub fn new(
        chain: Arc<dyn ChainSource>,
        payments: Arc<PaymentReconciler>,
        metrics: Arc<ReconcilerMetrics>,
        max_depth: usize,
    ) -> Self {
        Self {
            chain,
            payments,
            metrics,
            max_depth,
        }
    }

    pub async fn walk(&self, from: BlockHash) -> Result<Walk, ReconcileError> {
        self.walk_inner(from)
            .instrument(walk_span(&from.to_string()))
            .await
    }

    async fn walk_inner(&self, from: BlockHash) -> Result<Walk, ReconcileError> {
        let mut hash = from;
        let mut invalid = Vec::new();
        let mut payments_cleared = 0;

        loop {
            let block = self
                .chain
                .get_block(&hash)
                .await?
                .ok_or(ReconcileError::BlockNotFound(hash))?;

            if block.is_valid {
                debug!(%hash, depth = invalid.len(), "found valid block");
                return Ok(Walk {
                    valid: hash,
                    invalid,
                    payments_cleared,
                });
            }

            if invalid.len() >= self.max_depth {
                self.metrics.reorg_depth_exceeded.inc();
                error!(
                    %from,
                    %hash,
                    depth = invalid.len(),
                    "reorg deeper than limit, refusing to walk further"
                );
                return Err(ReconcileError::ReorgTooDeep {
                    depth: invalid.len(),
                    from,
                });
            }

            warn!(%hash, previous = ?block.previous_hash, "block is no longer valid");
            self.metrics.invalid_blocks.inc();
            let cleared = self.payments.clear_payments_for_block(&hash).await?;
            self.metrics.payments_reorged.inc_by(cleared as u64);
            payments_cleared += cleared;
            invalid.push(hash);

            hash = block.previous_hash.ok_or(ReconcileError::MissingParent(hash))?;
        }
    }
}
