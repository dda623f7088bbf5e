//! Pre-built [`tracing::Span`] constructors for reconciler operations.
//!
//! Consistent span names and fields make a pass easy to follow in log
//! output: every line emitted while handling a transaction carries the pass
//! number and the transaction id.

use tracing::{info_span, Span};

use tally_types::ObservedTransaction;

/// Span covering one full reconciliation pass.
pub fn pass_span(pass: u64) -> Span {
    info_span!("pass", pass)
}

/// Span covering the reorg walk from the persisted pointer.
pub fn walk_span(from: &str) -> Span {
    info_span!("reorg_walk", from = %from)
}

/// Span covering matching and reconciling a single observed transaction.
pub fn transaction_span(tx: &ObservedTransaction) -> Span {
    match tx.normalized_tx_id {
        Some(ntxid) => info_span!("tx", ntxid = %ntxid),
        None => info_span!("tx", tx_id = ?tx.tx_id),
    }
}
