use thiserror::Error;

use tally_chain::ChainError;
use tally_store::StoreError;
use tally_types::{BlockHash, InvoiceId, PaymentId};

/// How an error should be treated by a reconciliation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A store or chain call failed. The unit of work is abandoned and picked
    /// up again by the next pass.
    TransientIo,
    /// The input can never be reconciled. Logged and skipped, never retried.
    MalformedInput,
    /// Records disagree with each other. Logged; the affected payment is
    /// left alone.
    InconsistentState,
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain source error: {0}")]
    Chain(#[from] ChainError),

    #[error("malformed transaction: {0}")]
    Malformed(String),

    #[error("invoice {0} not found")]
    InvoiceNotFound(InvoiceId),

    #[error("payment {0} not found")]
    PaymentNotFound(PaymentId),

    #[error("invoice {0} already exists")]
    InvoiceExists(InvoiceId),

    #[error("block {0} not known to the chain source")]
    BlockNotFound(BlockHash),

    #[error("invalid block {0} has no parent")]
    MissingParent(BlockHash),

    #[error("reorg walk from {from} exceeded {depth} invalid blocks")]
    ReorgTooDeep { depth: usize, from: BlockHash },

    #[error("config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ReconcileError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Store(_)
            | Self::Chain(_)
            | Self::BlockNotFound(_)
            | Self::MissingParent(_)
            | Self::ReorgTooDeep { .. }
            | Self::Io(_) => ErrorKind::TransientIo,
            Self::Malformed(_) | Self::Config(_) | Self::InvoiceExists(_) => {
                ErrorKind::MalformedInput
            }
            Self::InvoiceNotFound(_) | Self::PaymentNotFound(_) => ErrorKind::InconsistentState,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::TransientIo
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_and_chain_failures_are_transient() {
        let err: ReconcileError = StoreError::Backend("disk".into()).into();
        assert!(err.is_transient());
        let err: ReconcileError = ChainError::Transport("refused".into()).into();
        assert_eq!(err.kind(), ErrorKind::TransientIo);
    }

    #[test]
    fn missing_invoice_is_inconsistent_state() {
        let err = ReconcileError::InvoiceNotFound(InvoiceId::new("inv-9").unwrap());
        assert_eq!(err.kind(), ErrorKind::InconsistentState);
        assert!(!err.is_transient());
    }

    #[test]
    fn malformed_is_never_retried() {
        assert_eq!(
            ReconcileError::Malformed("no address".into()).kind(),
            ErrorKind::MalformedInput
        );
    }
}
