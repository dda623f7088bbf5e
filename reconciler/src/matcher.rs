//! Transaction-to-payment matching.

use std::sync::Arc;

use tracing::{debug, warn};

use tally_store::{LedgerStore, PaymentStore};
use tally_types::{InvoiceId, ObservedTransaction, Payment};

use crate::ReconcileError;

/// Why a transaction was not matched to anything.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkipReason {
    MissingTxId,
    MissingAddress,
    /// No payment is known at the transaction's address.
    UnknownAddress,
}

/// What to do with one observed transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MatchAction {
    /// A payment already claimed this transaction; it is the only match.
    ById(Payment),
    /// No payment carries the transaction's id yet.
    ///
    /// Every unclaimed payment at the address is reconciled with the
    /// transaction. When the address also has claimed payments, one new
    /// payment is created for `create_for`, the invoice of the last claimed
    /// payment seen.
    ByAddress {
        unclaimed: Vec<Payment>,
        create_for: Option<InvoiceId>,
    },
    Skip(SkipReason),
}

pub struct PaymentMatcher {
    store: Arc<dyn LedgerStore>,
}

impl PaymentMatcher {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Resolve `tx` to the payments it affects.
    ///
    /// A store failure is returned as-is; nothing is matched partially.
    pub fn match_transaction(&self, tx: &ObservedTransaction) -> Result<MatchAction, ReconcileError> {
        let Some(ntxid) = tx.normalized_tx_id else {
            warn!(tx_id = ?tx.tx_id, "skipping transaction without normalized id");
            return Ok(MatchAction::Skip(SkipReason::MissingTxId));
        };
        let Some(address) = &tx.address else {
            warn!(%ntxid, "skipping transaction without address");
            return Ok(MatchAction::Skip(SkipReason::MissingAddress));
        };

        if let Some(payment) = self.store.find_payment_by_tx_id(&ntxid)? {
            debug!(%ntxid, payment = %payment.id, "matched payment by tx id");
            return Ok(MatchAction::ById(payment));
        }

        let payments = self.store.find_payments_by_address(address)?;
        if payments.is_empty() {
            debug!(%ntxid, %address, "no payment at address");
            return Ok(MatchAction::Skip(SkipReason::UnknownAddress));
        }

        let mut unclaimed = Vec::new();
        let mut create_for = None;
        for payment in payments {
            if payment.is_claimed() {
                create_for = Some(payment.invoice_id.clone());
            } else {
                unclaimed.push(payment);
            }
        }
        debug!(
            %ntxid,
            %address,
            unclaimed = unclaimed.len(),
            reused = create_for.is_some(),
            "matched payments by address"
        );
        Ok(MatchAction::ByAddress {
            unclaimed,
            create_for,
        })
    }
}
