//! Applying chain data to matched payments.

use std::sync::Arc;

use tracing::{debug, info, warn};

use tally_chain::ChainSource;
use tally_store::{InvoiceStore, LedgerStore, PaymentStore};
use tally_types::{BlockHash, Invoice, InvoiceId, ObservedTransaction, Payment};

use crate::invoice::InvoiceService;
use crate::locks::{LockKey, PaymentLocks};
use crate::status::payment_status;
use crate::ReconcileError;

/// Result of reconciling one payment with one transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Transaction data was applied through the invoice service.
    Updated(Payment),
    /// The payment's block was reorganized away; its block hash was cleared
    /// and its status reset to zero confirmations.
    Reorged(Payment),
    /// The transaction's block is invalid but the payment is not attributed
    /// to it; only the status was recomputed.
    StatusRecomputed(Payment),
    /// The payment was claimed by another transaction after matching. It was
    /// left alone; the invoice is reported so the caller can treat the
    /// address as reused.
    ClaimedByOther(InvoiceId),
}

pub struct PaymentReconciler {
    store: Arc<dyn LedgerStore>,
    chain: Arc<dyn ChainSource>,
    invoices: Arc<dyn InvoiceService>,
    locks: PaymentLocks,
}

impl PaymentReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        chain: Arc<dyn ChainSource>,
        invoices: Arc<dyn InvoiceService>,
    ) -> Self {
        Self {
            store,
            chain,
            invoices,
            locks: PaymentLocks::new(),
        }
    }

    /// Reconcile `payment` with `tx`.
    ///
    /// Runs under the payment's lock and works on a fresh copy read under
    /// it, so concurrent reconciliations of one payment never interleave.
    pub async fn reconcile(
        &self,
        payment: &Payment,
        tx: &ObservedTransaction,
        is_new_payment: bool,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let _guard = self.locks.lock(LockKey::Payment(payment.id)).await;

        let current = self
            .store
            .get_payment(&payment.id)?
            .ok_or(ReconcileError::PaymentNotFound(payment.id))?;
        if let (Some(claimed), Some(incoming)) = (current.normalized_tx_id, tx.normalized_tx_id) {
            if claimed != incoming {
                debug!(payment = %current.id, %claimed, %incoming, "payment claimed by another transaction");
                return Ok(ReconcileOutcome::ClaimedByOther(current.invoice_id));
            }
        }
        let is_new_payment = is_new_payment && !current.is_claimed();

        let invoice = self
            .store
            .get_invoice(&current.invoice_id)?
            .ok_or_else(|| ReconcileError::InvoiceNotFound(current.invoice_id.clone()))?;

        let Some(block_hash) = tx.block_hash else {
            let updated = self
                .invoices
                .apply_transaction_to_payment(&current, tx, is_new_payment)
                .await?;
            return Ok(ReconcileOutcome::Updated(updated));
        };

        let block = self
            .chain
            .get_block(&block_hash)
            .await?
            .ok_or(ReconcileError::BlockNotFound(block_hash))?;

        if block.is_valid {
            let updated = self
                .invoices
                .apply_transaction_to_payment(&current, tx, is_new_payment)
                .await?;
            return Ok(ReconcileOutcome::Updated(updated));
        }

        if current.block_hash == Some(block_hash) {
            let mut cleared = current.clone();
            cleared.block_hash = None;
            cleared.status = payment_status(&cleared, 0, invoice.min_confirmations);
            self.store.put_payment(&cleared)?;
            warn!(
                payment = %cleared.id,
                block = %block_hash,
                status = %cleared.status,
                "payment block was reorganized away"
            );
            return Ok(ReconcileOutcome::Reorged(cleared));
        }

        let recomputed = self.recompute_status(&current, tx.confirmations, &invoice)?;
        Ok(ReconcileOutcome::StatusRecomputed(recomputed))
    }

    /// Create a payment for `invoice_id` carrying `tx`.
    ///
    /// Serialized per transaction so one transaction never produces two
    /// payments, even when listed twice in a batch.
    pub async fn create(
        &self,
        invoice_id: &InvoiceId,
        tx: &ObservedTransaction,
    ) -> Result<Option<Payment>, ReconcileError> {
        let ntxid = tx
            .normalized_tx_id
            .ok_or_else(|| ReconcileError::Malformed("missing normalized tx id".to_string()))?;
        let _guard = self.locks.lock(LockKey::Transaction(ntxid)).await;
        self.invoices
            .create_payment_for_invoice(invoice_id, tx, true)
            .await
    }

    /// Detach every payment from `hash`.
    ///
    /// Statuses are left as they are; the chain source reports the
    /// transactions again and the next reconciliation recomputes them.
    pub async fn clear_payments_for_block(&self, hash: &BlockHash) -> Result<usize, ReconcileError> {
        let mut cleared = 0;
        for payment in self.store.find_payments_by_block_hash(hash)? {
            let _guard = self.locks.lock(LockKey::Payment(payment.id)).await;
            let Some(mut current) = self.store.get_payment(&payment.id)? else {
                continue;
            };
            if current.block_hash != Some(*hash) {
                continue;
            }
            current.block_hash = None;
            self.store.put_payment(&current)?;
            cleared += 1;
        }
        if cleared > 0 {
            info!(block = %hash, cleared, "cleared payments of invalid block");
        }
        Ok(cleared)
    }

    fn recompute_status(
        &self,
        payment: &Payment,
        confirmations: u32,
        invoice: &Invoice,
    ) -> Result<Payment, ReconcileError> {
        let status = payment_status(payment, confirmations, invoice.min_confirmations);
        if status == payment.status {
            return Ok(payment.clone());
        }
        let mut updated = payment.clone();
        updated.status = status;
        self.store.put_payment(&updated)?;
        debug!(payment = %updated.id, %status, "status recomputed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invoice::LedgerInvoiceService;
    use tally_nullables::{NullChain, NullStore};
    use tally_store::{InvoiceStore, PaymentStore};
    use tally_types::{NormalizedTxId, PaymentAddress, PaymentStatus};

    const ADDR: &str = "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef";

    struct Fixture {
        store: Arc<NullStore>,
        chain: Arc<NullChain>,
        reconciler: PaymentReconciler,
    }

    fn h(n: u8) -> BlockHash {
        BlockHash::new([n; 32])
    }

    fn fixture() -> Fixture {
        let store = Arc::new(NullStore::new());
        let chain = Arc::new(NullChain::new());
        store
            .put_invoice(&Invoice {
                id: InvoiceId::new("inv-1").unwrap(),
                min_confirmations: 2,
                expected_amount: 1_000,
            })
            .unwrap();
        let invoices = Arc::new(LedgerInvoiceService::new(store.clone()));
        let reconciler = PaymentReconciler::new(store.clone(), chain.clone(), invoices);
        Fixture {
            store,
            chain,
            reconciler,
        }
    }

    fn stored_payment(store: &NullStore, block: Option<BlockHash>, claimed_by: Option<u8>) -> Payment {
        let mut p = Payment::unclaimed(
            InvoiceId::new("inv-1").unwrap(),
            PaymentAddress::new(ADDR).unwrap(),
            1_000,
        );
        p.block_hash = block;
        p.normalized_tx_id = claimed_by.map(|n| NormalizedTxId::new([n; 32]));
        if claimed_by.is_some() {
            p.amount_paid = 1_000;
            p.status = PaymentStatus::Paid;
        }
        store.put_payment(&p).unwrap();
        p
    }

    fn tx(ntxid: u8, block: Option<BlockHash>, confirmations: u32) -> ObservedTransaction {
        ObservedTransaction {
            normalized_tx_id: Some(NormalizedTxId::new([ntxid; 32])),
            tx_id: None,
            address: Some(PaymentAddress::new(ADDR).unwrap()),
            amount: 1_000,
            block_hash: block,
            confirmations,
        }
    }

    #[tokio::test]
    async fn valid_block_applies_transaction() {
        let f = fixture();
        f.chain.add_valid_block(h(1), None, 2);
        let p = stored_payment(&f.store, None, None);

        let outcome = f.reconciler.reconcile(&p, &tx(7, Some(h(1)), 2), true).await.unwrap();
        let ReconcileOutcome::Updated(updated) = outcome else {
            panic!("expected update, got {outcome:?}");
        };
        assert_eq!(updated.block_hash, Some(h(1)));
        assert_eq!(updated.status, PaymentStatus::Paid);
    }

    #[tokio::test]
    async fn invalid_own_block_clears_and_resets() {
        let f = fixture();
        f.chain.add_valid_block(h(1), None, 5);
        f.chain.invalidate(&h(1));
        let p = stored_payment(&f.store, Some(h(1)), Some(7));

        let outcome = f.reconciler.reconcile(&p, &tx(7, Some(h(1)), 5), false).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Reorged(_)));
        let stored = f.store.get_payment(&p.id).unwrap().unwrap();
        assert_eq!(stored.block_hash, None);
        assert_eq!(stored.status, PaymentStatus::Pending);
    }

    #[tokio::test]
    async fn invalid_foreign_block_keeps_block_hash() {
        let f = fixture();
        f.chain.add_valid_block(h(2), None, 1);
        f.chain.invalidate(&h(2));
        let p = stored_payment(&f.store, Some(h(1)), Some(7));

        let outcome = f.reconciler.reconcile(&p, &tx(7, Some(h(2)), 1), false).await.unwrap();
        let ReconcileOutcome::StatusRecomputed(updated) = outcome else {
            panic!("expected recompute, got {outcome:?}");
        };
        assert_eq!(updated.block_hash, Some(h(1)));
        assert_eq!(updated.status, PaymentStatus::Confirming);
    }

    #[tokio::test]
    async fn unknown_block_is_transient() {
        let f = fixture();
        let p = stored_payment(&f.store, None, None);
        let err = f.reconciler.reconcile(&p, &tx(7, Some(h(3)), 1), true).await.unwrap_err();
        assert!(matches!(err, ReconcileError::BlockNotFound(_)));
        assert!(err.is_transient());
        assert!(!f.store.get_payment(&p.id).unwrap().unwrap().is_claimed());
    }

    #[tokio::test]
    async fn payment_claimed_elsewhere_is_not_overwritten() {
        let f = fixture();
        let p = stored_payment(&f.store, None, Some(1));
        let writes = f.store.payment_writes();

        let outcome = f.reconciler.reconcile(&p, &tx(2, None, 0), true).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::ClaimedByOther(p.invoice_id.clone()));
        assert_eq!(f.store.payment_writes(), writes);
    }

    #[tokio::test]
    async fn missing_invoice_aborts_update() {
        let f = fixture();
        let mut p = stored_payment(&f.store, None, None);
        p.invoice_id = InvoiceId::new("ghost").unwrap();
        f.store.put_payment(&p).unwrap();

        let err = f.reconciler.reconcile(&p, &tx(7, None, 0), true).await.unwrap_err();
        assert!(matches!(err, ReconcileError::InvoiceNotFound(_)));
    }

    #[tokio::test]
    async fn clearing_a_block_detaches_every_payment() {
        let f = fixture();
        let a = stored_payment(&f.store, Some(h(4)), Some(1));
        let b = stored_payment(&f.store, Some(h(4)), Some(2));
        let other = stored_payment(&f.store, Some(h(5)), Some(3));

        assert_eq!(f.reconciler.clear_payments_for_block(&h(4)).await.unwrap(), 2);
        assert!(f.store.find_payments_by_block_hash(&h(4)).unwrap().is_empty());
        for id in [a.id, b.id] {
            let p = f.store.get_payment(&id).unwrap().unwrap();
            assert_eq!(p.block_hash, None);
            assert_eq!(p.status, PaymentStatus::Paid);
        }
        assert_eq!(f.store.get_payment(&other.id).unwrap().unwrap().block_hash, Some(h(5)));
    }
}
