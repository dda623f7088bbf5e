//! The invoice-update collaborator.
//!
//! The reconciler decides *which* payment a transaction belongs to; the
//! invoice service decides what applying the transaction means for the
//! payment record and writes it.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use tally_store::{InvoiceStore, LedgerStore, PaymentStore};
use tally_types::{Invoice, InvoiceId, ObservedTransaction, Payment, PaymentAddress};

use crate::status::payment_status;
use crate::ReconcileError;

#[async_trait]
pub trait InvoiceService: Send + Sync {
    /// Attach `tx` to `payment` and persist the result.
    ///
    /// Re-applying a transaction that is already reflected in the payment
    /// must leave the stored record untouched.
    async fn apply_transaction_to_payment(
        &self,
        payment: &Payment,
        tx: &ObservedTransaction,
        is_new_payment: bool,
    ) -> Result<Payment, ReconcileError>;

    /// Create a payment for `invoice_id` at the transaction's address and
    /// apply `tx` to it. Returns `None` when a payment for this transaction
    /// already exists.
    async fn create_payment_for_invoice(
        &self,
        invoice_id: &InvoiceId,
        tx: &ObservedTransaction,
        is_new_payment: bool,
    ) -> Result<Option<Payment>, ReconcileError>;

    /// Persist a new invoice together with its first, unclaimed payment.
    ///
    /// An id already in use is rejected, unless it names the same invoice
    /// with no payment yet. The invoice and the payment are two separate
    /// writes, not one transaction; repeating an issue that failed between
    /// them completes it.
    async fn issue_invoice(
        &self,
        invoice: &Invoice,
        address: &PaymentAddress,
    ) -> Result<Payment, ReconcileError>;
}

/// [`InvoiceService`] writing straight to the ledger store.
pub struct LedgerInvoiceService {
    store: Arc<dyn LedgerStore>,
}

impl LedgerInvoiceService {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    fn load_invoice(&self, id: &InvoiceId) -> Result<Invoice, ReconcileError> {
        self.store
            .get_invoice(id)?
            .ok_or_else(|| ReconcileError::InvoiceNotFound(id.clone()))
    }

    fn apply(
        &self,
        payment: &Payment,
        tx: &ObservedTransaction,
        invoice: &Invoice,
        is_new_payment: bool,
    ) -> Result<Payment, ReconcileError> {
        let mut updated = payment.clone();
        if tx.normalized_tx_id.is_some() {
            updated.normalized_tx_id = tx.normalized_tx_id;
        }
        if tx.tx_id.is_some() {
            updated.tx_id = tx.tx_id.clone();
        }
        updated.amount_paid = tx.amount;
        if tx.block_hash.is_some() {
            updated.block_hash = tx.block_hash;
        }
        updated.status = payment_status(&updated, tx.confirmations, invoice.min_confirmations);

        if updated == *payment {
            debug!(payment = %payment.id, "transaction already applied");
            return Ok(updated);
        }

        self.store.put_payment(&updated)?;
        if is_new_payment {
            info!(
                payment = %updated.id,
                invoice = %updated.invoice_id,
                amount = updated.amount_paid,
                status = %updated.status,
                "payment claimed by transaction"
            );
        } else {
            debug!(payment = %updated.id, status = %updated.status, "payment updated");
        }
        Ok(updated)
    }
}

#[async_trait]
impl InvoiceService for LedgerInvoiceService {
    async fn apply_transaction_to_payment(
        &self,
        payment: &Payment,
        tx: &ObservedTransaction,
        is_new_payment: bool,
    ) -> Result<Payment, ReconcileError> {
        let invoice = self.load_invoice(&payment.invoice_id)?;
        self.apply(payment, tx, &invoice, is_new_payment)
    }

    async fn create_payment_for_invoice(
        &self,
        invoice_id: &InvoiceId,
        tx: &ObservedTransaction,
        is_new_payment: bool,
    ) -> Result<Option<Payment>, ReconcileError> {
        let ntxid = tx
            .normalized_tx_id
            .ok_or_else(|| ReconcileError::Malformed("missing normalized tx id".to_string()))?;
        let address = tx
            .address
            .clone()
            .ok_or_else(|| ReconcileError::Malformed(format!("{ntxid}: missing address")))?;

        if let Some(existing) = self.store.find_payment_by_tx_id(&ntxid)? {
            debug!(%ntxid, payment = %existing.id, "payment for transaction already exists");
            return Ok(None);
        }

        let invoice = self.load_invoice(invoice_id)?;
        let already_paid: u64 = self
            .store
            .find_payments_by_invoice(invoice_id)?
            .iter()
            .map(|p| p.amount_paid)
            .sum();
        let remaining = invoice.expected_amount.saturating_sub(already_paid);

        let payment = Payment::unclaimed(invoice.id.clone(), address, remaining);
        info!(
            invoice = %invoice.id,
            payment = %payment.id,
            %ntxid,
            remaining,
            "creating payment for reused address"
        );
        self.apply(&payment, tx, &invoice, is_new_payment).map(Some)
    }

    async fn issue_invoice(
        &self,
        invoice: &Invoice,
        address: &PaymentAddress,
    ) -> Result<Payment, ReconcileError> {
        match self.store.get_invoice(&invoice.id)? {
            None => self.store.put_invoice(invoice)?,
            Some(existing)
                if existing == *invoice
                    && self.store.find_payments_by_invoice(&invoice.id)?.is_empty() =>
            {
                debug!(invoice = %invoice.id, "completing invoice issued without a payment");
            }
            Some(_) => return Err(ReconcileError::InvoiceExists(invoice.id.clone())),
        }
        let payment = Payment::unclaimed(invoice.id.clone(), address.clone(), invoice.expected_amount);
        self.store.put_payment(&payment)?;
        info!(invoice = %invoice.id, payment = %payment.id, %address, "invoice issued");
        Ok(payment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_nullables::NullStore;
    use tally_store::PaymentStore;
    use tally_types::{BlockHash, NormalizedTxId, PaymentStatus};

    const ADDR: &str = "mzBc4XEFSdzCDcTxAgf6EZXgsZWpztRhef";

    fn setup() -> (Arc<NullStore>, LedgerInvoiceService) {
        let store = Arc::new(NullStore::new());
        let service = LedgerInvoiceService::new(store.clone());
        (store, service)
    }

    fn invoice(id: &str, amount: u64) -> Invoice {
        Invoice {
            id: InvoiceId::new(id).unwrap(),
            min_confirmations: 3,
            expected_amount: amount,
        }
    }

    fn tx(ntxid: u8, amount: u64, block: Option<BlockHash>, confirmations: u32) -> ObservedTransaction {
        ObservedTransaction {
            normalized_tx_id: Some(NormalizedTxId::new([ntxid; 32])),
            tx_id: Some(format!("raw-{ntxid}")),
            address: Some(PaymentAddress::new(ADDR).unwrap()),
            amount,
            block_hash: block,
            confirmations,
        }
    }

    #[tokio::test]
    async fn applying_twice_writes_once() {
        let (store, service) = setup();
        let payment = service
            .issue_invoice(&invoice("inv-1", 1_000), &PaymentAddress::new(ADDR).unwrap())
            .await
            .unwrap();
        let writes_after_issue = store.payment_writes();

        let t = tx(1, 1_000, Some(BlockHash::new([9; 32])), 3);
        let first = service.apply_transaction_to_payment(&payment, &t, true).await.unwrap();
        let second = service.apply_transaction_to_payment(&first, &t, false).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first.status, PaymentStatus::Paid);
        assert_eq!(store.payment_writes(), writes_after_issue + 1);
        assert_eq!(store.get_payment(&payment.id).unwrap().unwrap(), first);
    }

    #[tokio::test]
    async fn unmined_transaction_keeps_block_hash() {
        let (_store, service) = setup();
        let mut payment = service
            .issue_invoice(&invoice("inv-1", 1_000), &PaymentAddress::new(ADDR).unwrap())
            .await
            .unwrap();
        let old_block = BlockHash::new([4; 32]);
        payment.block_hash = Some(old_block);

        let updated = service
            .apply_transaction_to_payment(&payment, &tx(1, 1_000, None, 0), false)
            .await
            .unwrap();
        assert_eq!(updated.block_hash, Some(old_block));
        assert_eq!(updated.status, PaymentStatus::Pending);
        assert!(updated.is_claimed());
    }

    #[tokio::test]
    async fn created_payment_expects_remaining_balance() {
        let (store, service) = setup();
        let inv = invoice("inv-1", 1_000);
        let first = service
            .issue_invoice(&inv, &PaymentAddress::new(ADDR).unwrap())
            .await
            .unwrap();
        service
            .apply_transaction_to_payment(&first, &tx(1, 600, None, 0), true)
            .await
            .unwrap();

        let created = service
            .create_payment_for_invoice(&inv.id, &tx(2, 400, None, 0), true)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(created.expected_amount, 400);
        assert_eq!(created.normalized_tx_id, Some(NormalizedTxId::new([2; 32])));
        assert_eq!(store.find_payments_by_invoice(&inv.id).unwrap().len(), 2);
    }

    #[tokio::test]
    async fn create_is_idempotent_per_transaction() {
        let (store, service) = setup();
        let inv = invoice("inv-1", 1_000);
        service
            .issue_invoice(&inv, &PaymentAddress::new(ADDR).unwrap())
            .await
            .unwrap();

        let t = tx(7, 100, None, 0);
        assert!(service.create_payment_for_invoice(&inv.id, &t, true).await.unwrap().is_some());
        assert!(service.create_payment_for_invoice(&inv.id, &t, true).await.unwrap().is_none());
        assert_eq!(store.payment_count().unwrap(), 2);
    }

    #[tokio::test]
    async fn create_for_unknown_invoice_is_inconsistent() {
        let (_store, service) = setup();
        let err = service
            .create_payment_for_invoice(&InvoiceId::new("ghost").unwrap(), &tx(1, 1, None, 0), true)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvoiceNotFound(_)));
    }

    #[tokio::test]
    async fn reissuing_an_existing_id_is_rejected() {
        let (store, service) = setup();
        let address = PaymentAddress::new(ADDR).unwrap();
        service.issue_invoice(&invoice("inv-1", 1_000), &address).await.unwrap();

        let err = service
            .issue_invoice(&invoice("inv-1", 9_000), &address)
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::InvoiceExists(_)));
        assert_eq!(err.kind(), crate::ErrorKind::MalformedInput);

        // The same invoice again is rejected too, since it already has a payment.
        assert!(service.issue_invoice(&invoice("inv-1", 1_000), &address).await.is_err());
        let stored = store.get_invoice(&InvoiceId::new("inv-1").unwrap()).unwrap();
        assert_eq!(stored.unwrap().expected_amount, 1_000);
        assert_eq!(store.payment_count().unwrap(), 1);
    }

    #[tokio::test]
    async fn issue_interrupted_before_the_payment_can_be_repeated() {
        let (store, service) = setup();
        let address = PaymentAddress::new(ADDR).unwrap();
        let inv = invoice("inv-1", 1_000);

        store.fail_payment_writes_at(&address);
        assert!(service.issue_invoice(&inv, &address).await.is_err());
        assert!(store.get_invoice(&inv.id).unwrap().is_some());
        assert_eq!(store.payment_count().unwrap(), 0);

        store.heal();
        let payment = service.issue_invoice(&inv, &address).await.unwrap();
        assert_eq!(store.find_payments_by_invoice(&inv.id).unwrap(), vec![payment]);
    }
}
