//! Payment storage trait.

use crate::StoreError;
use tally_types::{BlockHash, InvoiceId, NormalizedTxId, Payment, PaymentAddress, PaymentId};

/// Trait for payment document storage and its secondary lookups.
///
/// `put_payment` is an upsert keyed by [`Payment::id`]. Backends must keep the
/// lookups below consistent with the latest version of each document: a
/// payment whose `block_hash` was cleared must no longer be returned by
/// [`PaymentStore::find_payments_by_block_hash`] for the old hash.
pub trait PaymentStore {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, StoreError>;

    fn put_payment(&self, payment: &Payment) -> Result<(), StoreError>;

    /// The payment that claimed this normalized transaction id, if any.
    fn find_payment_by_tx_id(&self, id: &NormalizedTxId) -> Result<Option<Payment>, StoreError>;

    /// All payments at an address, claimed or not.
    fn find_payments_by_address(
        &self,
        address: &PaymentAddress,
    ) -> Result<Vec<Payment>, StoreError>;

    /// All payments currently attributed to a block.
    fn find_payments_by_block_hash(&self, hash: &BlockHash) -> Result<Vec<Payment>, StoreError>;

    fn find_payments_by_invoice(&self, invoice: &InvoiceId) -> Result<Vec<Payment>, StoreError>;

    fn payment_count(&self) -> Result<u64, StoreError>;
}
