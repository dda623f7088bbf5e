//! Nullable store with thread-safe in-memory storage for testing.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use tally_store::{InvoiceStore, MetaStore, PaymentStore, PointerStore, StoreError};
use tally_types::{
    BlockHash, BlockPointer, Invoice, InvoiceId, NormalizedTxId, Payment, PaymentAddress,
    PaymentId,
};

/// An in-memory pointer + invoice + payment store for testing.
/// Thread-safe for use with tokio's multi-threaded runtime.
///
/// Reads and writes can be made to fail on demand to exercise the
/// reconciler's transient-error paths.
pub struct NullStore {
    pointer: Mutex<Option<BlockPointer>>,
    invoices: Mutex<HashMap<InvoiceId, Invoice>>,
    payments: Mutex<HashMap<PaymentId, Payment>>,
    meta: Mutex<HashMap<String, Vec<u8>>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    failing_addresses: Mutex<HashSet<PaymentAddress>>,
    payment_writes: AtomicU64,
    pointer_writes: AtomicU64,
}

impl NullStore {
    pub fn new() -> Self {
        Self {
            pointer: Mutex::new(None),
            invoices: Mutex::new(HashMap::new()),
            payments: Mutex::new(HashMap::new()),
            meta: Mutex::new(HashMap::new()),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            failing_addresses: Mutex::new(HashSet::new()),
            payment_writes: AtomicU64::new(0),
            pointer_writes: AtomicU64::new(0),
        }
    }

    /// Make every read fail with a backend error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every write fail with a backend error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make writes of payments at `address` fail, leaving other writes alone.
    pub fn fail_payment_writes_at(&self, address: &PaymentAddress) {
        self.failing_addresses
            .lock()
            .unwrap()
            .insert(address.clone());
    }

    /// Undo every injected failure.
    pub fn heal(&self) {
        self.fail_reads(false);
        self.fail_writes(false);
        self.failing_addresses.lock().unwrap().clear();
    }

    /// Number of successful `put_payment` calls so far.
    pub fn payment_writes(&self) -> u64 {
        self.payment_writes.load(Ordering::SeqCst)
    }

    /// Number of successful `put_block_pointer` calls so far.
    pub fn pointer_writes(&self) -> u64 {
        self.pointer_writes.load(Ordering::SeqCst)
    }

    /// Snapshot of every stored payment.
    pub fn all_payments(&self) -> Vec<Payment> {
        self.payments.lock().unwrap().values().cloned().collect()
    }

    fn check_read(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected read failure".to_string()));
        }
        Ok(())
    }

    fn check_write(&self) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("injected write failure".to_string()));
        }
        Ok(())
    }

    fn select_payments(&self, pred: impl Fn(&Payment) -> bool) -> Result<Vec<Payment>, StoreError> {
        self.check_read()?;
        Ok(self
            .payments
            .lock()
            .unwrap()
            .values()
            .filter(|p| pred(p))
            .cloned()
            .collect())
    }
}

impl Default for NullStore {
    fn default() -> Self {
        Self::new()
    }
}

impl PointerStore for NullStore {
    fn get_block_pointer(&self) -> Result<Option<BlockPointer>, StoreError> {
        self.check_read()?;
        Ok(self.pointer.lock().unwrap().clone())
    }

    fn put_block_pointer(&self, pointer: &BlockPointer) -> Result<(), StoreError> {
        self.check_write()?;
        *self.pointer.lock().unwrap() = Some(pointer.clone());
        self.pointer_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl InvoiceStore for NullStore {
    fn get_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        self.check_read()?;
        Ok(self.invoices.lock().unwrap().get(id).cloned())
    }

    fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        self.check_write()?;
        self.invoices
            .lock()
            .unwrap()
            .insert(invoice.id.clone(), invoice.clone());
        Ok(())
    }
}

impl PaymentStore for NullStore {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, StoreError> {
        self.check_read()?;
        Ok(self.payments.lock().unwrap().get(id).cloned())
    }

    fn put_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        self.check_write()?;
        if self
            .failing_addresses
            .lock()
            .unwrap()
            .contains(&payment.address)
        {
            return Err(StoreError::Backend(format!(
                "injected write failure for {}",
                payment.address
            )));
        }
        self.payments
            .lock()
            .unwrap()
            .insert(payment.id, payment.clone());
        self.payment_writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn find_payment_by_tx_id(&self, id: &NormalizedTxId) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .select_payments(|p| p.normalized_tx_id.as_ref() == Some(id))?
            .into_iter()
            .next())
    }

    fn find_payments_by_address(
        &self,
        address: &PaymentAddress,
    ) -> Result<Vec<Payment>, StoreError> {
        self.select_payments(|p| &p.address == address)
    }

    fn find_payments_by_block_hash(&self, hash: &BlockHash) -> Result<Vec<Payment>, StoreError> {
        self.select_payments(|p| p.block_hash.as_ref() == Some(hash))
    }

    fn find_payments_by_invoice(&self, invoice: &InvoiceId) -> Result<Vec<Payment>, StoreError> {
        self.select_payments(|p| &p.invoice_id == invoice)
    }

    fn payment_count(&self) -> Result<u64, StoreError> {
        self.check_read()?;
        Ok(self.payments.lock().unwrap().len() as u64)
    }
}

impl MetaStore for NullStore {
    fn put_meta(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.check_write()?;
        self.meta
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get_meta(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.check_read()?;
        self.meta
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    fn delete_meta(&self, key: &str) -> Result<(), StoreError> {
        self.check_write()?;
        self.meta.lock().unwrap().remove(key);
        Ok(())
    }

    fn get_schema_version(&self) -> Result<u32, StoreError> {
        match self.get_meta("schema_version") {
            Ok(bytes) if bytes.len() == 4 => {
                Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            }
            Ok(_) => Err(StoreError::Corruption("schema_version".to_string())),
            Err(StoreError::NotFound(_)) => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn set_schema_version(&self, version: u32) -> Result<(), StoreError> {
        self.put_meta("schema_version", &version.to_le_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(s: &str) -> PaymentAddress {
        PaymentAddress::new(s).unwrap()
    }

    fn unclaimed(addr: &str) -> Payment {
        Payment::unclaimed(InvoiceId::new("inv").unwrap(), address(addr), 1_000)
    }

    #[test]
    fn block_index_follows_latest_document() {
        let store = NullStore::new();
        let hash = BlockHash::new([7; 32]);
        let mut p = unclaimed("addr-1");
        p.block_hash = Some(hash);
        store.put_payment(&p).unwrap();
        assert_eq!(store.find_payments_by_block_hash(&hash).unwrap().len(), 1);

        p.block_hash = None;
        store.put_payment(&p).unwrap();
        assert!(store.find_payments_by_block_hash(&hash).unwrap().is_empty());
        assert_eq!(store.payment_writes(), 2);
    }

    #[test]
    fn injected_write_failure_is_scoped_to_address() {
        let store = NullStore::new();
        store.fail_payment_writes_at(&address("bad"));
        assert!(store.put_payment(&unclaimed("bad")).is_err());
        assert!(store.put_payment(&unclaimed("good")).is_ok());

        store.heal();
        assert!(store.put_payment(&unclaimed("bad")).is_ok());
    }

    #[test]
    fn read_failure_surfaces_as_backend_error() {
        let store = NullStore::new();
        store.fail_reads(true);
        assert!(matches!(
            store.get_block_pointer(),
            Err(StoreError::Backend(_))
        ));
    }

    #[test]
    fn schema_version_defaults_to_zero() {
        let store = NullStore::new();
        assert_eq!(store.get_schema_version().unwrap(), 0);
        store.set_schema_version(3).unwrap();
        assert_eq!(store.get_schema_version().unwrap(), 3);
    }
}
