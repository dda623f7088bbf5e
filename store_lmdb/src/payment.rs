//! LMDB implementation of PaymentStore.
//!
//! Documents live in `payments` keyed by the 16-byte payment id. Secondary
//! lookups are composite-key databases whose keys end in the payment id:
//!
//! - `payments_by_address`: `address ++ 0x00 ++ id`
//! - `payments_by_block`:   `block_hash ++ id`
//! - `payments_by_invoice`: `invoice_id ++ 0x00 ++ id`
//!
//! `payments_by_ntxid` maps a normalized tx id straight to the payment id.
//! Index entries for the previous version of a document are removed in the
//! same write transaction that stores the new version.

use heed::types::Bytes;
use heed::{Database, RoTxn, RwTxn};

use tally_store::payment::PaymentStore;
use tally_store::StoreError;
use tally_types::{BlockHash, InvoiceId, NormalizedTxId, Payment, PaymentAddress, PaymentId};

use crate::{LmdbEnvironment, LmdbError};

const ID_LEN: usize = 16;
const EMPTY: &[u8] = &[];

fn address_prefix(address: &PaymentAddress) -> Vec<u8> {
    let mut key = Vec::with_capacity(address.as_str().len() + 1 + ID_LEN);
    key.extend_from_slice(address.as_str().as_bytes());
    key.push(0);
    key
}

fn address_key(address: &PaymentAddress, id: &PaymentId) -> Vec<u8> {
    let mut key = address_prefix(address);
    key.extend_from_slice(id.as_bytes());
    key
}

fn block_key(hash: &BlockHash, id: &PaymentId) -> Vec<u8> {
    let mut key = Vec::with_capacity(32 + ID_LEN);
    key.extend_from_slice(hash.as_bytes());
    key.extend_from_slice(id.as_bytes());
    key
}

fn invoice_prefix(invoice: &InvoiceId) -> Vec<u8> {
    let mut key = Vec::with_capacity(invoice.as_str().len() + 1 + ID_LEN);
    key.extend_from_slice(invoice.as_str().as_bytes());
    key.push(0);
    key
}

fn invoice_key(invoice: &InvoiceId, id: &PaymentId) -> Vec<u8> {
    let mut key = invoice_prefix(invoice);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Extract the trailing payment id from a composite index key.
fn id_suffix(key: &[u8]) -> Result<PaymentId, LmdbError> {
    if key.len() < ID_LEN {
        return Err(LmdbError::Serialization(format!(
            "index key too short: {} bytes",
            key.len()
        )));
    }
    let mut bytes = [0u8; ID_LEN];
    bytes.copy_from_slice(&key[key.len() - ID_LEN..]);
    Ok(PaymentId::from_bytes(bytes))
}

impl LmdbEnvironment {
    fn read_payment(&self, rtxn: &RoTxn<'_>, id: &PaymentId) -> Result<Option<Payment>, LmdbError> {
        match self.payments_db.get(rtxn, id.as_bytes())? {
            Some(bytes) => Ok(Some(bincode::deserialize(bytes)?)),
            None => Ok(None),
        }
    }

    /// Resolve every payment id stored under `prefix` in a composite index.
    fn payments_with_prefix(
        &self,
        index: Database<Bytes, Bytes>,
        prefix: &[u8],
    ) -> Result<Vec<Payment>, LmdbError> {
        let rtxn = self.env.read_txn()?;
        let mut ids = Vec::new();
        for entry in index.prefix_iter(&rtxn, prefix)? {
            let (key, _) = entry?;
            if key.len() == prefix.len() + ID_LEN {
                ids.push(id_suffix(key)?);
            }
        }

        let mut payments = Vec::with_capacity(ids.len());
        for id in ids {
            match self.read_payment(&rtxn, &id)? {
                Some(payment) => payments.push(payment),
                None => tracing::warn!(payment = %id, "index entry points at missing payment"),
            }
        }
        Ok(payments)
    }

    fn remove_indexes(&self, wtxn: &mut RwTxn<'_>, old: &Payment) -> Result<(), LmdbError> {
        if let Some(ntxid) = &old.normalized_tx_id {
            // Another payment may have claimed the same id since; only drop
            // the mapping if it still points here.
            let owned = self
                .ntxid_index
                .get(wtxn, ntxid.as_bytes())?
                .is_some_and(|v| v == old.id.as_bytes());
            if owned {
                self.ntxid_index.delete(wtxn, ntxid.as_bytes())?;
            }
        }
        if let Some(hash) = &old.block_hash {
            self.block_index.delete(wtxn, &block_key(hash, &old.id))?;
        }
        self.address_index
            .delete(wtxn, &address_key(&old.address, &old.id))?;
        self.invoice_index
            .delete(wtxn, &invoice_key(&old.invoice_id, &old.id))?;
        Ok(())
    }

    fn write_indexes(&self, wtxn: &mut RwTxn<'_>, payment: &Payment) -> Result<(), LmdbError> {
        if let Some(ntxid) = &payment.normalized_tx_id {
            self.ntxid_index
                .put(wtxn, ntxid.as_bytes(), payment.id.as_bytes())?;
        }
        if let Some(hash) = &payment.block_hash {
            self.block_index
                .put(wtxn, &block_key(hash, &payment.id), EMPTY)?;
        }
        self.address_index
            .put(wtxn, &address_key(&payment.address, &payment.id), EMPTY)?;
        self.invoice_index
            .put(wtxn, &invoice_key(&payment.invoice_id, &payment.id), EMPTY)?;
        Ok(())
    }
}

impl LmdbEnvironment {
    /// Drop every payment lookup entry and rebuild them from the documents.
    ///
    /// Runs in one write transaction, so readers see either the old or the
    /// rebuilt indexes. Undecodable documents are left out and logged.
    /// Returns the number of payments indexed.
    pub fn rebuild_payment_indexes(&self) -> Result<u64, LmdbError> {
        let mut wtxn = self.env.write_txn()?;
        self.ntxid_index.clear(&mut wtxn)?;
        self.address_index.clear(&mut wtxn)?;
        self.block_index.clear(&mut wtxn)?;
        self.invoice_index.clear(&mut wtxn)?;

        let mut payments = Vec::new();
        for entry in self.payments_db.iter(&wtxn)? {
            let (key, bytes) = entry?;
            match bincode::deserialize::<Payment>(bytes) {
                Ok(payment) => payments.push(payment),
                Err(e) => tracing::warn!(
                    key = %crate::integrity::hex_prefix(key),
                    error = %e,
                    "skipping undecodable payment while rebuilding indexes"
                ),
            }
        }

        for payment in &payments {
            self.write_indexes(&mut wtxn, payment)?;
        }
        wtxn.commit()?;
        tracing::info!(payments = payments.len(), "payment indexes rebuilt");
        Ok(payments.len() as u64)
    }
}

impl PaymentStore for LmdbEnvironment {
    fn get_payment(&self, id: &PaymentId) -> Result<Option<Payment>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        Ok(self.read_payment(&rtxn, id)?)
    }

    fn put_payment(&self, payment: &Payment) -> Result<(), StoreError> {
        let bytes = bincode::serialize(payment).map_err(LmdbError::from)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;

        let old: Option<Payment> = match self
            .payments_db
            .get(&wtxn, payment.id.as_bytes())
            .map_err(LmdbError::from)?
        {
            Some(old_bytes) => Some(bincode::deserialize(old_bytes).map_err(LmdbError::from)?),
            None => None,
        };
        if let Some(old) = &old {
            self.remove_indexes(&mut wtxn, old)?;
        }

        self.payments_db
            .put(&mut wtxn, payment.id.as_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        self.write_indexes(&mut wtxn, payment)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }

    fn find_payment_by_tx_id(&self, id: &NormalizedTxId) -> Result<Option<Payment>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let payment_id = match self
            .ntxid_index
            .get(&rtxn, id.as_bytes())
            .map_err(LmdbError::from)?
        {
            Some(bytes) => id_suffix(bytes)?,
            None => return Ok(None),
        };
        Ok(self.read_payment(&rtxn, &payment_id)?)
    }

    fn find_payments_by_address(
        &self,
        address: &PaymentAddress,
    ) -> Result<Vec<Payment>, StoreError> {
        Ok(self.payments_with_prefix(self.address_index, &address_prefix(address))?)
    }

    fn find_payments_by_block_hash(&self, hash: &BlockHash) -> Result<Vec<Payment>, StoreError> {
        Ok(self.payments_with_prefix(self.block_index, hash.as_bytes())?)
    }

    fn find_payments_by_invoice(&self, invoice: &InvoiceId) -> Result<Vec<Payment>, StoreError> {
        Ok(self.payments_with_prefix(self.invoice_index, &invoice_prefix(invoice))?)
    }

    fn payment_count(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        let count = self.payments_db.len(&rtxn).map_err(LmdbError::from)?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_types::PaymentStatus;

    fn temp_env() -> (tempfile::TempDir, LmdbEnvironment) {
        let dir = tempfile::tempdir().expect("temp dir");
        let env = LmdbEnvironment::open(dir.path(), 8, 16 * 1024 * 1024).expect("open env");
        (dir, env)
    }

    fn payment(invoice: &str, address: &str) -> Payment {
        Payment::unclaimed(
            InvoiceId::new(invoice).unwrap(),
            PaymentAddress::new(address).unwrap(),
            10_000,
        )
    }

    #[test]
    fn put_get_payment() {
        let (_dir, env) = temp_env();
        let p = payment("inv-1", "addr-a");
        env.put_payment(&p).unwrap();
        assert_eq!(env.get_payment(&p.id).unwrap(), Some(p));
        assert_eq!(env.payment_count().unwrap(), 1);
    }

    #[test]
    fn address_lookup_does_not_match_longer_address() {
        let (_dir, env) = temp_env();
        let short = payment("inv-1", "addr");
        let long = payment("inv-2", "addr-long");
        env.put_payment(&short).unwrap();
        env.put_payment(&long).unwrap();

        let found = env
            .find_payments_by_address(&PaymentAddress::new("addr").unwrap())
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, short.id);
    }

    #[test]
    fn reused_address_returns_every_payment() {
        let (_dir, env) = temp_env();
        let first = payment("inv-1", "addr-a");
        let second = payment("inv-2", "addr-a");
        env.put_payment(&first).unwrap();
        env.put_payment(&second).unwrap();

        let found = env
            .find_payments_by_address(&PaymentAddress::new("addr-a").unwrap())
            .unwrap();
        assert_eq!(found.len(), 2);
    }

    #[test]
    fn ntxid_lookup_follows_updates() {
        let (_dir, env) = temp_env();
        let mut p = payment("inv-1", "addr-a");
        let ntxid = NormalizedTxId::new([3; 32]);
        assert!(env.find_payment_by_tx_id(&ntxid).unwrap().is_none());

        p.normalized_tx_id = Some(ntxid);
        p.status = PaymentStatus::Pending;
        env.put_payment(&p).unwrap();
        assert_eq!(env.find_payment_by_tx_id(&ntxid).unwrap().unwrap().id, p.id);
    }

    #[test]
    fn clearing_block_hash_removes_block_index_entry() {
        let (_dir, env) = temp_env();
        let hash = BlockHash::new([9; 32]);
        let mut p = payment("inv-1", "addr-a");
        p.block_hash = Some(hash);
        env.put_payment(&p).unwrap();
        assert_eq!(env.find_payments_by_block_hash(&hash).unwrap().len(), 1);

        p.block_hash = None;
        env.put_payment(&p).unwrap();
        assert!(env.find_payments_by_block_hash(&hash).unwrap().is_empty());
    }

    #[test]
    fn moving_block_hash_reindexes() {
        let (_dir, env) = temp_env();
        let old_hash = BlockHash::new([1; 32]);
        let new_hash = BlockHash::new([2; 32]);
        let mut p = payment("inv-1", "addr-a");
        p.block_hash = Some(old_hash);
        env.put_payment(&p).unwrap();

        p.block_hash = Some(new_hash);
        env.put_payment(&p).unwrap();
        assert!(env.find_payments_by_block_hash(&old_hash).unwrap().is_empty());
        assert_eq!(env.find_payments_by_block_hash(&new_hash).unwrap().len(), 1);
    }

    #[test]
    fn rebuild_restores_dropped_index_entries() {
        let (_dir, env) = temp_env();
        let hash = BlockHash::new([4; 32]);
        let ntxid = NormalizedTxId::new([5; 32]);
        let mut p = payment("inv-1", "addr-a");
        p.normalized_tx_id = Some(ntxid);
        p.block_hash = Some(hash);
        env.put_payment(&p).unwrap();

        let mut wtxn = env.env.write_txn().unwrap();
        env.block_index.clear(&mut wtxn).unwrap();
        env.ntxid_index.clear(&mut wtxn).unwrap();
        wtxn.commit().unwrap();
        assert!(env.find_payment_by_tx_id(&ntxid).unwrap().is_none());

        assert_eq!(env.rebuild_payment_indexes().unwrap(), 1);
        assert_eq!(env.find_payment_by_tx_id(&ntxid).unwrap().unwrap().id, p.id);
        assert_eq!(env.find_payments_by_block_hash(&hash).unwrap().len(), 1);
        assert!(env.check_integrity().unwrap().is_healthy());
    }

    #[test]
    fn invoice_lookup() {
        let (_dir, env) = temp_env();
        env.put_payment(&payment("inv-1", "addr-a")).unwrap();
        env.put_payment(&payment("inv-1", "addr-b")).unwrap();
        env.put_payment(&payment("inv-2", "addr-c")).unwrap();

        let found = env
            .find_payments_by_invoice(&InvoiceId::new("inv-1").unwrap())
            .unwrap();
        assert_eq!(found.len(), 2);
    }
}
