//! LMDB implementation of InvoiceStore.

use tally_store::invoice::InvoiceStore;
use tally_store::StoreError;
use tally_types::{Invoice, InvoiceId};

use crate::{LmdbEnvironment, LmdbError};

impl InvoiceStore for LmdbEnvironment {
    fn get_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError> {
        let rtxn = self.env.read_txn().map_err(LmdbError::from)?;
        match self
            .invoices_db
            .get(&rtxn, id.as_str().as_bytes())
            .map_err(LmdbError::from)?
        {
            Some(bytes) => {
                let invoice: Invoice = bincode::deserialize(bytes).map_err(LmdbError::from)?;
                Ok(Some(invoice))
            }
            None => Ok(None),
        }
    }

    fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError> {
        let bytes = bincode::serialize(invoice).map_err(LmdbError::from)?;
        let mut wtxn = self.env.write_txn().map_err(LmdbError::from)?;
        self.invoices_db
            .put(&mut wtxn, invoice.id.as_str().as_bytes(), &bytes)
            .map_err(LmdbError::from)?;
        wtxn.commit().map_err(LmdbError::from)?;
        Ok(())
    }
}
