//! Invoice storage trait.

use crate::StoreError;
use tally_types::{Invoice, InvoiceId};

pub trait InvoiceStore {
    fn get_invoice(&self, id: &InvoiceId) -> Result<Option<Invoice>, StoreError>;
    fn put_invoice(&self, invoice: &Invoice) -> Result<(), StoreError>;
}
