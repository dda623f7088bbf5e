//! Invoices as seen by the reconciler.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::TypesError;

/// Identifier of an invoice in the external invoicing system.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InvoiceId(String);

impl InvoiceId {
    pub fn new(raw: impl Into<String>) -> Result<Self, TypesError> {
        let s = raw.into();
        if s.is_empty() {
            return Err(TypesError::InvalidId("invoice id is empty".to_string()));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for InvoiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The slice of an invoice the reconciler needs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: InvoiceId,
    /// Confirmations required before a payment counts as paid.
    pub min_confirmations: u32,
    /// Total amount due, in satoshis.
    pub expected_amount: u64,
}
