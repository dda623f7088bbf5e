//! Payments: the mutable ledger entity the reconciler keeps in sync with the
//! chain.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::TypesError;
use crate::{BlockHash, InvoiceId, NormalizedTxId, PaymentAddress};

/// Document id of a payment.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PaymentId(Uuid);

impl PaymentId {
    /// A fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(Uuid::from_bytes(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        self.0.as_bytes()
    }
}

impl FromStr for PaymentId {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| TypesError::InvalidId(e.to_string()))
    }
}

impl fmt::Debug for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PaymentId({})", self.0)
    }
}

impl fmt::Display for PaymentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle status of a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    /// Issued with an invoice; no transaction seen yet.
    Unpaid,
    /// Transaction seen with zero confirmations.
    Pending,
    /// Mined, but below the invoice's confirmation threshold.
    Confirming,
    /// Confirmed and covers the expected amount exactly.
    Paid,
    /// Confirmed and exceeds the expected amount.
    Overpaid,
    /// Confirmed but short of the expected amount.
    Partial,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Pending => "pending",
            Self::Confirming => "confirming",
            Self::Paid => "paid",
            Self::Overpaid => "overpaid",
            Self::Partial => "partial",
        }
    }

    /// Coarse confirmation class: 0 for unconfirmed, 1 while confirming,
    /// 2 once the confirmation threshold has been reached.
    pub fn confirmation_rank(&self) -> u8 {
        match self {
            Self::Unpaid | Self::Pending => 0,
            Self::Confirming => 1,
            Self::Paid | Self::Overpaid | Self::Partial => 2,
        }
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmation_rank() == 2
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment record.
///
/// At most one payment exists per `(invoice, normalized_tx_id)` once the id is
/// attached. A payment without `normalized_tx_id` is unclaimed and waits for
/// its first matching transaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub invoice_id: InvoiceId,
    pub address: PaymentAddress,
    /// Amount this payment is expected to cover, in satoshis.
    pub expected_amount: u64,
    /// Amount actually received, in satoshis.
    pub amount_paid: u64,
    pub normalized_tx_id: Option<NormalizedTxId>,
    pub tx_id: Option<String>,
    pub block_hash: Option<BlockHash>,
    pub status: PaymentStatus,
}

impl Payment {
    /// A new unclaimed payment for an invoice.
    pub fn unclaimed(invoice_id: InvoiceId, address: PaymentAddress, expected_amount: u64) -> Self {
        Self {
            id: PaymentId::random(),
            invoice_id,
            address,
            expected_amount,
            amount_paid: 0,
            normalized_tx_id: None,
            tx_id: None,
            block_hash: None,
            status: PaymentStatus::Unpaid,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.normalized_tx_id.is_some()
    }
}
