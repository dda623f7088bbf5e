//! Payment status from confirmation counts.

use tally_types::{Payment, PaymentStatus};

/// Status of `payment` given the confirmations of its transaction and the
/// invoice's confirmation policy.
///
/// Zero confirmations is always `Pending`, even under a zero-confirmation
/// policy, so a payment cleared by a reorg never reads as settled. Once the
/// threshold is reached the paid amount decides between `Paid`, `Overpaid`
/// and `Partial`.
pub fn payment_status(payment: &Payment, confirmations: u32, min_confirmations: u32) -> PaymentStatus {
    if confirmations == 0 {
        return PaymentStatus::Pending;
    }
    if confirmations < min_confirmations.max(1) {
        return PaymentStatus::Confirming;
    }
    match payment.amount_paid.cmp(&payment.expected_amount) {
        std::cmp::Ordering::Less => PaymentStatus::Partial,
        std::cmp::Ordering::Equal => PaymentStatus::Paid,
        std::cmp::Ordering::Greater => PaymentStatus::Overpaid,
    }
}
