//! Domain types for the tally payment reconciler.
//!
//! This crate defines the value types shared across every other crate in the
//! workspace: block and transaction identifiers, the persisted block pointer,
//! observed chain transactions, invoices, payments and their status vocabulary.

pub mod address;
pub mod block;
pub mod error;
pub mod hash;
pub mod invoice;
pub mod payment;
pub mod transaction;

pub use address::PaymentAddress;
pub use block::{Block, BlockHash, BlockPointer};
pub use error::TypesError;
pub use hash::NormalizedTxId;
pub use invoice::{Invoice, InvoiceId};
pub use payment::{Payment, PaymentId, PaymentStatus};
pub use transaction::ObservedTransaction;
