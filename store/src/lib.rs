//! Abstract storage traits for the tally payment reconciler.
//!
//! Every storage backend (LMDB, in-memory for testing) implements these
//! traits. The reconciler depends only on the traits.

pub mod error;
pub mod invoice;
pub mod meta;
pub mod payment;
pub mod pointer;

pub use error::StoreError;
pub use invoice::InvoiceStore;
pub use meta::MetaStore;
pub use payment::PaymentStore;
pub use pointer::PointerStore;

/// Everything a reconciliation pass reads and writes, behind one handle.
///
/// Implemented automatically for any backend that provides the three
/// document stores and can be shared across tasks.
pub trait LedgerStore: PointerStore + InvoiceStore + PaymentStore + Send + Sync {}

impl<T> LedgerStore for T where T: PointerStore + InvoiceStore + PaymentStore + Send + Sync {}
