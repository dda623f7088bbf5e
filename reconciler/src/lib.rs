//! Tally payment reconciler.
//!
//! Keeps a payment ledger in step with a chain that can reorganize. Each
//! pass loads the persisted block pointer, walks back past blocks the chain
//! source no longer considers valid (detaching payments from them), lists
//! wallet activity since the newest valid block, matches every transaction
//! to its payments and finally moves the pointer to the new tip.
//!
//! Collaborators sit behind traits: [`tally_store::LedgerStore`] for
//! persistence, [`tally_chain::ChainSource`] for chain data and
//! [`InvoiceService`] for applying a transaction to a payment.

pub mod config;
pub mod error;
pub mod invoice;
pub mod locks;
pub mod logging;
pub mod matcher;
pub mod metrics;
pub mod pass;
pub mod payment;
pub mod pointer;
pub mod scheduler;
pub mod shutdown;
pub mod spans;
pub mod status;
pub mod walker;

pub use config::{ChainConfig, ReconcilerConfig};
pub use error::{ErrorKind, ReconcileError};
pub use invoice::{InvoiceService, LedgerInvoiceService};
pub use locks::{LockKey, PaymentLocks};
pub use logging::{init_logging, LogFormat};
pub use matcher::{MatchAction, PaymentMatcher, SkipReason};
pub use metrics::ReconcilerMetrics;
pub use pass::{PassReport, Reconciler};
pub use payment::{PaymentReconciler, ReconcileOutcome};
pub use pointer::BlockPointerStore;
pub use scheduler::{ReconcileScheduler, Trigger};
pub use shutdown::{Drained, ShutdownController, ShutdownSignal};
pub use status::payment_status;
pub use walker::{ReorgWalker, Walk};
