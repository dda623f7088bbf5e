//! LMDB document store backend for the tally payment reconciler.
//!
//! Implements every storage trait from `tally-store` on [`LmdbEnvironment`]
//! using the `heed` LMDB bindings. Documents are bincode-encoded; secondary
//! lookups are separate databases of composite keys maintained in the same
//! write transaction as the document they index.

pub mod environment;
pub mod error;
pub mod integrity;
pub mod invoice;
pub mod meta;
pub mod migration;
pub mod payment;
pub mod pointer;

pub use environment::LmdbEnvironment;
pub use error::LmdbError;
pub use integrity::IntegrityReport;
