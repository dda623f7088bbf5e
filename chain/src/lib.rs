//! Chain data source for the tally payment reconciler.
//!
//! The reconciler never talks to a node directly; it goes through the
//! [`ChainSource`] trait, which reports block validity as a plain boolean and
//! lists wallet activity since a given block. [`BitcoindChainSource`] is the
//! production implementation backed by Bitcoin Core's JSON-RPC interface.

pub mod bitcoind;
pub mod error;
pub mod source;

pub use bitcoind::{BitcoindChainSource, BitcoindConfig};
pub use error::ChainError;
pub use source::{ChainSource, SinceBlock};
