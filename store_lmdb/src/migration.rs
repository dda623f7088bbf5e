//! Schema upgrades for the ledger store.
//!
//! The stored version counts applied upgrade steps. Version 1 introduced the
//! payment lookup databases; a store written before them (or one whose
//! version was never recorded) holds documents only, so the step rebuilds
//! every lookup from the payment documents.

use tally_store::MetaStore;

use crate::{LmdbEnvironment, LmdbError};

/// The schema version that the current code expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 1;

type Step = fn(&LmdbEnvironment) -> Result<(), LmdbError>;

/// `STEPS[n]` upgrades a store from version `n` to `n + 1`.
const STEPS: [(&str, Step); CURRENT_SCHEMA_VERSION as usize] =
    [("build payment lookup indexes", build_payment_indexes)];

fn build_payment_indexes(env: &LmdbEnvironment) -> Result<(), LmdbError> {
    env.rebuild_payment_indexes().map(|_| ())
}

/// Applies pending upgrade steps when the environment is opened.
pub struct Migrator;

impl Migrator {
    /// Bring the store up to [`CURRENT_SCHEMA_VERSION`].
    ///
    /// The version is recorded after every step, so an interrupted upgrade
    /// resumes at the step that failed. Stores written by a newer release
    /// are refused. Returns the version the store was at before.
    pub fn run(env: &LmdbEnvironment) -> Result<u32, LmdbError> {
        let found = env.get_schema_version().map_err(|e| LmdbError::Heed(e.to_string()))?;

        if found > CURRENT_SCHEMA_VERSION {
            return Err(LmdbError::Heed(format!(
                "store schema version {found} is newer than supported version {CURRENT_SCHEMA_VERSION}"
            )));
        }
        if found == CURRENT_SCHEMA_VERSION {
            tracing::debug!(version = found, "store schema is current");
            return Ok(found);
        }

        for (version, (name, step)) in STEPS.iter().enumerate().skip(found as usize) {
            let to = version as u32 + 1;
            tracing::info!(from = version, to, step = *name, "upgrading store schema");
            step(env)?;
            env.set_schema_version(to)
                .map_err(|e| LmdbError::Heed(e.to_string()))?;
        }
        tracing::info!(from = found, to = CURRENT_SCHEMA_VERSION, "store schema upgraded");
        Ok(found)
    }
}
