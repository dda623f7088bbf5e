//! LMDB environment setup.

use std::path::{Path, PathBuf};

use heed::types::Bytes;
use heed::{Database, Env, EnvOpenOptions};

use crate::migration::Migrator;
use crate::LmdbError;

/// Names of every database this backend creates.
pub(crate) const DATABASE_NAMES: &[&str] = &[
    "meta",
    "invoices",
    "payments",
    "payments_by_ntxid",
    "payments_by_address",
    "payments_by_block",
    "payments_by_invoice",
];

/// Databases needed by this backend; anything above this is headroom.
const MIN_DBS: u32 = 8;

/// Wraps the LMDB environment and all database handles.
pub struct LmdbEnvironment {
    path: PathBuf,
    pub(crate) env: Env,
    pub(crate) meta_db: Database<Bytes, Bytes>,
    pub(crate) invoices_db: Database<Bytes, Bytes>,
    pub(crate) payments_db: Database<Bytes, Bytes>,
    /// ntxid (32 bytes) -> payment id (16 bytes)
    pub(crate) ntxid_index: Database<Bytes, Bytes>,
    /// address ++ 0x00 ++ payment id -> ()
    pub(crate) address_index: Database<Bytes, Bytes>,
    /// block hash (32 bytes) ++ payment id -> ()
    pub(crate) block_index: Database<Bytes, Bytes>,
    /// invoice id ++ 0x00 ++ payment id -> ()
    pub(crate) invoice_index: Database<Bytes, Bytes>,
}

impl LmdbEnvironment {
    /// Open or create an LMDB environment at the given path and bring its
    /// schema up to date.
    pub fn open(path: &Path, max_dbs: u32, map_size: usize) -> Result<Self, LmdbError> {
        std::fs::create_dir_all(path)?;

        // SAFETY: the environment is opened once per process per path; the
        // daemon never opens the same directory twice.
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_dbs.max(MIN_DBS))
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let meta_db = env.create_database(&mut wtxn, Some("meta"))?;
        let invoices_db = env.create_database(&mut wtxn, Some("invoices"))?;
        let payments_db = env.create_database(&mut wtxn, Some("payments"))?;
        let ntxid_index = env.create_database(&mut wtxn, Some("payments_by_ntxid"))?;
        let address_index = env.create_database(&mut wtxn, Some("payments_by_address"))?;
        let block_index = env.create_database(&mut wtxn, Some("payments_by_block"))?;
        let invoice_index = env.create_database(&mut wtxn, Some("payments_by_invoice"))?;
        wtxn.commit()?;

        let environment = Self {
            path: path.to_path_buf(),
            env,
            meta_db,
            invoices_db,
            payments_db,
            ntxid_index,
            address_index,
            block_index,
            invoice_index,
        };

        Migrator::run(&environment)?;
        tracing::debug!(path = %path.display(), "opened LMDB environment");
        Ok(environment)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn env(&self) -> &Env {
        &self.env
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_store::MetaStore;

    #[test]
    fn open_creates_directory_and_sets_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("db");
        let env = LmdbEnvironment::open(&path, 8, 16 * 1024 * 1024).unwrap();
        assert!(path.join("data.mdb").exists());
        assert_eq!(
            env.get_schema_version().unwrap(),
            crate::migration::CURRENT_SCHEMA_VERSION
        );
    }

    #[test]
    fn reopen_keeps_schema_version() {
        let dir = tempfile::tempdir().unwrap();
        {
            LmdbEnvironment::open(dir.path(), 8, 16 * 1024 * 1024).unwrap();
        }
        let env = LmdbEnvironment::open(dir.path(), 8, 16 * 1024 * 1024).unwrap();
        assert_eq!(
            env.get_schema_version().unwrap(),
            crate::migration::CURRENT_SCHEMA_VERSION
        );
    }
}
