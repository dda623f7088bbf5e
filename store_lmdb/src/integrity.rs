//! LMDB database integrity checks.
//!
//! Run on startup (and by `tally-daemon status`) to detect corruption early:
//! every payment document must be reachable through the indexes that its
//! fields imply, and every index entry must point at an existing document.

use std::path::Path;

use tally_types::Payment;

use crate::{LmdbEnvironment, LmdbError};

/// Summary of an integrity check run.
#[derive(Debug, Default)]
pub struct IntegrityReport {
    pub databases_checked: u32,
    pub total_entries: u64,
    pub payments_checked: u64,
    pub errors: Vec<String>,
}

impl IntegrityReport {
    /// Returns `true` if no errors were detected.
    pub fn is_healthy(&self) -> bool {
        self.errors.is_empty()
    }
}

impl LmdbEnvironment {
    /// Walk every database and cross-check payment indexes.
    ///
    /// Read failures are recorded in the report rather than causing a hard
    /// error; only failing to start the read transaction is fatal.
    pub fn check_integrity(&self) -> Result<IntegrityReport, LmdbError> {
        let mut report = IntegrityReport::default();
        let rtxn = self.env().read_txn()?;

        for &db_name in crate::environment::DATABASE_NAMES {
            match self
                .env()
                .open_database::<heed::types::Bytes, heed::types::Bytes>(&rtxn, Some(db_name))
            {
                Ok(Some(db)) => {
                    report.databases_checked += 1;
                    match db.len(&rtxn) {
                        Ok(count) => report.total_entries += count,
                        Err(e) => report
                            .errors
                            .push(format!("failed to read database '{}': {}", db_name, e)),
                    }
                }
                Ok(None) => report
                    .errors
                    .push(format!("database '{}' is missing", db_name)),
                Err(e) => report
                    .errors
                    .push(format!("failed to open database '{}': {}", db_name, e)),
            }
        }

        for entry in self.payments_db.iter(&rtxn)? {
            let (key, bytes) = entry?;
            report.payments_checked += 1;
            let payment: Payment = match bincode::deserialize(bytes) {
                Ok(p) => p,
                Err(e) => {
                    report
                        .errors
                        .push(format!("undecodable payment {}: {}", hex_prefix(key), e));
                    continue;
                }
            };

            if let Some(hash) = &payment.block_hash {
                let mut k = hash.as_bytes().to_vec();
                k.extend_from_slice(payment.id.as_bytes());
                if self.block_index.get(&rtxn, &k)?.is_none() {
                    report.errors.push(format!(
                        "payment {} missing from block index for {}",
                        payment.id, hash
                    ));
                }
            }

            if let Some(ntxid) = &payment.normalized_tx_id {
                if self.ntxid_index.get(&rtxn, ntxid.as_bytes())?.is_none() {
                    report.errors.push(format!(
                        "normalized tx id {} claimed by payment {} is not indexed",
                        ntxid, payment.id
                    ));
                }
            }
        }

        for entry in self.ntxid_index.iter(&rtxn)? {
            let (ntxid, id) = entry?;
            if self.payments_db.get(&rtxn, id)?.is_none() {
                report.errors.push(format!(
                    "ntxid index entry {} points at missing payment",
                    hex_prefix(ntxid)
                ));
            }
        }

        Ok(report)
    }
}

pub(crate) fn hex_prefix(bytes: &[u8]) -> String {
    bytes.iter().take(8).map(|b| format!("{:02x}", b)).collect()
}

/// Check if the LMDB data directory looks valid before opening.
///
/// Returns `Ok(())` for a fresh (nonexistent) directory. Returns an error
/// if the directory exists but `data.mdb` is missing, which suggests
/// corruption or misconfiguration.
pub fn check_data_dir(path: &Path) -> Result<(), String> {
    if !path.exists() {
        return Ok(());
    }
    let data_file = path.join("data.mdb");
    if !data_file.exists() {
        return Err(format!(
            "LMDB directory exists but data.mdb is missing at {}",
            path.display()
        ));
    }
    Ok(())
}
