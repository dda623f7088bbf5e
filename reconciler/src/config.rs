//! Reconciler configuration with TOML file support.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use tally_chain::BitcoindConfig;

use crate::logging::LogFormat;
use crate::ReconcileError;

/// Connection settings for the Bitcoin Core node.
#[derive(Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// JSON-RPC endpoint.
    #[serde(default = "default_rpc_url")]
    pub rpc_url: String,

    #[serde(default)]
    pub rpc_user: String,

    #[serde(default)]
    pub rpc_password: String,

    /// Per-request timeout.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ChainConfig {
    pub fn to_bitcoind(&self) -> BitcoindConfig {
        BitcoindConfig {
            url: self.rpc_url.clone(),
            username: self.rpc_user.clone(),
            password: self.rpc_password.clone(),
            timeout: Duration::from_secs(self.request_timeout_secs),
        }
    }
}

/// Custom Debug to redact passwords
impl std::fmt::Debug for ChainConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainConfig")
            .field("rpc_url", &self.rpc_url)
            .field("rpc_user", &self.rpc_user)
            .field("rpc_password", &"[redacted]")
            .field("request_timeout_secs", &self.request_timeout_secs)
            .finish()
    }
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            rpc_url: default_rpc_url(),
            rpc_user: String::new(),
            rpc_password: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Configuration for a reconciler deployment.
///
/// Can be loaded from a TOML file via [`ReconcilerConfig::from_toml_file`] or
/// built programmatically (e.g. for tests).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Data directory for the ledger store.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default)]
    pub chain: ChainConfig,

    /// Seconds between the start of two scheduled passes.
    #[serde(default = "default_pass_interval_secs")]
    pub pass_interval_secs: u64,

    /// Most invalid blocks one pass may walk back past.
    #[serde(default = "default_max_reorg_depth")]
    pub max_reorg_depth: usize,

    /// Transactions of one batch reconciled at the same time.
    #[serde(default = "default_max_concurrent_transactions")]
    pub max_concurrent_transactions: usize,

    /// Log format: "human" or "json".
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Log level filter: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Whether to serve Prometheus metrics.
    #[serde(default)]
    pub enable_metrics: bool,

    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// LMDB map size in bytes.
    #[serde(default = "default_lmdb_map_size")]
    pub lmdb_map_size: usize,

    /// How long shutdown waits for the pass in flight.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

// ── Serde default helpers ──────────────────────────────────────────────

fn default_rpc_url() -> String {
    "http://127.0.0.1:8332".to_string()
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./tally_data")
}

fn default_pass_interval_secs() -> u64 {
    30
}

fn default_max_reorg_depth() -> usize {
    100
}

fn default_max_concurrent_transactions() -> usize {
    8
}

fn default_log_format() -> String {
    "human".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9187
}

fn default_lmdb_map_size() -> usize {
    1 << 30
}

fn default_shutdown_grace_secs() -> u64 {
    60
}

// ── Impl ───────────────────────────────────────────────────────────────

impl ReconcilerConfig {
    /// Load configuration from a TOML file.
    pub fn from_toml_file(path: &str) -> Result<Self, ReconcileError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ReconcileError::Config(e.to_string()))?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ReconcileError> {
        toml::from_str(s).map_err(|e| ReconcileError::Config(e.to_string()))
    }

    /// Serialize the configuration to a TOML string.
    pub fn to_toml_string(&self) -> String {
        toml::to_string_pretty(self).expect("ReconcilerConfig is always serializable to TOML")
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        if self.pass_interval_secs == 0 {
            return Err(ReconcileError::Config("pass_interval_secs must be > 0".into()));
        }
        if self.max_reorg_depth == 0 {
            return Err(ReconcileError::Config("max_reorg_depth must be > 0".into()));
        }
        if self.max_concurrent_transactions == 0 {
            return Err(ReconcileError::Config(
                "max_concurrent_transactions must be > 0".into(),
            ));
        }
        self.log_format()?;
        Ok(())
    }

    pub fn pass_interval(&self) -> Duration {
        Duration::from_secs(self.pass_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn log_format(&self) -> Result<LogFormat, ReconcileError> {
        self.log_format.parse()
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            chain: ChainConfig::default(),
            pass_interval_secs: default_pass_interval_secs(),
            max_reorg_depth: default_max_reorg_depth(),
            max_concurrent_transactions: default_max_concurrent_transactions(),
            log_format: default_log_format(),
            log_level: default_log_level(),
            enable_metrics: false,
            metrics_port: default_metrics_port(),
            lmdb_map_size: default_lmdb_map_size(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}
