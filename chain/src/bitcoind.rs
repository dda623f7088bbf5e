//! Bitcoin Core JSON-RPC chain source.
//!
//! Uses three RPCs: `getbestblockhash`, `getblock <hash> 1` and
//! `listsinceblock <hash>`. A block counts as valid while the node reports
//! non-negative confirmations for it; stale blocks report `-1`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use tally_types::{Block, BlockHash, NormalizedTxId, ObservedTransaction, PaymentAddress};

use crate::{ChainError, ChainSource, SinceBlock};

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// RPC_INVALID_ADDRESS_OR_KEY, returned by `getblock` for unknown hashes.
const RPC_BLOCK_NOT_FOUND: i32 = -5;

const SATS_PER_BTC: f64 = 100_000_000.0;

/// JSON-RPC 1.0 request structure (Bitcoin Core format).
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    method: &'a str,
    params: Vec<serde_json::Value>,
    id: u64,
}

/// JSON-RPC 1.0 response. One of `result`/`error` is null.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Clone, PartialEq, Eq)]
pub struct BitcoindConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub timeout: Duration,
}

/// Custom Debug to redact passwords
impl std::fmt::Debug for BitcoindConfig {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("BitcoindConfig")
            .field("url", &self.url)
            .field("username", &self.username)
            .field("password", &"[redacted]")
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// `getblock` verbosity 1 response, reduced to the fields we use.
#[derive(Deserialize, Debug)]
struct RawBlock {
    hash: String,
    confirmations: i64,
    #[serde(default)]
    previousblockhash: Option<String>,
}

/// One entry of `listsinceblock`'s `transactions` array.
#[derive(Deserialize, Debug)]
struct RawTransaction {
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    category: Option<String>,
    amount: f64,
    confirmations: i64,
    #[serde(default)]
    blockhash: Option<String>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    normtxid: Option<String>,
}

#[derive(Deserialize, Debug)]
struct RawSinceBlock {
    transactions: Vec<RawTransaction>,
    lastblock: String,
}

fn parse_hash(field: &str, raw: &str) -> Result<BlockHash, ChainError> {
    raw.parse()
        .map_err(|e| ChainError::Parse(format!("{field}: {e}")))
}

impl RawBlock {
    fn into_block(self) -> Result<Block, ChainError> {
        Ok(Block {
            hash: parse_hash("hash", &self.hash)?,
            previous_hash: self
                .previousblockhash
                .as_deref()
                .map(|h| parse_hash("previousblockhash", h))
                .transpose()?,
            confirmations: self.confirmations.max(0) as u32,
            is_valid: self.confirmations >= 0,
        })
    }
}

impl RawTransaction {
    /// Convert to the reconciler's view. Unparseable identifiers become
    /// `None` so the matcher can skip the transaction as malformed.
    fn into_observed(self) -> ObservedTransaction {
        let normalized_tx_id = self.normtxid.as_deref().and_then(|raw| {
            raw.parse::<NormalizedTxId>()
                .map_err(|e| warn!(normtxid = raw, error = %e, "unparseable normtxid"))
                .ok()
        });
        let address = self
            .address
            .and_then(|raw| PaymentAddress::new(raw).ok());
        let block_hash = self.blockhash.as_deref().and_then(|raw| {
            raw.parse::<BlockHash>()
                .map_err(|e| warn!(blockhash = raw, error = %e, "unparseable blockhash"))
                .ok()
        });

        ObservedTransaction {
            normalized_tx_id,
            tx_id: self.txid,
            address,
            amount: (self.amount.abs() * SATS_PER_BTC).round() as u64,
            block_hash,
            confirmations: self.confirmations.max(0) as u32,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BitcoindChainSource {
    client: reqwest::Client,
    url: String,
    request_id: Arc<AtomicU64>,
}

impl BitcoindChainSource {
    pub fn new(config: &BitcoindConfig) -> Result<Self, ChainError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", config.username, config.password))
            )
            .parse()
            .map_err(|e| ChainError::Other(format!("invalid auth header: {e}")))?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(config.timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ChainError::Other(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: Vec<serde_json::Value>,
    ) -> Result<T, ChainError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest { method, params, id };
        debug!(method, id, "bitcoind request");

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                error!(method, error = %e, "HTTP request to bitcoind failed");
                if e.is_timeout() {
                    ChainError::Transport(format!("request timed out: {e}"))
                } else {
                    ChainError::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ChainError::Transport(format!("failed to read body: {e}")))?;

        // Bitcoin Core answers RPC-level failures with a non-2xx status and
        // a JSON-RPC error body; prefer the structured error when present.
        match serde_json::from_str::<JsonRpcResponse<T>>(&body) {
            Ok(JsonRpcResponse {
                error: Some(err), ..
            }) => Err(ChainError::Rpc {
                code: err.code,
                message: err.message,
            }),
            Ok(JsonRpcResponse {
                result: Some(result),
                ..
            }) if status.is_success() => Ok(result),
            _ if !status.is_success() => Err(ChainError::Http {
                status_code: status.as_u16(),
                message: body,
            }),
            Ok(_) => Err(ChainError::Parse(format!(
                "{method}: response has neither result nor error"
            ))),
            Err(e) => Err(ChainError::Parse(format!("{method}: {e}"))),
        }
    }
}

#[async_trait]
impl ChainSource for BitcoindChainSource {
    async fn current_tip(&self) -> Result<BlockHash, ChainError> {
        let raw: String = self.request("getbestblockhash", vec![]).await?;
        parse_hash("getbestblockhash", &raw)
    }

    async fn get_block(&self, hash: &BlockHash) -> Result<Option<Block>, ChainError> {
        let params = vec![
            serde_json::Value::String(hash.to_string()),
            serde_json::json!(1),
        ];
        match self.request::<RawBlock>("getblock", params).await {
            Ok(raw) => raw.into_block().map(Some),
            Err(ChainError::Rpc { code, .. }) if code == RPC_BLOCK_NOT_FOUND => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn list_since(&self, hash: &BlockHash) -> Result<SinceBlock, ChainError> {
        let params = vec![serde_json::Value::String(hash.to_string())];
        let raw: RawSinceBlock = self.request("listsinceblock", params).await?;
        let new_tip = parse_hash("lastblock", &raw.lastblock)?;
        let transactions = raw
            .transactions
            .into_iter()
            .filter(|tx| tx.category.as_deref() != Some("send"))
            .map(RawTransaction::into_observed)
            .collect();
        Ok(SinceBlock {
            transactions,
            new_tip,
        })
    }
}
