use thiserror::Error;

/// Errors from a chain data source.
#[derive(Debug, Error)]
pub enum ChainError {
    #[error("HTTP error {status_code}: {message}")]
    Http { status_code: u16, message: String },

    #[error("request failed: {0}")]
    Transport(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("chain source error: {0}")]
    Other(String),
}
