use thiserror::Error;

use crate::config::ConfigError;
use crate::wallet::WalletError;

/// Top-level failure surfaced from startup. Everything past startup is
/// logged and absorbed by the loops instead.
#[derive(Debug, Error)]
pub enum MinerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("rpc error: {0}")]
    Rpc(#[from] RpcError),
    #[error("wallet error: {0}")]
    Wallet(#[from] WalletError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Error)]
pub enum RpcError {
    #[error("transport failure on `{backend}`: {reason}")]
    Transport { backend: String, reason: String },
    #[error("`{backend}` answered with HTTP {status}")]
    Status { backend: String, status: u16 },
    #[error("could not decode response: {0}")]
    Decode(String),
    #[error("get-method `{method}` exited with code {exit_code}")]
    MethodFailed { method: String, exit_code: i64 },
    #[error("backend unavailable: {0}")]
    Unavailable(String),
}

impl RpcError {
    pub fn transport(backend: &str, reason: impl ToString) -> Self {
        Self::Transport {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }
}
