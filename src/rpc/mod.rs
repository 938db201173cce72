pub mod access;
pub mod http;
pub mod peer;
pub mod pool;

use async_trait::async_trait;
use num_bigint::BigInt;
use serde::Deserialize;
use std::sync::Arc;

use crate::error::RpcError;
use crate::wallet::{SignedMessage, WalletAccount};

pub use pool::{EndpointPool, Flavor};

/// Get-method every wallet contract exposes for its sequence number.
pub const SEQNO_METHOD: &str = "seqno";

/// Chain head a group of queries is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRef {
    pub seqno: u32,
}

/// One value of a get-method result stack.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StackEntry {
    Int { value: String },
    Null,
    Cell { cell: String },
    Slice { cell: String },
    Builder { cell: String },
    #[serde(other)]
    Unsupported,
}

impl StackEntry {
    #[cfg(test)]
    pub fn int(value: impl ToString) -> Self {
        Self::Int {
            value: value.to_string(),
        }
    }
}

/// Sequential reader over a result stack.
pub struct StackReader<'a> {
    entries: &'a [StackEntry],
    pos: usize,
}

impl<'a> StackReader<'a> {
    pub fn new(entries: &'a [StackEntry]) -> Self {
        Self { entries, pos: 0 }
    }

    pub fn read_big_number(&mut self) -> Result<BigInt, RpcError> {
        let entry = self.entries.get(self.pos).ok_or_else(|| {
            RpcError::Decode(format!("stack exhausted at position {}", self.pos))
        })?;
        self.pos += 1;
        match entry {
            StackEntry::Int { value } => parse_int(value),
            other => Err(RpcError::Decode(format!(
                "expected int at position {}, got {:?}",
                self.pos - 1,
                other
            ))),
        }
    }
}

fn parse_int(raw: &str) -> Result<BigInt, RpcError> {
    let raw = raw.trim();
    let parsed = match raw.strip_prefix("0x").or_else(|| raw.strip_prefix("-0x")) {
        Some(digits) => BigInt::parse_bytes(digits.as_bytes(), 16).map(|v| {
            if raw.starts_with('-') { -v } else { v }
        }),
        None => BigInt::parse_bytes(raw.as_bytes(), 10),
    };
    parsed.ok_or_else(|| RpcError::Decode(format!("not an integer: {raw}")))
}

/// Capability every RPC flavor offers: read-only get-methods at a pinned
/// head and raw external message submission.
#[async_trait]
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    async fn last_block(&self) -> Result<BlockRef, RpcError>;

    async fn run_method(
        &self,
        block: BlockRef,
        address: &str,
        method: &str,
    ) -> Result<Vec<StackEntry>, RpcError>;

    async fn send_message(&self, message: &[u8]) -> Result<(), RpcError>;
}

/// A wallet account opened on one backend.
pub struct WalletSession {
    backend: Arc<dyn Backend>,
    address: String,
}

impl WalletSession {
    pub fn open(backend: Arc<dyn Backend>, account: &WalletAccount) -> Self {
        Self {
            backend,
            address: account.address.clone(),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Current wallet seqno, read at the latest head.
    pub async fn sequence_number(&self) -> Result<u32, RpcError> {
        let head = self.backend.last_block().await?;
        let stack = self
            .backend
            .run_method(head, &self.address, SEQNO_METHOD)
            .await?;
        let seqno = StackReader::new(&stack).read_big_number()?;
        u32::try_from(seqno).map_err(|e| RpcError::Decode(format!("seqno out of range: {e}")))
    }

    pub async fn send_transaction(&self, message: &SignedMessage) -> Result<(), RpcError> {
        self.backend.send_message(message.as_bytes()).await
    }
}
