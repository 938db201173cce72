use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{Backend, BlockRef, StackEntry};
use crate::error::RpcError;

/// Network config listing the public liteservers.
pub const DEFAULT_GLOBAL_CONFIG_URL: &str = "https://ton-blockchain.github.io/global.config.json";

#[derive(Debug, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    liteservers: Vec<LiteServerEntry>,
}

#[derive(Debug, Deserialize)]
struct LiteServerEntry {
    ip: i64,
    port: u16,
    id: LiteServerId,
}

#[derive(Debug, Deserialize)]
struct LiteServerId {
    key: String,
}

/// One liteserver reachable over the peer protocol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerEndpoint {
    pub addr: SocketAddrV4,
    pub public_key: [u8; 32],
}

impl PeerEndpoint {
    pub fn host(&self) -> String {
        format!("tcp://{}", self.addr)
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host())
    }
}

/// The config stores IPv4 addresses as packed, possibly negative, 32-bit integers.
pub fn int_to_ip(packed: i64) -> Ipv4Addr {
    Ipv4Addr::from(packed as u32)
}

/// Turn the config entries into endpoints; entries with a bad key are skipped.
pub fn parse_peers(config: &GlobalConfig) -> Vec<PeerEndpoint> {
    config
        .liteservers
        .iter()
        .filter_map(|ls| {
            let key = match general_purpose::STANDARD.decode(ls.id.key.trim()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    warn!("liteserver {}:{} has an undecodable key: {err}", int_to_ip(ls.ip), ls.port);
                    return None;
                }
            };
            let public_key: [u8; 32] = match key.try_into() {
                Ok(k) => k,
                Err(bytes) => {
                    let bytes: Vec<u8> = bytes;
                    warn!(
                        "liteserver {}:{} key is {} bytes, expected 32",
                        int_to_ip(ls.ip),
                        ls.port,
                        bytes.len()
                    );
                    return None;
                }
            };
            Some(PeerEndpoint {
                addr: SocketAddrV4::new(int_to_ip(ls.ip), ls.port),
                public_key,
            })
        })
        .collect()
}

/// Fetch the network config document and extract the liteserver list.
pub async fn discover_peers(client: &Client, url: &str) -> Result<Vec<PeerEndpoint>, RpcError> {
    let resp = client
        .get(url)
        .send()
        .await
        .map_err(|e| RpcError::transport("global-config", e))?;
    if !resp.status().is_success() {
        return Err(RpcError::Status {
            backend: "global-config".to_string(),
            status: resp.status().as_u16(),
        });
    }
    let config: GlobalConfig = resp
        .json()
        .await
        .map_err(|e| RpcError::Decode(format!("global config: {e}")))?;
    let peers = parse_peers(&config);
    debug!("discovered {} liteservers from {url}", peers.len());
    Ok(peers)
}

/// Wire-level exchange with a single liteserver.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn masterchain_seqno(&self, peer: &PeerEndpoint) -> Result<u32, RpcError>;

    async fn run_method(
        &self,
        peer: &PeerEndpoint,
        seqno: u32,
        address: &str,
        method: &str,
    ) -> Result<Vec<StackEntry>, RpcError>;

    async fn send_message(&self, peer: &PeerEndpoint, message: &[u8]) -> Result<(), RpcError>;
}

/// Round-robin client over every discovered liteserver.
pub struct PeerBackend {
    peers: Vec<PeerEndpoint>,
    next: AtomicUsize,
    transport: Arc<dyn PeerTransport>,
}

impl PeerBackend {
    pub fn new(peers: Vec<PeerEndpoint>, transport: Arc<dyn PeerTransport>) -> Result<Self, RpcError> {
        if peers.is_empty() {
            return Err(RpcError::Unavailable("no usable liteservers".to_string()));
        }
        Ok(Self {
            peers,
            next: AtomicUsize::new(0),
            transport,
        })
    }

    fn pick(&self) -> &PeerEndpoint {
        let i = self.next.fetch_add(1, Ordering::Relaxed);
        &self.peers[i % self.peers.len()]
    }
}

#[async_trait]
impl Backend for PeerBackend {
    fn name(&self) -> &str {
        "liteserver"
    }

    async fn last_block(&self) -> Result<BlockRef, RpcError> {
        let peer = self.pick();
        let seqno = self.transport.masterchain_seqno(peer).await?;
        Ok(BlockRef { seqno })
    }

    async fn run_method(
        &self,
        block: BlockRef,
        address: &str,
        method: &str,
    ) -> Result<Vec<StackEntry>, RpcError> {
        let peer = self.pick();
        self.transport
            .run_method(peer, block.seqno, address, method)
            .await
    }

    async fn send_message(&self, message: &[u8]) -> Result<(), RpcError> {
        let peer = self.pick();
        self.transport.send_message(peer, message).await
    }
}
