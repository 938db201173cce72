use async_trait::async_trait;
use log::{debug, info, warn};
use reqwest::Client;
use std::fmt;
use std::sync::Arc;
use tokio::sync::OnceCell;

use super::Backend;
use super::http::HttpBackend;
use super::peer::{PeerBackend, PeerEndpoint, PeerTransport, discover_peers};
use crate::config::Config;
use crate::error::RpcError;

/// Independent RPC providers the pool knows how to reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Flavor {
    /// Default public v4 endpoint.
    Primary,
    /// v4 endpoint run by a different provider.
    Secondary,
    /// Direct liteserver connections.
    Peer,
}

impl Flavor {
    pub const ALL: [Flavor; 3] = [Flavor::Primary, Flavor::Secondary, Flavor::Peer];
}

impl fmt::Display for Flavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Flavor::Primary => "primary",
            Flavor::Secondary => "secondary",
            Flavor::Peer => "peer",
        };
        f.write_str(name)
    }
}

/// Builds the backend for one flavor. Runs at most once per flavor on success.
#[async_trait]
pub trait BackendConnector: Send + Sync {
    async fn connect(&self, flavor: Flavor) -> Result<Arc<dyn Backend>, RpcError>;
}

/// Connector for the real network.
///
/// Both v4 flavors connect without network IO. The secondary one resolves its
/// endpoint on first request unless a fixed URL is configured. Liteserver
/// discovery runs once per process; without a transport the peer flavor then
/// reports itself unavailable.
pub struct NetworkConnector {
    primary_endpoint: String,
    secondary_endpoint: Option<String>,
    access_url: String,
    global_config_url: String,
    peer_transport: Option<Arc<dyn PeerTransport>>,
    peers: OnceCell<Vec<PeerEndpoint>>,
    client: Client,
}

impl NetworkConnector {
    pub fn new(
        primary_endpoint: String,
        secondary_endpoint: Option<String>,
        access_url: String,
        global_config_url: String,
        peer_transport: Option<Arc<dyn PeerTransport>>,
    ) -> Self {
        Self {
            primary_endpoint,
            secondary_endpoint,
            access_url,
            global_config_url,
            peer_transport,
            peers: OnceCell::new(),
            client: Client::new(),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.primary_endpoint.clone(),
            config.secondary_endpoint.clone(),
            config.access_url.clone(),
            config.global_config_url.clone(),
            None,
        )
    }

    async fn known_peers(&self) -> Result<&[PeerEndpoint], RpcError> {
        self.peers
            .get_or_try_init(|| async {
                let peers = discover_peers(&self.client, &self.global_config_url).await?;
                info!("discovered {} liteservers", peers.len());
                for peer in &peers {
                    debug!("liteserver {peer}");
                }
                Ok::<_, RpcError>(peers)
            })
            .await
            .map(Vec::as_slice)
    }
}

#[async_trait]
impl BackendConnector for NetworkConnector {
    async fn connect(&self, flavor: Flavor) -> Result<Arc<dyn Backend>, RpcError> {
        match flavor {
            Flavor::Primary => Ok(Arc::new(HttpBackend::new(
                "v4-primary",
                self.primary_endpoint.clone(),
            ))),
            Flavor::Secondary => Ok(Arc::new(match &self.secondary_endpoint {
                Some(endpoint) => HttpBackend::new("v4-secondary", endpoint.clone()),
                None => HttpBackend::discovered("v4-secondary", self.access_url.clone()),
            })),
            Flavor::Peer => {
                let peers = self.known_peers().await?;
                let transport = self.peer_transport.clone().ok_or_else(|| {
                    RpcError::Unavailable(format!(
                        "{} liteservers known, no liteserver transport in this build",
                        peers.len()
                    ))
                })?;
                Ok(Arc::new(PeerBackend::new(peers.to_vec(), transport)?))
            }
        }
    }
}

/// Lazily connected, shared handles to every backend flavor.
///
/// The first caller for a flavor runs its initialisation; concurrent callers
/// wait for that one result. A failed initialisation is not cached, the next
/// call tries again.
pub struct EndpointPool {
    connector: Arc<dyn BackendConnector>,
    preferred: Flavor,
    primary: OnceCell<Arc<dyn Backend>>,
    secondary: OnceCell<Arc<dyn Backend>>,
    peer: OnceCell<Arc<dyn Backend>>,
}

impl EndpointPool {
    pub fn new(connector: Arc<dyn BackendConnector>, preferred: Flavor) -> Self {
        Self {
            connector,
            preferred,
            primary: OnceCell::new(),
            secondary: OnceCell::new(),
            peer: OnceCell::new(),
        }
    }

    fn cell(&self, flavor: Flavor) -> &OnceCell<Arc<dyn Backend>> {
        match flavor {
            Flavor::Primary => &self.primary,
            Flavor::Secondary => &self.secondary,
            Flavor::Peer => &self.peer,
        }
    }

    pub async fn get(&self, flavor: Flavor) -> Result<Arc<dyn Backend>, RpcError> {
        self.cell(flavor)
            .get_or_try_init(|| async {
                let backend = self.connector.connect(flavor).await?;
                info!("connected {flavor} backend `{}`", backend.name());
                Ok::<_, RpcError>(backend)
            })
            .await
            .map(Arc::clone)
    }

    pub async fn primary(&self) -> Result<Arc<dyn Backend>, RpcError> {
        self.get(Flavor::Primary).await
    }

    pub async fn secondary(&self) -> Result<Arc<dyn Backend>, RpcError> {
        self.get(Flavor::Secondary).await
    }

    pub async fn peer(&self) -> Result<Arc<dyn Backend>, RpcError> {
        self.get(Flavor::Peer).await
    }

    pub fn preferred(&self) -> Flavor {
        self.preferred
    }

    /// Backend used for every read: evaluator, mining loop, freshness checks.
    pub async fn query_backend(&self) -> Result<Arc<dyn Backend>, RpcError> {
        self.get(self.preferred).await
    }

    /// Every flavor that can be reached right now, in `Flavor::ALL` order.
    pub async fn broadcast_backends(&self) -> Vec<Arc<dyn Backend>> {
        let (primary, secondary, peer) = tokio::join!(self.primary(), self.secondary(), self.peer());
        let mut out = Vec::with_capacity(Flavor::ALL.len());
        for (flavor, res) in Flavor::ALL.into_iter().zip([primary, secondary, peer]) {
            match res {
                Ok(backend) => out.push(backend),
                Err(RpcError::Unavailable(reason)) => {
                    debug!("{flavor} backend skipped: {reason}");
                }
                Err(err) => warn!("{flavor} backend unreachable: {err}"),
            }
        }
        out
    }
}
