use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use log::{debug, warn};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::OnceCell;

use super::access::discover_v4_endpoint;
use super::{Backend, BlockRef, StackEntry};
use crate::error::RpcError;

/// Public v4 endpoint used when nothing else is configured.
pub const DEFAULT_V4_ENDPOINT: &str = "https://mainnet-v4.tonhubapi.com";

const HTTP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Deserialize)]
struct LatestBlockResponse {
    last: LatestBlock,
}

#[derive(Deserialize)]
struct LatestBlock {
    seqno: u32,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunMethodResponse {
    exit_code: i64,
    #[serde(default)]
    result: Vec<StackEntry>,
}

#[derive(Serialize)]
struct SendRequest {
    boc: String,
}

/// Where a backend's base URL comes from.
enum EndpointSource {
    Fixed(String),
    /// Resolved through the access gateway on first use, then kept.
    Discovered {
        access_url: String,
        resolved: OnceCell<String>,
    },
}

/// Client for a v4-style HTTP API (`/block/latest`, `/block/{seqno}/{addr}/run/{method}`, `/send`).
pub struct HttpBackend {
    name: String,
    source: EndpointSource,
    client: Client,
}

impl HttpBackend {
    pub fn new(name: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into().trim_end_matches('/').to_string();
        Self::with_source(name.into(), EndpointSource::Fixed(endpoint))
    }

    /// Backend whose endpoint is picked from the access gateway's healthy nodes.
    pub fn discovered(name: impl Into<String>, access_url: impl Into<String>) -> Self {
        Self::with_source(
            name.into(),
            EndpointSource::Discovered {
                access_url: access_url.into(),
                resolved: OnceCell::new(),
            },
        )
    }

    fn with_source(name: String, source: EndpointSource) -> Self {
        let client = match Client::builder().timeout(HTTP_TIMEOUT).build() {
            Ok(client) => client,
            Err(err) => {
                warn!("{name}: could not build HTTP client with timeout ({err}), using defaults");
                Client::new()
            }
        };
        Self {
            name,
            source,
            client,
        }
    }

    async fn base_url(&self) -> Result<&str, RpcError> {
        match &self.source {
            EndpointSource::Fixed(url) => Ok(url.as_str()),
            EndpointSource::Discovered {
                access_url,
                resolved,
            } => resolved
                .get_or_try_init(|| discover_v4_endpoint(&self.client, access_url))
                .await
                .map(String::as_str),
        }
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
        let url = format!("{}{}", self.base_url().await?, path);
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| RpcError::transport(&self.name, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Status {
                backend: self.name.clone(),
                status: status.as_u16(),
            });
        }
        resp.json::<T>()
            .await
            .map_err(|e| RpcError::Decode(format!("{}: {e}", self.name)))
    }
}

/// TVM treats 0 and 1 as successful exit codes.
fn exit_code_ok(code: i64) -> bool {
    code == 0 || code == 1
}

#[async_trait]
impl Backend for HttpBackend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn last_block(&self) -> Result<BlockRef, RpcError> {
        let latest: LatestBlockResponse = self.get_json("/block/latest").await?;
        Ok(BlockRef {
            seqno: latest.last.seqno,
        })
    }

    async fn run_method(
        &self,
        block: BlockRef,
        address: &str,
        method: &str,
    ) -> Result<Vec<StackEntry>, RpcError> {
        let path = format!("/block/{}/{}/run/{}", block.seqno, address, method);
        let resp: RunMethodResponse = self.get_json(&path).await?;
        if !exit_code_ok(resp.exit_code) {
            return Err(RpcError::MethodFailed {
                method: method.to_string(),
                exit_code: resp.exit_code,
            });
        }
        Ok(resp.result)
    }

    async fn send_message(&self, message: &[u8]) -> Result<(), RpcError> {
        let url = format!("{}/send", self.base_url().await?);
        let body = SendRequest {
            boc: general_purpose::STANDARD.encode(message),
        };
        let resp = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| RpcError::transport(&self.name, e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RpcError::Status {
                backend: self.name.clone(),
                status: status.as_u16(),
            });
        }
        debug!("{}: message accepted ({} bytes)", self.name, message.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::serve_json;

    #[test]
    fn run_method_response_decodes() {
        let raw = r#"{"arguments":[],"result":[{"type":"int","value":"5"}],"exitCode":0,"resultRaw":null}"#;
        let resp: RunMethodResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.exit_code, 0);
        assert_eq!(resp.result, vec![StackEntry::int(5)]);
    }

    #[test]
    fn latest_block_decodes() {
        let raw = r#"{"last":{"seqno":3849201,"shard":"-9223372036854775808","workchain":-1},"now":1700000000}"#;
        let resp: LatestBlockResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.last.seqno, 3849201);
    }

    #[test]
    fn exit_codes() {
        assert!(exit_code_ok(0));
        assert!(exit_code_ok(1));
        assert!(!exit_code_ok(-13));
        assert!(!exit_code_ok(11));
    }

    #[tokio::test]
    async fn endpoint_is_normalised() {
        let backend = HttpBackend::new("tonhub", "https://example.org/v4/");
        assert_eq!(backend.base_url().await.unwrap(), "https://example.org/v4");
        assert_eq!(backend.name(), "tonhub");
    }

    #[tokio::test]
    async fn discovered_endpoint_is_resolved_once() {
        let nodes = r#"[{"NodeId":"n1","Weight":1,"Mngr":{"health":{"v4-mainnet":true}}}]"#;
        let server = serve_json(nodes).await;
        let backend = HttpBackend::discovered("v4-secondary", server.url.clone());

        let first = backend.base_url().await.unwrap().to_string();
        let second = backend.base_url().await.unwrap().to_string();
        assert_eq!(first, format!("{}/n1/1/mainnet/ton-api-v4", server.url));
        assert_eq!(first, second);
        assert_eq!(server.paths(), vec!["/mngr/nodes".to_string()]);
    }

    #[tokio::test]
    async fn failed_discovery_surfaces_on_the_call() {
        let server = serve_json("[]").await;
        let backend = HttpBackend::discovered("v4-secondary", server.url.clone());
        assert!(matches!(
            backend.last_block().await,
            Err(RpcError::Unavailable(_))
        ));
    }
}
