use log::{debug, info};
use rand::seq::SliceRandom;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;

use crate::error::RpcError;

/// Public gateway that hands out v4 nodes run by a second provider.
pub const DEFAULT_ACCESS_URL: &str = "https://ton.access.orbs.network";

const V4_MAINNET: &str = "v4-mainnet";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AccessNode {
    node_id: String,
    #[serde(default)]
    weight: Option<serde_json::Value>,
    #[serde(default)]
    mngr: Option<AccessManager>,
}

#[derive(Debug, Deserialize)]
struct AccessManager {
    #[serde(default)]
    health: HashMap<String, bool>,
}

impl AccessNode {
    fn serves_v4_mainnet(&self) -> bool {
        let weighted = match &self.weight {
            Some(w) => w.as_f64().is_some_and(|w| w > 0.0),
            None => true,
        };
        let healthy = self
            .mngr
            .as_ref()
            .and_then(|m| m.health.get(V4_MAINNET))
            .copied()
            .unwrap_or(false);
        weighted && healthy && !self.node_id.is_empty()
    }
}

/// Pick one healthy node and build its v4 mainnet endpoint.
pub fn pick_v4_endpoint(access_url: &str, nodes: &[AccessNode]) -> Result<String, RpcError> {
    let healthy: Vec<&AccessNode> = nodes.iter().filter(|n| n.serves_v4_mainnet()).collect();
    debug!("{} of {} access nodes serve {V4_MAINNET}", healthy.len(), nodes.len());
    let node = healthy
        .choose(&mut rand::thread_rng())
        .ok_or_else(|| RpcError::Unavailable("no healthy v4 access node".to_string()))?;
    Ok(format!(
        "{}/{}/1/mainnet/ton-api-v4",
        access_url.trim_end_matches('/'),
        node.node_id
    ))
}

/// Ask the access gateway for its node list and return one v4 endpoint.
pub async fn discover_v4_endpoint(client: &Client, access_url: &str) -> Result<String, RpcError> {
    let url = format!("{}/mngr/nodes", access_url.trim_end_matches('/'));
    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| RpcError::transport("v4-access", e))?;
    if !resp.status().is_success() {
        return Err(RpcError::Status {
            backend: "v4-access".to_string(),
            status: resp.status().as_u16(),
        });
    }
    let nodes: Vec<AccessNode> = resp
        .json()
        .await
        .map_err(|e| RpcError::Decode(format!("access node list: {e}")))?;
    let endpoint = pick_v4_endpoint(access_url, &nodes)?;
    info!("discovered secondary v4 endpoint {endpoint}");
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::mock::serve_json;

    const NODES: &str = r#"[
        {"NodeId":"down","Weight":1,"Mngr":{"health":{"v4-mainnet":false,"v2-mainnet":true}}},
        {"NodeId":"drained","Weight":0,"Mngr":{"health":{"v4-mainnet":true}}},
        {"NodeId":"good","BackendName":"be-1","Weight":1,"Healthy":"1","Mngr":{"health":{"v4-mainnet":true}}}
    ]"#;

    fn nodes() -> Vec<AccessNode> {
        serde_json::from_str(NODES).unwrap()
    }

    #[test]
    fn only_healthy_weighted_nodes_are_picked() {
        for _ in 0..10 {
            assert_eq!(
                pick_v4_endpoint("https://access.example/", &nodes()).unwrap(),
                "https://access.example/good/1/mainnet/ton-api-v4"
            );
        }
    }

    #[test]
    fn no_healthy_node_is_unavailable() {
        let nodes: Vec<AccessNode> = serde_json::from_str(r#"[{"NodeId":"x","Mngr":{"health":{}}}]"#).unwrap();
        assert!(matches!(
            pick_v4_endpoint("https://access.example", &nodes),
            Err(RpcError::Unavailable(_))
        ));
    }

    #[tokio::test]
    async fn discovery_reads_the_node_list() {
        let server = serve_json(NODES).await;
        let endpoint = discover_v4_endpoint(&Client::new(), &server.url).await.unwrap();
        assert_eq!(endpoint, format!("{}/good/1/mainnet/ton-api-v4", server.url));
        assert_eq!(server.paths(), vec!["/mngr/nodes".to_string()]);
    }
}
