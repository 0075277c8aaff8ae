//! Client for the chain oracle daemon.
//!
//! The oracle publishes swarm membership and answers forwarded
//! `oxend_request` calls. It speaks the same peer bus protocol as service
//! nodes; this client keeps one cached connection to it and reuses the
//! previous snapshot whenever a refresh fails.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::json;

use haven_rpc::{OracleGateway, RpcError};
use haven_swarm::{OracleSnapshot, PeerRecord};
use haven_transport::PeerBus;

/// Bus endpoint the oracle daemon answers RPC forwards on.
const ORACLE_ENDPOINT: &str = "rpc.oxend";

pub struct OracleClient {
    bus: Arc<PeerBus>,
    address: SocketAddr,
    pubkey: Option<[u8; 32]>,
}

impl OracleClient {
    pub fn new(bus: Arc<PeerBus>, address: SocketAddr, pubkey: Option<[u8; 32]>) -> Self {
        Self {
            bus,
            address,
            pubkey,
        }
    }

    /// Fetch the current service-node list as a swarm snapshot.
    pub async fn fetch_snapshot(&self) -> Result<OracleSnapshot, RpcError> {
        let reply = self
            .forward("get_service_nodes".to_string(), json!({}))
            .await?;
        parse_snapshot(&reply)
    }
}

impl OracleGateway for OracleClient {
    fn forward(
        &self,
        endpoint: String,
        params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + '_>> {
        Box::pin(async move {
            let Some(pubkey) = self.pubkey else {
                return Err(RpcError::UpstreamUnavailable(
                    "oracle identity not configured".into(),
                ));
            };
            let payload = serde_json::to_vec(&json!({
                "endpoint": endpoint,
                "params": params,
            }))
            .map_err(|e| RpcError::Internal(e.to_string()))?;

            let reply = self
                .bus
                .request(pubkey, self.address, ORACLE_ENDPOINT, payload)
                .await
                .map_err(|e| RpcError::UpstreamUnavailable(e.to_string()))?;
            serde_json::from_slice(&reply)
                .map_err(|e| RpcError::UpstreamUnavailable(format!("bad oracle reply: {e}")))
        })
    }
}

/// Parse the oracle's service-node listing into a snapshot.
pub fn parse_snapshot(value: &serde_json::Value) -> Result<OracleSnapshot, RpcError> {
    let height = value
        .get("height")
        .and_then(|h| h.as_u64())
        .ok_or_else(|| RpcError::UpstreamUnavailable("snapshot missing height".into()))?;
    let states = value
        .get("service_node_states")
        .and_then(|s| s.as_array())
        .ok_or_else(|| RpcError::UpstreamUnavailable("snapshot missing node list".into()))?;

    let mut nodes = Vec::with_capacity(states.len());
    for state in states {
        let Some(node) = parse_node(state) else {
            // A malformed entry is the oracle's bug; skip it rather than
            // dropping the whole snapshot.
            tracing::warn!("skipping malformed service node entry");
            continue;
        };
        nodes.push(node);
    }
    Ok(OracleSnapshot { height, nodes })
}

fn parse_node(state: &serde_json::Value) -> Option<PeerRecord> {
    let ed: [u8; 32] = hex_field(state, "pubkey_ed25519")?;
    let x: [u8; 32] = hex_field(state, "pubkey_x25519")?;
    let ip = state.get("public_ip")?.as_str()?;
    let port = u16::try_from(state.get("storage_port")?.as_u64()?).ok()?;
    let swarm_id = state.get("swarm_id")?.as_u64()?;
    let address: SocketAddr = format!("{ip}:{port}").parse().ok()?;
    Some(PeerRecord {
        ed25519_pubkey: ed,
        x25519_pubkey: x,
        address,
        swarm_id,
    })
}

fn hex_field(value: &serde_json::Value, key: &str) -> Option<[u8; 32]> {
    let decoded = hex::decode(value.get(key)?.as_str()?).ok()?;
    <[u8; 32]>::try_from(decoded.as_slice()).ok()
}
