//! Replication fan-out over the peer bus.

use std::sync::Arc;

use tracing::debug;

use haven_rpc::Replicator;
use haven_swarm::SwarmMap;
use haven_transport::PeerBus;

/// Pushes replication and forwarded-mutation payloads to every co-swarm
/// peer. Delivery is concurrent, unordered, and best-effort: failures are
/// logged and never surface to the client that triggered them.
pub struct BusReplicator {
    bus: Arc<PeerBus>,
    swarm: Arc<SwarmMap>,
}

impl BusReplicator {
    pub fn new(bus: Arc<PeerBus>, swarm: Arc<SwarmMap>) -> Self {
        Self { bus, swarm }
    }
}

impl Replicator for BusReplicator {
    fn relay(&self, endpoint: String, payload: Vec<u8>) {
        for peer in self.swarm.co_swarm_peers() {
            let bus = self.bus.clone();
            let endpoint = endpoint.clone();
            let payload = payload.clone();
            tokio::spawn(async move {
                if let Err(e) = bus
                    .send(peer.ed25519_pubkey, peer.address, &endpoint, payload)
                    .await
                {
                    debug!(
                        peer = %hex::encode(peer.ed25519_pubkey),
                        endpoint,
                        "replication push failed: {e}"
                    );
                }
            });
        }
    }
}
