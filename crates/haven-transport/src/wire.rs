//! Wire envelope for peer bus messages.
//!
//! Every stream carries length-prefixed frames (`[len:4 LE][data]`); each
//! frame is a bencoded dict with keys `e` (endpoint) and `p` (payload).
//! Replies on request streams are a bare length-prefixed payload with no
//! envelope, since the stream already identifies the request.

use haven_bencode::{dict, Value};

use crate::{Result, TransportError};

/// Upper bound on a single frame, chosen to fit the largest message plus
/// envelope overhead with room to spare.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Peer RPC endpoints used by the core.
pub mod endpoints {
    /// Liveness check; reply carries version and uptime.
    pub const PING: &str = "sn.ping";
    /// Storage audit: prove custody of a stored blob.
    pub const STORAGE_TEST: &str = "sn.storage_test";
    /// Inbound onion relay.
    pub const ONION_REQ: &str = "sn.onion_req";
    /// Replication push of a stored message to co-swarm peers.
    pub const REPLICATE: &str = "sn.replicate";
    /// Prefix for client requests forwarded from another swarm member.
    pub const STORAGE_PREFIX: &str = "storage.";
    /// Push frame for message-monitor subscribers.
    pub const NOTIFY: &str = "notify.message";
}

/// One message on the bus: an endpoint name and an opaque payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub endpoint: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(endpoint: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload,
        }
    }

    /// Encode to the bencoded frame body.
    pub fn encode(&self) -> Vec<u8> {
        dict([
            (b"e".as_slice(), Value::bytes(self.endpoint.clone().into_bytes())),
            (b"p".as_slice(), Value::bytes(self.payload.clone())),
        ])
        .encode()
    }

    /// Decode from a frame body.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let value = haven_bencode::decode(data)
            .map_err(|e| TransportError::InvalidFrame(e.to_string()))?;
        let map = value
            .as_dict()
            .ok_or_else(|| TransportError::InvalidFrame("not a dict".into()))?;
        let endpoint = map
            .get(b"e".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| TransportError::InvalidFrame("missing endpoint".into()))?
            .to_string();
        let payload = map
            .get(b"p".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| TransportError::InvalidFrame("missing payload".into()))?
            .to_vec();
        Ok(Self { endpoint, payload })
    }
}
