//! The peer message bus.
//!
//! One [`PeerBus`] per node. Inbound traffic is surfaced as [`Event`]s on a
//! channel the daemon drains; outbound traffic goes through
//! [`PeerBus::request`] (bidirectional stream, one reply, 30 s deadline)
//! and [`PeerBus::send`] (unidirectional, fire-and-forget). Connections a
//! node dials are cached by peer identity and reused.
//!
//! ## Identity exchange
//!
//! The first bidirectional stream on every connection carries the hello:
//! a bencoded dict `{"p": ed25519_pub, "s": signature}` where the
//! signature covers `"haven-hello" || ekm` and `ekm` is 32 bytes of TLS
//! exported keying material. Both sides derive the same `ekm`, so a valid
//! signature binds the Ed25519 identity to this exact TLS session and
//! cannot be replayed across connections.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use quinn::Connection;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use haven_bencode::{dict, Value};
use haven_crypto::ed25519::{KeyPair, Signature, VerifyingKey};

use crate::quic::{read_frame, write_frame, QuicNode};
use crate::wire::Envelope;
use crate::{Result, TransportError};

/// A peer's long-term Ed25519 identity.
pub type PeerPubkey = [u8; 32];

/// Per-request reply deadline.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const HELLO_CONTEXT: &[u8] = b"haven-hello";
const EKM_LABEL: &[u8] = b"haven-peer-auth";

/// Handle to one authenticated connection; push frames sent here are
/// written to the peer as send-form envelopes.
#[derive(Clone, Debug)]
pub struct ConnHandle {
    pub id: u64,
    pub peer: PeerPubkey,
    push: mpsc::UnboundedSender<Envelope>,
}

impl ConnHandle {
    /// Queue a push frame; returns false once the connection is gone.
    pub fn push(&self, envelope: Envelope) -> bool {
        self.push.send(envelope).is_ok()
    }
}

impl PartialEq for ConnHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for ConnHandle {}

/// An inbound message together with its authenticated origin.
#[derive(Debug)]
pub struct Inbound {
    pub conn: ConnHandle,
    pub endpoint: String,
    pub payload: Vec<u8>,
    /// Present on request-form messages; dropping it without sending makes
    /// the peer's request fail with [`TransportError::NoReply`].
    pub reply: Option<oneshot::Sender<Vec<u8>>>,
}

/// Bus events delivered to the daemon's dispatch loop.
#[derive(Debug)]
pub enum Event {
    /// A request-form message expecting a reply.
    Request(Inbound),
    /// A send-form message.
    Notice(Inbound),
    /// The identified connection closed; subscriptions tied to it are dead.
    Disconnected(u64),
}

/// State shared between the bus front end and its connection tasks.
struct Shared {
    identity: KeyPair,
    events: mpsc::UnboundedSender<Event>,
    next_conn_id: AtomicU64,
}

/// The peer bus.
pub struct PeerBus {
    node: Arc<QuicNode>,
    shared: Arc<Shared>,
    outbound: Mutex<HashMap<PeerPubkey, Connection>>,
}

impl PeerBus {
    /// Bind the bus and start accepting connections. Returns the bus and
    /// the event stream the caller must drain.
    pub fn start(
        bind_addr: SocketAddr,
        identity: KeyPair,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<Event>)> {
        let node = Arc::new(QuicNode::bind(bind_addr)?);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            identity,
            events: events_tx,
            next_conn_id: AtomicU64::new(1),
        });
        let bus = Arc::new(Self {
            node: node.clone(),
            shared: shared.clone(),
            outbound: Mutex::new(HashMap::new()),
        });

        tokio::spawn(async move {
            while let Some(incoming) = node.accept().await {
                let shared = shared.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_incoming(shared, incoming).await {
                        debug!("inbound connection ended: {e}");
                    }
                });
            }
        });

        Ok((bus, events_rx))
    }

    /// Address the bus is reachable at (useful with an ephemeral bind port).
    pub fn local_addr(&self) -> SocketAddr {
        self.node.local_addr()
    }

    /// This node's identity key.
    pub fn identity(&self) -> &VerifyingKey {
        &self.shared.identity.verifying_key
    }

    /// Request-form call: send an envelope, await one reply.
    pub async fn request(
        &self,
        peer: PeerPubkey,
        addr: SocketAddr,
        endpoint: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let fut = self.request_inner(peer, addr, endpoint, payload);
        tokio::time::timeout(REQUEST_TIMEOUT, fut)
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    async fn request_inner(
        &self,
        peer: PeerPubkey,
        addr: SocketAddr,
        endpoint: &str,
        payload: Vec<u8>,
    ) -> Result<Vec<u8>> {
        let conn = self.authenticated_conn(peer, addr).await?;
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        write_frame(&mut send, &Envelope::new(endpoint, payload).encode()).await?;
        send.finish().ok();
        match read_frame(&mut recv).await {
            Ok(reply) => Ok(reply),
            Err(TransportError::Io(_)) => Err(TransportError::NoReply),
            Err(e) => Err(e),
        }
    }

    /// Send-form call: fire-and-forget on a unidirectional stream.
    pub async fn send(
        &self,
        peer: PeerPubkey,
        addr: SocketAddr,
        endpoint: &str,
        payload: Vec<u8>,
    ) -> Result<()> {
        let conn = self.authenticated_conn(peer, addr).await?;
        let mut stream = conn
            .open_uni()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        write_frame(&mut stream, &Envelope::new(endpoint, payload).encode()).await?;
        stream.finish().ok();
        Ok(())
    }

    /// Get the cached authenticated connection to `peer`, dialing if needed.
    async fn authenticated_conn(&self, peer: PeerPubkey, addr: SocketAddr) -> Result<Connection> {
        let mut cache = self.outbound.lock().await;
        if let Some(conn) = cache.get(&peer) {
            if conn.close_reason().is_none() {
                return Ok(conn.clone());
            }
            cache.remove(&peer);
        }

        let conn = self.node.connect(addr).await?;

        // Hello exchange: the dialer speaks first, then verifies the
        // responder against the identity it expected to reach.
        let (mut send, mut recv) = conn
            .open_bi()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        write_frame(&mut send, &make_hello(&conn, &self.shared.identity)?).await?;
        send.finish().ok();
        let their_hello = read_frame(&mut recv).await?;
        let their_key = verify_hello(&conn, &their_hello)?;
        if their_key != peer {
            return Err(TransportError::Auth(format!(
                "peer identity mismatch: expected {}, got {}",
                hex::encode(peer),
                hex::encode(their_key)
            )));
        }

        // Serve the outbound connection too: the peer may push frames or
        // open request streams back to us over it.
        tokio::spawn(serve_connection(self.shared.clone(), conn.clone(), peer));

        cache.insert(peer, conn.clone());
        Ok(conn)
    }
}

async fn handle_incoming(shared: Arc<Shared>, incoming: quinn::Incoming) -> Result<()> {
    let conn = incoming
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;

    // First bi stream must be the hello.
    let (mut send, mut recv) = conn
        .accept_bi()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let their_hello = read_frame(&mut recv).await?;
    let peer = verify_hello(&conn, &their_hello)?;
    write_frame(&mut send, &make_hello(&conn, &shared.identity)?).await?;
    send.finish().ok();

    serve_connection(shared, conn, peer).await;
    Ok(())
}

/// Serve one authenticated connection until it closes: demultiplex request
/// and notice streams inward, write queued push frames outward.
async fn serve_connection(shared: Arc<Shared>, conn: Connection, peer: PeerPubkey) {
    let id = shared.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let (push_tx, mut push_rx) = mpsc::unbounded_channel::<Envelope>();
    let handle = ConnHandle {
        id,
        peer,
        push: push_tx,
    };
    debug!(conn = id, peer = %hex::encode(peer), "peer connection authenticated");

    loop {
        tokio::select! {
            stream = conn.accept_bi() => {
                let Ok((send, recv)) = stream else { break };
                let shared = shared.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_request(shared, handle, send, recv).await {
                        debug!("request stream failed: {e}");
                    }
                });
            }
            stream = conn.accept_uni() => {
                let Ok(recv) = stream else { break };
                let shared = shared.clone();
                let handle = handle.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_notice(shared, handle, recv).await {
                        debug!("notice stream failed: {e}");
                    }
                });
            }
            envelope = push_rx.recv() => {
                let Some(envelope) = envelope else { break };
                let mut stream = match conn.open_uni().await {
                    Ok(s) => s,
                    Err(e) => {
                        warn!("push stream failed: {e}");
                        break;
                    }
                };
                if write_frame(&mut stream, &envelope.encode()).await.is_err() {
                    break;
                }
                stream.finish().ok();
            }
        }
    }

    let _ = shared.events.send(Event::Disconnected(id));
}

async fn serve_request(
    shared: Arc<Shared>,
    handle: ConnHandle,
    mut send: quinn::SendStream,
    mut recv: quinn::RecvStream,
) -> Result<()> {
    let envelope = Envelope::decode(&read_frame(&mut recv).await?)?;
    let (reply_tx, reply_rx) = oneshot::channel();
    let _ = shared.events.send(Event::Request(Inbound {
        conn: handle,
        endpoint: envelope.endpoint,
        payload: envelope.payload,
        reply: Some(reply_tx),
    }));
    // If the dispatcher drops the reply sender the stream just closes and
    // the peer observes NoReply.
    if let Ok(Ok(reply)) = tokio::time::timeout(REQUEST_TIMEOUT, reply_rx).await {
        write_frame(&mut send, &reply).await?;
        send.finish().ok();
    }
    Ok(())
}

async fn serve_notice(
    shared: Arc<Shared>,
    handle: ConnHandle,
    mut recv: quinn::RecvStream,
) -> Result<()> {
    let envelope = Envelope::decode(&read_frame(&mut recv).await?)?;
    let _ = shared.events.send(Event::Notice(Inbound {
        conn: handle,
        endpoint: envelope.endpoint,
        payload: envelope.payload,
        reply: None,
    }));
    Ok(())
}

fn keying_material(conn: &Connection) -> Result<[u8; 32]> {
    let mut ekm = [0u8; 32];
    conn.export_keying_material(&mut ekm, EKM_LABEL, b"")
        .map_err(|_| TransportError::Auth("keying material unavailable".into()))?;
    Ok(ekm)
}

fn make_hello(conn: &Connection, identity: &KeyPair) -> Result<Vec<u8>> {
    let ekm = keying_material(conn)?;
    let mut signed = Vec::with_capacity(HELLO_CONTEXT.len() + ekm.len());
    signed.extend_from_slice(HELLO_CONTEXT);
    signed.extend_from_slice(&ekm);
    let sig = identity.signing_key.sign(&signed);
    Ok(dict([
        (b"p".as_slice(), Value::bytes(identity.verifying_key.to_bytes().to_vec())),
        (b"s".as_slice(), Value::bytes(sig.to_bytes().to_vec())),
    ])
    .encode())
}

fn verify_hello(conn: &Connection, frame: &[u8]) -> Result<PeerPubkey> {
    let value =
        haven_bencode::decode(frame).map_err(|e| TransportError::Auth(e.to_string()))?;
    let map = value
        .as_dict()
        .ok_or_else(|| TransportError::Auth("hello is not a dict".into()))?;
    let pubkey: [u8; 32] = map
        .get(b"p".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| TransportError::Auth("missing pubkey".into()))?;
    let sig_bytes = map
        .get(b"s".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or_else(|| TransportError::Auth("missing signature".into()))?;

    let key = VerifyingKey::from_bytes(&pubkey)
        .map_err(|e| TransportError::Auth(e.to_string()))?;
    let sig = Signature::from_slice(sig_bytes).map_err(|e| TransportError::Auth(e.to_string()))?;

    let ekm = keying_material(conn)?;
    let mut signed = Vec::with_capacity(HELLO_CONTEXT.len() + ekm.len());
    signed.extend_from_slice(HELLO_CONTEXT);
    signed.extend_from_slice(&ekm);
    key.verify(&signed, &sig)
        .map_err(|_| TransportError::Auth("bad hello signature".into()))?;
    Ok(pubkey)
}
