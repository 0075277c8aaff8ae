//! Peer bus dispatch: routes inbound bus events to the request handler,
//! the onion pipeline, and the subscription engine.
//!
//! Replies on the bus follow the convention: a successful request gets the
//! bare response body; a failure gets a bencoded (or JSON) list of
//! `[status, message]`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use haven_bencode::Value as Bt;
use haven_onion as onion;
use haven_rpc::handler::{decode_body, encode_reply, STORAGE_PREFIX};
use haven_rpc::{Encoding, PushSink, RequestContext, RpcError};
use haven_transport::wire::endpoints;
use haven_transport::{ConnHandle, Envelope, Event, Inbound};
use haven_types::time::now_ms;

use crate::NodeState;

/// Adapts a bus connection handle to the subscription engine's sink seam.
struct SinkAdapter(ConnHandle);

impl PushSink for SinkAdapter {
    fn conn_id(&self) -> u64 {
        self.0.id
    }

    fn push(&self, endpoint: &str, payload: Vec<u8>) -> bool {
        self.0.push(Envelope::new(endpoint, payload))
    }
}

/// Drain bus events until the bus shuts down.
pub async fn run(mut events: mpsc::UnboundedReceiver<Event>, node: Arc<NodeState>) {
    while let Some(event) = events.recv().await {
        match event {
            Event::Request(inbound) => {
                let node = node.clone();
                tokio::spawn(async move {
                    let reply = dispatch_request(&node, &inbound).await;
                    if let Some(tx) = inbound.reply {
                        let _ = tx.send(reply);
                    }
                });
            }
            Event::Notice(inbound) => {
                let node = node.clone();
                tokio::spawn(async move {
                    dispatch_notice(&node, inbound).await;
                });
            }
            Event::Disconnected(conn_id) => {
                node.handler.monitors().drop_connection(conn_id);
            }
        }
    }
}

async fn dispatch_request(node: &Arc<NodeState>, inbound: &Inbound) -> Vec<u8> {
    match inbound.endpoint.as_str() {
        endpoints::PING => ping_reply(node),
        endpoints::STORAGE_TEST => storage_test_reply(node, &inbound.payload),
        endpoints::ONION_REQ => process_onion(node, &inbound.payload).await,
        "monitor.messages" => {
            let sink: Arc<dyn PushSink> = Arc::new(SinkAdapter(inbound.conn.clone()));
            node.handler.handle_monitor(&inbound.payload, sink)
        }
        other => {
            if let Some(method) = other.strip_prefix(STORAGE_PREFIX) {
                client_request(node, method, inbound).await
            } else {
                debug!(endpoint = other, "unknown bus endpoint");
                error_reply(Encoding::Bencode, 404, "unknown endpoint")
            }
        }
    }
}

async fn dispatch_notice(node: &Arc<NodeState>, inbound: Inbound) {
    match inbound.endpoint.as_str() {
        endpoints::REPLICATE => {
            if let Err(e) = node.handler.ingest_replica(&inbound.payload) {
                warn!(
                    peer = %hex::encode(inbound.conn.peer),
                    "replica rejected: {e}"
                );
            }
        }
        other => {
            // Forwarded mutations may arrive as notices: apply, drop reply.
            if let Some(method) = other.strip_prefix(STORAGE_PREFIX) {
                let _ = client_request(node, method, &inbound).await;
            } else {
                debug!(endpoint = other, "unknown bus notice");
            }
        }
    }
}

/// A `storage.<method>` request over the bus: a client speaking directly,
/// or a swarm member forwarding. Forwarded requests are recognized by the
/// sender being a registered service node and are never re-forwarded.
async fn client_request(node: &Arc<NodeState>, method: &str, inbound: &Inbound) -> Vec<u8> {
    let encoding = if inbound.payload.first() == Some(&b'd') {
        Encoding::Bencode
    } else {
        Encoding::Json
    };
    let forwarded = node.swarm.view().find_peer(&inbound.conn.peer).is_some();
    let ctx = RequestContext {
        encoding,
        remote_ip: None,
        authed_peer: Some(inbound.conn.peer),
        forwarded,
    };

    let body = match decode_body(&inbound.payload, encoding) {
        Ok(body) => body,
        Err(e) => return error_reply(encoding, e.status(), &e.to_string()),
    };
    match node.handler.handle(method, &body, &ctx).await {
        Ok(value) => encode_reply(&value, encoding),
        Err(e) => error_reply(encoding, e.status(), &error_text(&e)),
    }
}

fn ping_reply(node: &Arc<NodeState>) -> Vec<u8> {
    haven_bencode::dict([
        (b"uptime".as_slice(), Bt::Int(node.started.elapsed().as_secs() as i64)),
        (
            b"version".as_slice(),
            Bt::bytes(env!("CARGO_PKG_VERSION").as_bytes().to_vec()),
        ),
    ])
    .encode()
}

/// `sn.storage_test`: prove custody of a previously stored blob.
fn storage_test_reply(node: &Arc<NodeState>, payload: &[u8]) -> Vec<u8> {
    let Ok(hash) = std::str::from_utf8(payload) else {
        return error_reply(Encoding::Bencode, 400, "hash is not utf-8");
    };
    match node.store.retrieve_by_hash(hash.trim()) {
        Ok(Some(msg)) => haven_bencode::dict([
            (b"data".as_slice(), Bt::bytes(msg.data)),
            (b"status".as_slice(), Bt::bytes(b"OK".to_vec())),
        ])
        .encode(),
        Ok(None) => error_reply(Encoding::Bencode, 404, "no such message"),
        Err(e) => error_reply(Encoding::Bencode, 500, &e.to_string()),
    }
}

/// Drive one onion hop: peel, then either relay outward or dispatch the
/// terminal request inward. Every reply, error or not, travels encrypted
/// under the hop secret; peel failures before a secret exists get a fixed
/// plaintext error.
async fn process_onion(node: &Arc<NodeState>, payload: &[u8]) -> Vec<u8> {
    let peeled = match onion::peel(payload, &node.onion_secret) {
        Ok(peeled) => peeled,
        Err(_) => return b"invalid onion request".to_vec(),
    };

    match peeled.step {
        onion::Step::Forward { next_hop, onion: inner } => {
            let view = node.swarm.view();
            let Some(peer) = view.find_peer(&next_hop).cloned() else {
                return peeled.secret.encrypt_error();
            };
            match node
                .bus
                .request(peer.ed25519_pubkey, peer.address, endpoints::ONION_REQ, inner)
                .await
            {
                Ok(reply) => peeled.secret.encrypt_reply(&reply),
                Err(e) => {
                    debug!("onion relay failed: {e}");
                    peeled.secret.encrypt_error()
                }
            }
        }
        onion::Step::Terminal(request) => {
            let encoding = if request.body.first() == Some(&b'd') {
                Encoding::Bencode
            } else {
                Encoding::Json
            };
            let ctx = RequestContext::client(encoding, None);
            let reply = match decode_body(&request.body, encoding) {
                Err(e) => error_reply(encoding, e.status(), &e.to_string()),
                Ok(body) => match node.handler.handle(&request.method, &body, &ctx).await {
                    Ok(value) => encode_reply(&value, encoding),
                    Err(e) => error_reply(encoding, e.status(), &error_text(&e)),
                },
            };
            peeled.secret.encrypt_reply(&reply)
        }
    }
}

/// `[status, message]` in the caller's encoding.
fn error_reply(encoding: Encoding, status: u16, message: &str) -> Vec<u8> {
    match encoding {
        Encoding::Bencode => Bt::List(vec![
            Bt::Int(i64::from(status)),
            Bt::bytes(message.as_bytes().to_vec()),
        ])
        .encode(),
        Encoding::Json => serde_json::to_vec(&serde_json::json!([status, message]))
            .unwrap_or_default(),
    }
}

/// Wire text for an error; wrong-swarm redirects embed the peer list.
fn error_text(e: &RpcError) -> String {
    match e {
        RpcError::WrongSwarm { peers } => {
            let mut body = peers.clone();
            body["t"] = serde_json::json!(now_ms());
            serde_json::to_string(&body).unwrap_or_else(|_| "wrong swarm".to_string())
        }
        other => other.to_string(),
    }
}
