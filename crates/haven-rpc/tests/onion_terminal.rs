//! End-to-end: a client builds a two-layer onion, the terminal node peels
//! it, dispatches the embedded request through the router, and the client
//! decrypts the reply through both layers.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use haven_crypto::ed25519::KeyPair;
use haven_crypto::x25519::{self, X25519SecretKey};
use haven_onion as onion;
use haven_rpc::handler::{decode_body, encode_reply, HandlerParts};
use haven_rpc::stats::{AccessKeys, LogBuffer};
use haven_rpc::{
    Encoding, MonitorMap, OracleGateway, Replicator, RequestContext, RequestHandler, RpcError,
};
use haven_store::MessageStore;
use haven_swarm::{OracleSnapshot, PeerRecord, SwarmMap};
use haven_types::account::Network;
use haven_types::time::now_ms;
use haven_types::{AccountId, DB_SIZE_LIMIT};

struct NullReplicator;
impl Replicator for NullReplicator {
    fn relay(&self, _endpoint: String, _payload: Vec<u8>) {}
}

struct NullOracle;
impl OracleGateway for NullOracle {
    fn forward(
        &self,
        _endpoint: String,
        _params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value, RpcError>> + Send + '_>> {
        Box::pin(async { Err(RpcError::UpstreamUnavailable("test".into())) })
    }
}

fn handler_owning_everything() -> (RequestHandler, AccountId, KeyPair) {
    let account_kp = KeyPair::generate();
    let x = x25519::ed25519_pubkey_to_x25519(&account_kp.verifying_key.to_bytes())
        .expect("convert");
    let account = AccountId::from_x25519(x);

    let local = [9u8; 32];
    let swarm = Arc::new(SwarmMap::new(local));
    swarm.update(&OracleSnapshot {
        height: 1,
        nodes: vec![PeerRecord {
            ed25519_pubkey: local,
            x25519_pubkey: [1; 32],
            address: "127.0.0.1:22021".parse().expect("addr"),
            swarm_id: 0,
        }],
    });

    let handler = RequestHandler::new(HandlerParts {
        network: Network::Mainnet,
        store: Arc::new(MessageStore::open_in_memory(DB_SIZE_LIMIT).expect("store")),
        swarm,
        monitors: Arc::new(MonitorMap::new()),
        replicator: Arc::new(NullReplicator),
        oracle: Arc::new(NullOracle),
        access: AccessKeys::new([]),
        logs: Arc::new(LogBuffer::default()),
    });
    (handler, account, account_kp)
}

/// The daemon's terminal-dispatch step, reproduced for the test: peel one
/// layer, run the embedded request, encrypt the reply back.
async fn terminal_node(
    handler: &RequestHandler,
    node_secret: &X25519SecretKey,
    frame: &[u8],
) -> Vec<u8> {
    let peeled = onion::peel(frame, node_secret).expect("peel");
    let onion::Step::Terminal(request) = peeled.step else {
        panic!("expected a terminal step");
    };
    let ctx = RequestContext::client(Encoding::Json, None);
    let body = decode_body(&request.body, Encoding::Json).expect("body");
    let reply = match handler.handle(&request.method, &body, &ctx).await {
        Ok(value) => encode_reply(&value, Encoding::Json),
        Err(e) => format!("[{},{:?}]", e.status(), e.to_string()).into_bytes(),
    };
    peeled.secret.encrypt_reply(&reply)
}

#[tokio::test]
async fn store_through_two_onion_layers() {
    let (handler, account, _kp) = handler_owning_everything();
    let node_secret = X25519SecretKey::generate();
    let relay_secret = X25519SecretKey::generate();

    // Innermost: the terminal request (a store, peer-originated so the PoW
    // gate is represented by the forwarded path in the daemon; here the
    // nonce is solved at difficulty via the forwarded-free store body).
    let ts = now_ms();
    let body = json!({
        "pubkey": account.to_hex(),
        "timestamp": ts,
        "ttl": 60_000u64,
        "namespace": 0,
        "data": BASE64.encode(b"onion mail"),
        "nonce": solve_nonce(&account.to_hex(), ts, b"onion mail"),
    });
    let request = onion::TerminalRequest {
        method: "store".into(),
        headers: BTreeMap::new(),
        body: body.to_string().into_bytes(),
    };

    // Layer 1: addressed to the terminal node.
    let (inner_frame, inner_keys) = onion::seal_layer(
        onion::VERSION_CHACHA,
        &node_secret.public_key(),
        &onion::terminal_header(&request),
    )
    .expect("seal inner");

    // Layer 2: addressed to a relay, naming the terminal node as next hop.
    let (outer_frame, outer_keys) = onion::seal_layer(
        onion::VERSION_XCHACHA,
        &relay_secret.public_key(),
        &onion::relay_header([9u8; 32], &inner_frame),
    )
    .expect("seal outer");

    // Relay hop peels and yields the forwarding step.
    let peeled = onion::peel(&outer_frame, &relay_secret).expect("peel outer");
    let (next_hop, inner) = match peeled.step {
        onion::Step::Forward { next_hop, onion } => (next_hop, onion),
        other => panic!("expected forward, got {other:?}"),
    };
    assert_eq!(next_hop, [9u8; 32]);

    // Terminal hop executes the store and encrypts the reply.
    let terminal_reply = terminal_node(&handler, &node_secret, &inner).await;

    // The relay re-encrypts the reply under its own layer.
    let relayed = peeled.secret.encrypt_reply(&terminal_reply);

    // The client unwraps both layers, innermost last.
    let outer_plain = outer_keys.decrypt_reply(&relayed).expect("outer layer");
    let inner_plain = inner_keys.decrypt_reply(&outer_plain).expect("inner layer");
    let reply: serde_json::Value = serde_json::from_slice(&inner_plain).expect("json");
    let hash = reply["hash"].as_str().expect("hash");

    // The message really landed in the store.
    let ctx = RequestContext {
        encoding: Encoding::Json,
        remote_ip: None,
        authed_peer: Some([3; 32]),
        forwarded: false,
    };
    let fetched = handler
        .handle("retrieve", &json!({ "pubkey": account.to_hex() }), &ctx)
        .await
        .expect("retrieve");
    assert_eq!(fetched["messages"][0]["hash"], hash);
    assert_eq!(fetched["messages"][0]["data"], BASE64.encode(b"onion mail"));
}

/// Brute-force a nonce acceptable at the network difficulty. The target
/// here is easy because the TTL is short and the payload tiny.
fn solve_nonce(recipient: &str, timestamp: u64, payload: &[u8]) -> String {
    let ts = timestamp.to_string();
    for counter in 0u64..20_000_000 {
        let nonce = BASE64.encode(counter.to_be_bytes());
        if haven_pow::validate(&nonce, &ts, 60, recipient, payload) {
            return nonce;
        }
    }
    panic!("no nonce found");
}
