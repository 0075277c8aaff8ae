//! The request router.
//!
//! One [`RequestHandler`] serves every inbound path: the legacy HTTP
//! surface, direct peer-bus client requests (`storage.*`), forwarded
//! requests from swarm members, and terminal onion dispatches. Each
//! request runs the same pipeline: decode → wrong-swarm check →
//! method-specific validation → store execution → subscriber notification
//! → best-effort replication.
//!
//! Replication and oracle access go through seam traits so this crate
//! stays independent of the transport; the daemon provides both.

use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use base64::engine::general_purpose::{STANDARD as BASE64, STANDARD_NO_PAD as BASE64_NOPAD};
use base64::Engine as _;
use serde_json::json;
use tracing::warn;

use haven_bencode::Value as Bt;
use haven_store::{DuplicateHandling, MessageStore, StoreOutcome};
use haven_swarm::SwarmMap;
use haven_types::account::Network;
use haven_types::{
    message::compute_hash, time::now_ms, time::now_secs, AccountId, Message, TIMESTAMP_SKEW_MS,
};

use crate::monitor::{self, MonitorMap, PushSink};
use crate::params::{self, parse};
use crate::ratelimit::RateLimiter;
use crate::stats::{AccessKeys, LogBuffer};
use crate::{Result, RpcError};

/// Which encoding the caller spoke; the response mirrors it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    Json,
    Bencode,
}

/// Per-request context supplied by the inbound adapter.
pub struct RequestContext {
    pub encoding: Encoding,
    /// Client IP for rate limiting; absent on the authenticated bus.
    pub remote_ip: Option<IpAddr>,
    /// Authenticated peer identity when the request came over the bus.
    pub authed_peer: Option<[u8; 32]>,
    /// True when a swarm member already forwarded this request once.
    pub forwarded: bool,
}

impl RequestContext {
    pub fn client(encoding: Encoding, remote_ip: Option<IpAddr>) -> Self {
        Self {
            encoding,
            remote_ip,
            authed_peer: None,
            forwarded: false,
        }
    }
}

/// Fan-out seam: fire-and-forget delivery to every co-swarm peer.
pub trait Replicator: Send + Sync {
    fn relay(&self, endpoint: String, payload: Vec<u8>);
}

/// Chain-daemon seam for `oxend_request` proxying.
pub trait OracleGateway: Send + Sync {
    fn forward(
        &self,
        endpoint: String,
        params: serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = Result<serde_json::Value>> + Send + '_>>;
}

/// Everything the handler needs, wired up by the daemon.
pub struct HandlerParts {
    pub network: Network,
    pub store: Arc<MessageStore>,
    pub swarm: Arc<SwarmMap>,
    pub monitors: Arc<MonitorMap>,
    pub replicator: Arc<dyn Replicator>,
    pub oracle: Arc<dyn OracleGateway>,
    pub access: AccessKeys,
    pub logs: Arc<LogBuffer>,
}

/// The shared request router.
pub struct RequestHandler {
    network: Network,
    store: Arc<MessageStore>,
    swarm: Arc<SwarmMap>,
    monitors: Arc<MonitorMap>,
    limiter: RateLimiter,
    replicator: Arc<dyn Replicator>,
    oracle: Arc<dyn OracleGateway>,
    access: AccessKeys,
    logs: Arc<LogBuffer>,
    started: Instant,
}

impl RequestHandler {
    pub fn new(parts: HandlerParts) -> Self {
        Self {
            network: parts.network,
            store: parts.store,
            swarm: parts.swarm,
            monitors: parts.monitors,
            limiter: RateLimiter::new(),
            replicator: parts.replicator,
            oracle: parts.oracle,
            access: parts.access,
            logs: parts.logs,
            started: Instant::now(),
        }
    }

    pub fn monitors(&self) -> &MonitorMap {
        &self.monitors
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Route one decoded request.
    pub async fn handle(
        &self,
        method: &str,
        body: &serde_json::Value,
        ctx: &RequestContext,
    ) -> Result<serde_json::Value> {
        if ctx.authed_peer.is_none() {
            if let Some(ip) = ctx.remote_ip {
                if !self.limiter.allow_ip(ip) {
                    return Err(RpcError::RateLimited);
                }
            }
        }

        match method {
            "store" => self.handle_store(body, ctx),
            "retrieve" => self.handle_retrieve(body, ctx),
            "delete" => self.handle_delete(body, ctx),
            "delete_all" => self.handle_delete_all(body, ctx),
            "delete_before" => self.handle_delete_before(body, ctx),
            "expire" => self.handle_expire(body, ctx),
            "get_expiries" => self.handle_get_expiries(body, ctx),
            "info" => self.handle_info(),
            "oxend_request" => self.handle_oxend(body).await,
            "get_stats" => self.handle_get_stats(ctx),
            "get_logs" => self.handle_get_logs(ctx),
            other => Err(RpcError::NotFound(format!("unknown method: {other}"))),
        }
    }

    // -- store -------------------------------------------------------------

    fn handle_store(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::StoreParams = parse(body)?;
        let account = self.parse_account(&p.pubkey)?;
        self.check_account_limit(&account, ctx)?;
        self.check_swarm(&account, ctx)?;
        check_skew(p.timestamp)?;

        let data = decode_base64("data", &p.data)?;
        let ttl_ms = p.ttl_ms()?;

        if !ctx.forwarded {
            let nonce = p
                .nonce
                .as_deref()
                .ok_or_else(|| RpcError::BadRequest("missing PoW nonce".into()))?;
            let valid = haven_pow::validate(
                nonce,
                &p.timestamp.to_string(),
                ttl_ms / 1000,
                &p.pubkey,
                &data,
            );
            if !valid {
                return Err(RpcError::PowFailed);
            }
        }

        let msg = Message::new(account, p.namespace, data, p.timestamp, ttl_ms)
            .map_err(|e| RpcError::BadRequest(e.to_string()))?;

        let outcome = self.store.store(&msg, DuplicateHandling::Fail)?;
        debug_assert_eq!(outcome, StoreOutcome::Stored);

        self.monitors.notify(&msg);
        if !ctx.forwarded {
            self.replicator
                .relay(REPLICATE_ENDPOINT.into(), replicate_payload(&msg));
        }
        Ok(json!({ "hash": msg.hash }))
    }

    // -- retrieve ----------------------------------------------------------

    fn handle_retrieve(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::RetrieveParams = parse(body)?;
        let account = self.parse_account(&p.pubkey)?;
        self.check_account_limit(&account, ctx)?;
        self.check_swarm(&account, ctx)?;

        let messages =
            self.store
                .retrieve(&account, p.namespace, p.last_hash.as_deref(), p.max_count)?;
        let rendered: Vec<serde_json::Value> = messages
            .iter()
            .map(|m| {
                json!({
                    "hash": m.hash,
                    "timestamp": m.timestamp_ms,
                    "expiry": m.expiry_ms,
                    "data": BASE64.encode(&m.data),
                })
            })
            .collect();
        Ok(json!({ "messages": rendered }))
    }

    // -- signed mutations --------------------------------------------------

    fn handle_delete(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::DeleteParams = parse(body)?;
        let account = self.parse_account(&p.signed.pubkey)?;
        self.check_swarm(&account, ctx)?;
        check_skew(p.timestamp)?;
        crate::auth::verify_signed(
            &account,
            &p.signed,
            &crate::auth::delete_payload(p.timestamp, &p.messages),
        )?;

        let deleted = self.store.delete_by_hashes(&account, &p.messages)?;
        self.relay_mutation("delete", body, ctx);
        Ok(json!({ "deleted": deleted }))
    }

    fn handle_delete_all(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::DeleteAllParams = parse(body)?;
        let account = self.parse_account(&p.signed.pubkey)?;
        self.check_swarm(&account, ctx)?;
        check_skew(p.timestamp)?;
        crate::auth::verify_signed(
            &account,
            &p.signed,
            &crate::auth::delete_all_payload(p.namespace, p.timestamp),
        )?;

        let deleted = self.store.delete_all(&account, p.namespace)?;
        self.relay_mutation("delete_all", body, ctx);
        Ok(json!({ "deleted": deleted }))
    }

    fn handle_delete_before(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::DeleteBeforeParams = parse(body)?;
        let account = self.parse_account(&p.signed.pubkey)?;
        self.check_swarm(&account, ctx)?;
        crate::auth::verify_signed(
            &account,
            &p.signed,
            &crate::auth::delete_before_payload(p.namespace, p.before),
        )?;

        let deleted = self.store.delete_before(&account, p.namespace, p.before)?;
        self.relay_mutation("delete_before", body, ctx);
        Ok(json!({ "deleted": deleted }))
    }

    fn handle_expire(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::ExpireParams = parse(body)?;
        let account = self.parse_account(&p.signed.pubkey)?;
        self.check_swarm(&account, ctx)?;
        crate::auth::verify_signed(
            &account,
            &p.signed,
            &crate::auth::expire_payload(p.expiry, &p.messages),
        )?;

        let updated = self
            .store
            .update_expiry(&account, &p.messages, p.expiry, p.extend)?;
        self.relay_mutation("expire", body, ctx);
        let rendered: serde_json::Map<String, serde_json::Value> = updated
            .into_iter()
            .map(|(hash, expiry)| (hash, json!(expiry)))
            .collect();
        Ok(json!({ "updated": rendered }))
    }

    fn handle_get_expiries(&self, body: &serde_json::Value, ctx: &RequestContext) -> Result<serde_json::Value> {
        let p: params::GetExpiriesParams = parse(body)?;
        let account = self.parse_account(&p.pubkey)?;
        self.check_swarm(&account, ctx)?;
        let expiries = self.store.get_expiries(&account, &p.messages)?;
        let rendered: serde_json::Map<String, serde_json::Value> = expiries
            .into_iter()
            .map(|(hash, expiry)| (hash, json!(expiry)))
            .collect();
        Ok(json!({ "expiries": rendered }))
    }

    // -- diagnostics -------------------------------------------------------

    fn handle_info(&self) -> Result<serde_json::Value> {
        let mut info = json!({
            "version": env!("CARGO_PKG_VERSION"),
            "timestamp": now_ms(),
            "uptime": self.started.elapsed().as_secs(),
        });
        if let Ok(swarm_id) = self.swarm.local_swarm() {
            info["swarm_id"] = json!(swarm_id);
        }
        Ok(info)
    }

    async fn handle_oxend(&self, body: &serde_json::Value) -> Result<serde_json::Value> {
        let p: params::OxendRequestParams = parse(body)?;
        self.oracle.forward(p.endpoint, p.params).await
    }

    fn handle_get_stats(&self, ctx: &RequestContext) -> Result<serde_json::Value> {
        if !self.access.allows(ctx.authed_peer.as_ref()) {
            return Err(RpcError::Forbidden);
        }
        Ok(json!({
            "version": env!("CARGO_PKG_VERSION"),
            "uptime": self.started.elapsed().as_secs(),
            "message_count": self.store.count().map_err(RpcError::from)?,
            "used_pages": self.store.used_pages().map_err(RpcError::from)?,
            "subscriptions": self.monitors.subscription_count(),
        }))
    }

    fn handle_get_logs(&self, ctx: &RequestContext) -> Result<serde_json::Value> {
        if !self.access.allows(ctx.authed_peer.as_ref()) {
            return Err(RpcError::Forbidden);
        }
        Ok(json!({ "logs": self.logs.snapshot() }))
    }

    // -- monitor.messages --------------------------------------------------

    /// Handle a `monitor.messages` subscription request. The body is raw
    /// bencode: a dict or a list of dicts; the reply mirrors the shape.
    pub fn handle_monitor(&self, body: &[u8], sink: Arc<dyn PushSink>) -> Vec<u8> {
        let Ok(value) = haven_bencode::decode(body) else {
            return monitor::MonitorError::BadArgs.reply().encode();
        };
        match value {
            Bt::Dict(_) => self.subscribe_one(&value, &sink).encode(),
            Bt::List(items) => {
                let replies: Vec<Bt> = items
                    .iter()
                    .map(|item| self.subscribe_one(item, &sink))
                    .collect();
                Bt::List(replies).encode()
            }
            _ => monitor::MonitorError::BadArgs.reply().encode(),
        }
    }

    fn subscribe_one(&self, value: &Bt, sink: &Arc<dyn PushSink>) -> Bt {
        let sub = match monitor::parse_subscription(value, self.network, now_secs()) {
            Ok(sub) => sub,
            Err(e) => return e.reply(),
        };
        match self.account_is_ours(&sub.account) {
            Ok(true) => {}
            Ok(false) | Err(_) => return monitor::MonitorError::WrongSwarm.reply(),
        }
        self.monitors
            .register(&sub.account, sub.namespaces, sub.want_data, sink.clone());
        monitor::success_reply()
    }

    // -- replication inbound -----------------------------------------------

    /// Ingest a replication push from a co-swarm peer. Duplicate hashes
    /// coalesce silently; fresh messages notify subscribers.
    pub fn ingest_replica(&self, payload: &[u8]) -> Result<()> {
        let msg = parse_replicate(payload, self.network)?;
        match self.store.store(&msg, DuplicateHandling::Ignore)? {
            StoreOutcome::Stored => {
                self.monitors.notify(&msg);
                Ok(())
            }
            StoreOutcome::Duplicate => Ok(()),
        }
    }

    // -- shared checks -----------------------------------------------------

    fn parse_account(&self, pubkey_hex: &str) -> Result<AccountId> {
        AccountId::from_hex(pubkey_hex, self.network)
            .map_err(|e| RpcError::BadRequest(e.to_string()))
    }

    fn check_account_limit(&self, account: &AccountId, ctx: &RequestContext) -> Result<()> {
        if ctx.authed_peer.is_none() && !self.limiter.allow_account(account.as_bytes()) {
            return Err(RpcError::RateLimited);
        }
        Ok(())
    }

    fn account_is_ours(&self, account: &AccountId) -> Result<bool> {
        let view = self.swarm.view();
        if view.swarm_count() == 0 {
            return Err(RpcError::UpstreamUnavailable("swarm data not available".into()));
        }
        let local = self
            .swarm
            .local_swarm()
            .map_err(|e| RpcError::UpstreamUnavailable(e.to_string()))?;
        let target = view
            .swarm_of(account)
            .map_err(|e| RpcError::UpstreamUnavailable(e.to_string()))?;
        Ok(target == local)
    }

    /// The wrong-swarm gate: redirect with the owning swarm's peer list,
    /// or a hard error when the request was already forwarded once.
    fn check_swarm(&self, account: &AccountId, ctx: &RequestContext) -> Result<()> {
        if self.account_is_ours(account)? {
            return Ok(());
        }
        if ctx.forwarded {
            return Err(RpcError::Internal(
                "forwarded request does not belong to this swarm".into(),
            ));
        }
        let view = self.swarm.view();
        let target = view
            .swarm_of(account)
            .map_err(|e| RpcError::UpstreamUnavailable(e.to_string()))?;
        let peers: Vec<serde_json::Value> = view
            .peers_of(target)
            .map(|peers| {
                peers
                    .iter()
                    .map(|p| {
                        json!({
                            "ip": p.address.ip().to_string(),
                            "port": p.address.port(),
                            "pubkey_ed25519": hex::encode(p.ed25519_pubkey),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Err(RpcError::WrongSwarm {
            peers: json!({ "swarm_id": target, "snodes": peers }),
        })
    }

    /// Best-effort forward of a mutation to co-swarm peers. Failures are
    /// the replicator's to log; the client reply never reflects them.
    fn relay_mutation(&self, method: &str, body: &serde_json::Value, ctx: &RequestContext) {
        if ctx.forwarded {
            return;
        }
        match serde_json::to_vec(body) {
            Ok(bytes) => self
                .replicator
                .relay(format!("{STORAGE_PREFIX}{method}"), bytes),
            Err(e) => warn!("mutation relay encoding failed: {e}"),
        }
    }
}

/// Endpoint for replication pushes.
pub const REPLICATE_ENDPOINT: &str = "sn.replicate";

/// Prefix for forwarded client requests on the bus.
pub const STORAGE_PREFIX: &str = "storage.";

fn check_skew(timestamp_ms: u64) -> Result<()> {
    let now = now_ms();
    let skew = now.abs_diff(timestamp_ms);
    if skew > TIMESTAMP_SKEW_MS {
        return Err(RpcError::BadRequest(format!(
            "timestamp {timestamp_ms} is outside the accepted clock skew"
        )));
    }
    Ok(())
}

fn decode_base64(field: &str, value: &str) -> Result<Vec<u8>> {
    BASE64
        .decode(value)
        .or_else(|_| BASE64_NOPAD.decode(value))
        .map_err(|_| RpcError::BadRequest(format!("{field}: invalid base64")))
}

/// Decode a raw request body in the caller's encoding into JSON.
pub fn decode_body(raw: &[u8], encoding: Encoding) -> Result<serde_json::Value> {
    match encoding {
        Encoding::Json => {
            if raw.is_empty() {
                return Ok(json!({}));
            }
            serde_json::from_slice(raw)
                .map_err(|e| RpcError::BadRequest(format!("invalid JSON body: {e}")))
        }
        Encoding::Bencode => {
            let value = haven_bencode::decode(raw)
                .map_err(|e| RpcError::BadRequest(format!("invalid bencoded body: {e}")))?;
            Ok(haven_bencode::to_json(&value))
        }
    }
}

/// Encode a reply in the caller's encoding.
pub fn encode_reply(value: &serde_json::Value, encoding: Encoding) -> Vec<u8> {
    match encoding {
        Encoding::Json => serde_json::to_vec(value).unwrap_or_default(),
        Encoding::Bencode => haven_bencode::from_json(value).encode(),
    }
}

/// Build the `sn.replicate` payload for a stored message.
pub fn replicate_payload(msg: &Message) -> Vec<u8> {
    haven_bencode::dict([
        (b"@".as_slice(), Bt::bytes(msg.account.as_bytes().to_vec())),
        (b"d".as_slice(), Bt::bytes(msg.data.clone())),
        (b"h".as_slice(), Bt::bytes(msg.hash.clone().into_bytes())),
        (b"n".as_slice(), Bt::Int(i64::from(msg.namespace))),
        (b"t".as_slice(), Bt::Int(msg.timestamp_ms as i64)),
        (b"z".as_slice(), Bt::Int(msg.expiry_ms as i64)),
    ])
    .encode()
}

/// Parse and verify a replication payload. The hash is recomputed from the
/// content; a mismatch means a corrupt or forged push and is rejected.
pub fn parse_replicate(payload: &[u8], network: Network) -> Result<Message> {
    let value = haven_bencode::decode(payload)
        .map_err(|e| RpcError::BadRequest(format!("invalid replica: {e}")))?;
    let map = value
        .as_dict()
        .ok_or_else(|| RpcError::BadRequest("replica is not a dict".into()))?;

    let get = |key: &[u8]| {
        map.get(key)
            .ok_or_else(|| RpcError::BadRequest(format!("replica missing {:?}", String::from_utf8_lossy(key))))
    };

    let account = AccountId::from_bytes(
        get(b"@")?.as_bytes().unwrap_or_default(),
        network,
    )
    .map_err(|e| RpcError::BadRequest(e.to_string()))?;
    let data = get(b"d")?
        .as_bytes()
        .ok_or_else(|| RpcError::BadRequest("replica data is not bytes".into()))?
        .to_vec();
    let hash = get(b"h")?
        .as_str()
        .ok_or_else(|| RpcError::BadRequest("replica hash is not a string".into()))?
        .to_string();
    let namespace = get(b"n")?
        .as_int()
        .and_then(|n| i16::try_from(n).ok())
        .ok_or_else(|| RpcError::BadRequest("replica namespace invalid".into()))?;
    let timestamp_ms = get(b"t")?
        .as_int()
        .and_then(|t| u64::try_from(t).ok())
        .ok_or_else(|| RpcError::BadRequest("replica timestamp invalid".into()))?;
    let expiry_ms = get(b"z")?
        .as_int()
        .and_then(|t| u64::try_from(t).ok())
        .ok_or_else(|| RpcError::BadRequest("replica expiry invalid".into()))?;

    let expected = compute_hash(&account, namespace, timestamp_ms, &data);
    if expected != hash {
        return Err(RpcError::BadRequest("replica hash mismatch".into()));
    }

    Ok(Message {
        hash,
        account,
        namespace,
        data,
        timestamp_ms,
        expiry_ms,
    })
}
