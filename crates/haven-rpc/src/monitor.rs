//! The push-subscription engine (`monitor.messages`).
//!
//! Subscriptions are held per account behind a readers-writer lock: the
//! notify path (every store) takes the read side, registration and the
//! sweep take the write side. Notification snapshots the matching
//! `(sink, frame)` pairs under the lock and performs the sends after
//! releasing it, so a slow connection never blocks registration. A failed
//! send evicts the subscription; the bus additionally reports closed
//! connections, which drop every subscription tied to them.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::debug;

use haven_bencode::{dict, Value};
use haven_crypto::ed25519::{Signature, VerifyingKey};
use haven_crypto::{subkey, x25519};
use haven_types::account::Network;
use haven_types::{AccountId, Message, NamespaceId, MONITOR_EXPIRY_SECS};

use crate::auth::monitor_payload;

/// Push frames go out through this seam; the daemon adapts a bus
/// connection handle to it.
pub trait PushSink: Send + Sync {
    /// Stable id of the underlying connection.
    fn conn_id(&self) -> u64;
    /// Queue a frame; false means the connection is gone.
    fn push(&self, endpoint: &str, payload: Vec<u8>) -> bool;
}

/// Endpoint name of push frames.
pub const NOTIFY_ENDPOINT: &str = "notify.message";

/// Maximum age of a subscription signature timestamp (14 days).
const MAX_TIMESTAMP_AGE_SECS: u64 = 14 * 24 * 60 * 60;

/// Maximum future skew of a subscription signature timestamp (1 day).
const MAX_TIMESTAMP_AHEAD_SECS: u64 = 24 * 60 * 60;

/// A live registration.
struct Subscription {
    namespaces: Vec<NamespaceId>,
    want_data: bool,
    sink: Arc<dyn PushSink>,
    expires_at: Instant,
}

/// Account → subscriptions.
pub struct MonitorMap {
    inner: RwLock<HashMap<Vec<u8>, Vec<Subscription>>>,
}

impl MonitorMap {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Register (or refresh) a subscription for `account`.
    pub fn register(
        &self,
        account: &AccountId,
        namespaces: Vec<NamespaceId>,
        want_data: bool,
        sink: Arc<dyn PushSink>,
    ) {
        let expires_at = Instant::now() + Duration::from_secs(MONITOR_EXPIRY_SECS);
        let mut map = self.write();
        let subs = map.entry(account.as_bytes().to_vec()).or_default();
        if let Some(existing) = subs.iter_mut().find(|s| {
            s.sink.conn_id() == sink.conn_id()
                && s.namespaces == namespaces
                && s.want_data == want_data
        }) {
            existing.expires_at = expires_at;
            return;
        }
        subs.push(Subscription {
            namespaces,
            want_data,
            sink,
            expires_at,
        });
    }

    /// Fan a stored message out to matching live subscriptions.
    pub fn notify(&self, msg: &Message) {
        let now = Instant::now();
        // Snapshot under the read lock, send after releasing it.
        let targets: Vec<(Arc<dyn PushSink>, Vec<u8>)> = {
            let map = self.read();
            let Some(subs) = map.get(msg.account.as_bytes()) else {
                return;
            };
            subs.iter()
                .filter(|s| s.expires_at > now && s.namespaces.binary_search(&msg.namespace).is_ok())
                .map(|s| (s.sink.clone(), notify_frame(msg, s.want_data)))
                .collect()
        };

        let mut dead = Vec::new();
        for (sink, frame) in targets {
            if !sink.push(NOTIFY_ENDPOINT, frame) {
                dead.push(sink.conn_id());
            }
        }
        if !dead.is_empty() {
            let mut map = self.write();
            if let Some(subs) = map.get_mut(msg.account.as_bytes()) {
                subs.retain(|s| !dead.contains(&s.sink.conn_id()));
            }
        }
    }

    /// Remove expired subscriptions; called from the cleanup tick.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut map = self.write();
        for subs in map.values_mut() {
            subs.retain(|s| s.expires_at > now);
        }
        map.retain(|_, subs| !subs.is_empty());
    }

    /// Drop every subscription tied to a closed connection.
    pub fn drop_connection(&self, conn_id: u64) {
        let mut map = self.write();
        let mut dropped = 0usize;
        for subs in map.values_mut() {
            let before = subs.len();
            subs.retain(|s| s.sink.conn_id() != conn_id);
            dropped += before - subs.len();
        }
        map.retain(|_, subs| !subs.is_empty());
        if dropped > 0 {
            debug!(conn_id, dropped, "subscriptions dropped with connection");
        }
    }

    /// Number of live subscriptions, for stats.
    pub fn subscription_count(&self) -> usize {
        self.read().values().map(Vec::len).sum()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<Vec<u8>, Vec<Subscription>>> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<Vec<u8>, Vec<Subscription>>> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for MonitorMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the bencoded `notify.message` frame body.
pub fn notify_frame(msg: &Message, want_data: bool) -> Vec<u8> {
    let mut pairs = vec![
        (b"@".to_vec(), Value::bytes(msg.account.as_bytes().to_vec())),
        (b"h".to_vec(), Value::bytes(msg.hash.clone().into_bytes())),
        (b"n".to_vec(), Value::Int(i64::from(msg.namespace))),
        (b"t".to_vec(), Value::Int(msg.timestamp_ms as i64)),
        (b"z".to_vec(), Value::Int(msg.expiry_ms as i64)),
    ];
    if want_data {
        pairs.push((b"~d".to_vec(), Value::bytes(msg.data.clone())));
    }
    Value::Dict(pairs.into_iter().collect()).encode()
}

// ---------------------------------------------------------------------------
// Subscription request validation
// ---------------------------------------------------------------------------

/// Failure codes of the `monitor.messages` reply, with their wire values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MonitorError {
    BadArgs = 1,
    BadPubkey = 2,
    BadNamespace = 3,
    BadTimestamp = 4,
    BadSignature = 5,
    WrongSwarm = 6,
}

impl MonitorError {
    pub fn errcode(self) -> i64 {
        self as i64
    }

    pub fn message(self) -> &'static str {
        match self {
            MonitorError::BadArgs => "invalid arguments",
            MonitorError::BadPubkey => "invalid pubkey",
            MonitorError::BadNamespace => "invalid namespace",
            MonitorError::BadTimestamp => "invalid timestamp",
            MonitorError::BadSignature => "signature failed",
            MonitorError::WrongSwarm => "wrong swarm",
        }
    }

    /// The bencoded failure reply dict.
    pub fn reply(self) -> Value {
        dict([
            (b"errcode".as_slice(), Value::Int(self.errcode())),
            (b"error".as_slice(), Value::bytes(self.message().as_bytes().to_vec())),
        ])
    }
}

/// The bencoded success reply dict.
pub fn success_reply() -> Value {
    dict([(b"success".as_slice(), Value::Int(1))])
}

/// A validated subscription request.
#[derive(Debug)]
pub struct SubscriptionRequest {
    pub account: AccountId,
    pub namespaces: Vec<NamespaceId>,
    pub want_data: bool,
}

/// Validate one subscription dict: key projection, namespace list shape,
/// timestamp window, and the Ed25519 (or subkey) signature.
pub fn parse_subscription(
    value: &Value,
    network: Network,
    now_secs: u64,
) -> std::result::Result<SubscriptionRequest, MonitorError> {
    let map = value.as_dict().ok_or(MonitorError::BadArgs)?;

    // Exactly one of `p` (full account) / `P` (bare ed25519 key).
    let (account, ed_key) = match (map.get(b"p".as_slice()), map.get(b"P".as_slice())) {
        (Some(p), None) => {
            let bytes = p.as_bytes().ok_or(MonitorError::BadArgs)?;
            let account =
                AccountId::from_bytes(bytes, network).map_err(|_| MonitorError::BadPubkey)?;
            let ed: [u8; 32] = account
                .key()
                .try_into()
                .map_err(|_| MonitorError::BadPubkey)?;
            (account, ed)
        }
        (None, Some(big_p)) => {
            let ed: [u8; 32] = big_p
                .as_bytes()
                .and_then(|b| b.try_into().ok())
                .ok_or(MonitorError::BadPubkey)?;
            let x = x25519::ed25519_pubkey_to_x25519(&ed).map_err(|_| MonitorError::BadPubkey)?;
            let account = match network {
                Network::Mainnet => AccountId::from_x25519(x),
                Network::Testnet => {
                    AccountId::from_bytes(&x, network).map_err(|_| MonitorError::BadPubkey)?
                }
            };
            (account, ed)
        }
        _ => return Err(MonitorError::BadArgs),
    };

    // Namespace list: nonempty, sorted, unique, already-valid i16 range by
    // construction of the decode.
    let ns_values = map
        .get(b"n".as_slice())
        .and_then(|v| v.as_list())
        .ok_or(MonitorError::BadArgs)?;
    if ns_values.is_empty() {
        return Err(MonitorError::BadNamespace);
    }
    let mut namespaces = Vec::with_capacity(ns_values.len());
    for v in ns_values {
        let n = v.as_int().ok_or(MonitorError::BadNamespace)?;
        let n = NamespaceId::try_from(n).map_err(|_| MonitorError::BadNamespace)?;
        if let Some(&last) = namespaces.last() {
            if n <= last {
                return Err(MonitorError::BadNamespace);
            }
        }
        namespaces.push(n);
    }

    let want_data = match map.get(b"d".as_slice()).map(|v| v.as_int()) {
        None => false,
        Some(Some(0)) => false,
        Some(Some(1)) => true,
        _ => return Err(MonitorError::BadArgs),
    };

    let timestamp = map
        .get(b"t".as_slice())
        .and_then(|v| v.as_int())
        .and_then(|t| u64::try_from(t).ok())
        .ok_or(MonitorError::BadTimestamp)?;
    if timestamp + MAX_TIMESTAMP_AGE_SECS < now_secs
        || timestamp > now_secs + MAX_TIMESTAMP_AHEAD_SECS
    {
        return Err(MonitorError::BadTimestamp);
    }

    let sig_bytes: [u8; 64] = map
        .get(b"s".as_slice())
        .and_then(|v| v.as_bytes())
        .and_then(|b| b.try_into().ok())
        .ok_or(MonitorError::BadArgs)?;

    let verifier = match map.get(b"S".as_slice()) {
        Some(tag) => {
            let tag: [u8; 32] = tag
                .as_bytes()
                .and_then(|b| b.try_into().ok())
                .ok_or(MonitorError::BadArgs)?;
            subkey::derive_signer(&tag, &ed_key).map_err(|_| MonitorError::BadSignature)?
        }
        None => VerifyingKey::from_bytes(&ed_key).map_err(|_| MonitorError::BadPubkey)?,
    };

    let payload = monitor_payload(&account.to_hex(), timestamp, want_data, &namespaces);
    verifier
        .verify(&payload, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| MonitorError::BadSignature)?;

    Ok(SubscriptionRequest {
        account,
        namespaces,
        want_data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use haven_crypto::ed25519::KeyPair;

    struct TestSink {
        id: u64,
        frames: Mutex<Vec<(String, Vec<u8>)>>,
        alive: std::sync::atomic::AtomicBool,
    }

    impl TestSink {
        fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                frames: Mutex::new(Vec::new()),
                alive: std::sync::atomic::AtomicBool::new(true),
            })
        }

        fn kill(&self) {
            self.alive.store(false, std::sync::atomic::Ordering::SeqCst);
        }

        fn frames(&self) -> Vec<(String, Vec<u8>)> {
            self.frames.lock().expect("lock").clone()
        }
    }

    impl PushSink for TestSink {
        fn conn_id(&self) -> u64 {
            self.id
        }
        fn push(&self, endpoint: &str, payload: Vec<u8>) -> bool {
            if !self.alive.load(std::sync::atomic::Ordering::SeqCst) {
                return false;
            }
            self.frames
                .lock()
                .expect("lock")
                .push((endpoint.to_string(), payload));
            true
        }
    }

    fn account() -> AccountId {
        let mut bytes = vec![0x05];
        bytes.extend_from_slice(&[0xAB; 32]);
        AccountId::from_bytes(&bytes, Network::Mainnet).expect("account")
    }

    fn message(ns: NamespaceId) -> Message {
        Message::new(account(), ns, b"payload".to_vec(), 1_700_000_000_000, 60_000)
            .expect("message")
    }

    #[test]
    fn test_notify_matching_namespace() {
        let map = MonitorMap::new();
        let sink = TestSink::new(1);
        map.register(&account(), vec![0, 4], true, sink.clone());

        map.notify(&message(0));
        map.notify(&message(4));
        map.notify(&message(2)); // not subscribed

        let frames = sink.frames();
        assert_eq!(frames.len(), 2);
        assert!(frames.iter().all(|(e, _)| e == NOTIFY_ENDPOINT));
    }

    #[test]
    fn test_notify_frame_fields() {
        let msg = message(0);
        let frame = notify_frame(&msg, true);
        let decoded = haven_bencode::decode(&frame).expect("decode");
        let d = decoded.as_dict().expect("dict");
        assert_eq!(d[b"@".as_slice()].as_bytes().expect("account"), msg.account.as_bytes());
        assert_eq!(d[b"h".as_slice()].as_str().expect("hash"), msg.hash);
        assert_eq!(d[b"n".as_slice()].as_int(), Some(0));
        assert_eq!(d[b"t".as_slice()].as_int(), Some(msg.timestamp_ms as i64));
        assert_eq!(d[b"z".as_slice()].as_int(), Some(msg.expiry_ms as i64));
        assert_eq!(d[b"~d".as_slice()].as_bytes().expect("data"), msg.data);

        // Without want_data the ~d key is absent.
        let frame = notify_frame(&msg, false);
        let decoded = haven_bencode::decode(&frame).expect("decode");
        assert!(decoded.as_dict().expect("dict").get(b"~d".as_slice()).is_none());
    }

    #[test]
    fn test_failed_send_evicts() {
        let map = MonitorMap::new();
        let sink = TestSink::new(1);
        map.register(&account(), vec![0], false, sink.clone());
        sink.kill();
        map.notify(&message(0));
        assert_eq!(map.subscription_count(), 0);
    }

    #[test]
    fn test_register_refresh_dedups() {
        let map = MonitorMap::new();
        let sink = TestSink::new(1);
        map.register(&account(), vec![0], false, sink.clone());
        map.register(&account(), vec![0], false, sink.clone());
        assert_eq!(map.subscription_count(), 1);
        // A different namespace set is a distinct subscription (multi-device).
        map.register(&account(), vec![0, 1], false, sink.clone());
        assert_eq!(map.subscription_count(), 2);
    }

    #[test]
    fn test_drop_connection() {
        let map = MonitorMap::new();
        map.register(&account(), vec![0], false, TestSink::new(1));
        map.register(&account(), vec![1], false, TestSink::new(2));
        map.drop_connection(1);
        assert_eq!(map.subscription_count(), 1);
    }

    // -- parse_subscription ------------------------------------------------

    fn sub_dict(kp: &KeyPair, now: u64, mutate: impl FnOnce(&mut BTreeMap<Vec<u8>, Value>)) -> Value {
        let ed = kp.verifying_key.to_bytes();
        let x = x25519::ed25519_pubkey_to_x25519(&ed).expect("convert");
        let acct = AccountId::from_x25519(x);
        let namespaces = vec![0i64, 4];
        let payload = monitor_payload(&acct.to_hex(), now, true, &[0, 4]);
        let sig = kp.signing_key.sign(&payload);

        let mut map: BTreeMap<Vec<u8>, Value> = BTreeMap::new();
        map.insert(b"P".to_vec(), Value::bytes(ed.to_vec()));
        map.insert(
            b"n".to_vec(),
            Value::List(namespaces.into_iter().map(Value::Int).collect()),
        );
        map.insert(b"d".to_vec(), Value::Int(1));
        map.insert(b"t".to_vec(), Value::Int(now as i64));
        map.insert(b"s".to_vec(), Value::bytes(sig.to_bytes().to_vec()));
        mutate(&mut map);
        Value::Dict(map)
    }

    const NOW: u64 = 1_700_000_000;

    #[test]
    fn test_parse_valid_subscription() {
        let kp = KeyPair::generate();
        let value = sub_dict(&kp, NOW, |_| {});
        let sub = parse_subscription(&value, Network::Mainnet, NOW).expect("valid");
        assert_eq!(sub.namespaces, vec![0, 4]);
        assert!(sub.want_data);
        assert_eq!(sub.account.as_bytes().len(), 33);
        assert_eq!(sub.account.as_bytes()[0], 0x05);
    }

    #[test]
    fn test_parse_rejects_both_projections() {
        let kp = KeyPair::generate();
        let value = sub_dict(&kp, NOW, |m| {
            m.insert(b"p".to_vec(), Value::bytes(vec![5u8; 33]));
        });
        assert_eq!(
            parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
            MonitorError::BadArgs
        );
    }

    #[test]
    fn test_parse_rejects_bad_namespaces() {
        let kp = KeyPair::generate();
        for bad in [
            Value::List(vec![]),                                   // empty
            Value::List(vec![Value::Int(4), Value::Int(0)]),       // unsorted
            Value::List(vec![Value::Int(0), Value::Int(0)]),       // duplicate
            Value::List(vec![Value::Int(40_000)]),                 // out of i16 range
        ] {
            let value = sub_dict(&kp, NOW, |m| {
                m.insert(b"n".to_vec(), bad.clone());
            });
            assert_eq!(
                parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
                MonitorError::BadNamespace
            );
        }
    }

    #[test]
    fn test_parse_rejects_stale_and_future_timestamps() {
        let kp = KeyPair::generate();
        let too_old = NOW - MAX_TIMESTAMP_AGE_SECS - 1;
        let value = sub_dict(&kp, too_old, |_| {});
        assert_eq!(
            parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
            MonitorError::BadTimestamp
        );

        let too_new = NOW + MAX_TIMESTAMP_AHEAD_SECS + 1;
        let value = sub_dict(&kp, too_new, |_| {});
        assert_eq!(
            parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
            MonitorError::BadTimestamp
        );
    }

    #[test]
    fn test_parse_rejects_bad_signature() {
        let kp = KeyPair::generate();
        let value = sub_dict(&kp, NOW, |m| {
            m.insert(b"d".to_vec(), Value::Int(0)); // signed with d=1
        });
        assert_eq!(
            parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
            MonitorError::BadSignature
        );
    }

    #[test]
    fn test_parse_subkey_signature() {
        let kp = KeyPair::generate();
        // Signed by a key derived from a subkey tag: the request carries S
        // and the verification must use the derived signer. Since deriving
        // the matching private scalar is out of scope for the node, this
        // test checks that a random subkey tag makes the account-key
        // signature fail (the signer is no longer the account key).
        let value = sub_dict(&kp, NOW, |m| {
            m.insert(b"S".to_vec(), Value::bytes(vec![0x11; 32]));
        });
        assert_eq!(
            parse_subscription(&value, Network::Mainnet, NOW).expect_err("rejected"),
            MonitorError::BadSignature
        );
    }

    #[test]
    fn test_success_and_error_replies() {
        let ok = success_reply().encode();
        assert_eq!(ok, b"d7:successi1ee");
        let err = MonitorError::WrongSwarm.reply().encode();
        let decoded = haven_bencode::decode(&err).expect("decode");
        let d = decoded.as_dict().expect("dict");
        assert_eq!(d[b"errcode".as_slice()].as_int(), Some(6));
    }
}
