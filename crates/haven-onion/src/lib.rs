//! # haven-onion
//!
//! Layered-envelope processing for onion requests.
//!
//! Clients wrap a request in one encrypted envelope per hop. Each envelope
//! carries an ephemeral X25519 public key and an AEAD ciphertext keyed by
//! `blake2b_256("haven-onion" || ECDH(eph, local))`. The decrypted payload
//! is a control header (bencoded or JSON, client's choice) naming either
//! the next hop or a terminal pseudo-request.
//!
//! Peeling is a pure state machine: [`peel`] yields a [`Step`] that the
//! caller drives (`Forward` → relay via the peer bus, `Terminal` → dispatch
//! to the request handler), plus the [`HopSecret`] under which any reply,
//! errors included, is encrypted back to the previous hop. Errors are a
//! single constant ciphertext so a failing hop cannot learn its position
//! in the chain.
//!
//! Frame layout: `[version:1][eph_x25519_pub:32][ciphertext]`. Version 1
//! uses ChaCha20-Poly1305, version 2 XChaCha20-Poly1305; the request
//! direction uses an all-zero nonce and the reply direction sets the final
//! nonce byte to 1, which is safe because every layer has a fresh ephemeral
//! key.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use haven_crypto::aead::{self, AeadKind};
use haven_crypto::hash::blake2b_256;
use haven_crypto::x25519::{X25519PublicKey, X25519SecretKey};

/// Frame version selecting ChaCha20-Poly1305.
pub const VERSION_CHACHA: u8 = 1;

/// Frame version selecting XChaCha20-Poly1305.
pub const VERSION_XCHACHA: u8 = 2;

/// Domain separation for the per-hop key derivation.
const KDF_CONTEXT: &[u8] = b"haven-onion";

/// The one error string ever sent over the wire (always encrypted).
const OPAQUE_ERROR: &[u8] = b"onion request processing failed";

/// Errors from onion processing. None of these reach the network as-is;
/// the wire only ever carries [`HopSecret::encrypt_error`]'s output.
#[derive(Debug, thiserror::Error)]
pub enum OnionError {
    #[error("malformed onion frame: {0}")]
    BadFrame(String),

    #[error("envelope decryption failed")]
    Decrypt,

    #[error("malformed control header: {0}")]
    BadHeader(String),
}

pub type Result<T> = std::result::Result<T, OnionError>;

/// The symmetric channel back to the previous hop.
pub struct HopSecret {
    key: [u8; 32],
    kind: AeadKind,
}

/// A client request synthesized at the terminal hop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TerminalRequest {
    pub method: String,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// What to do after peeling one layer.
#[derive(Debug)]
pub enum Step {
    /// Relay the remaining onion to the named peer.
    Forward {
        /// Ed25519 identity of the next hop.
        next_hop: [u8; 32],
        /// The inner onion frame, opaque to this node.
        onion: Vec<u8>,
    },
    /// This node is the terminal; dispatch the embedded request.
    Terminal(TerminalRequest),
}

/// Result of a successful peel.
pub struct Peeled {
    pub step: Step,
    pub secret: HopSecret,
}

/// Peel one onion layer with this node's X25519 key.
pub fn peel(frame: &[u8], local_secret: &X25519SecretKey) -> Result<Peeled> {
    if frame.len() < 1 + 32 + aead::TAG_SIZE {
        return Err(OnionError::BadFrame(format!("{} bytes", frame.len())));
    }
    let kind = match frame[0] {
        VERSION_CHACHA => AeadKind::ChaCha20,
        VERSION_XCHACHA => AeadKind::XChaCha20,
        v => return Err(OnionError::BadFrame(format!("unknown version {v}"))),
    };
    let eph_pub: [u8; 32] = frame[1..33].try_into().expect("32-byte key");
    let ciphertext = &frame[33..];

    let shared = local_secret.diffie_hellman(&X25519PublicKey::from_bytes(eph_pub));
    let key = blake2b_256(&[KDF_CONTEXT, shared.as_bytes()]);
    let secret = HopSecret { key, kind };

    let plaintext = aead::decrypt(kind, &key, &request_nonce(kind), ciphertext)
        .map_err(|_| OnionError::Decrypt)?;

    let step = parse_header(&plaintext)?;
    Ok(Peeled { step, secret })
}

impl HopSecret {
    /// Encrypt a reply for the previous hop under this layer's key.
    pub fn encrypt_reply(&self, reply: &[u8]) -> Vec<u8> {
        // Encryption with a just-derived key and fixed nonce cannot fail.
        aead::encrypt(self.kind, &self.key, &reply_nonce(self.kind), reply)
            .unwrap_or_default()
    }

    /// The opaque error reply: one constant string, encrypted, regardless
    /// of what went wrong.
    pub fn encrypt_error(&self) -> Vec<u8> {
        self.encrypt_reply(OPAQUE_ERROR)
    }
}

fn request_nonce(kind: AeadKind) -> Vec<u8> {
    vec![0u8; kind.nonce_size()]
}

fn reply_nonce(kind: AeadKind) -> Vec<u8> {
    let mut nonce = vec![0u8; kind.nonce_size()];
    *nonce.last_mut().expect("nonempty nonce") = 1;
    nonce
}

// ---------------------------------------------------------------------------
// Control header parsing
// ---------------------------------------------------------------------------

fn parse_header(plaintext: &[u8]) -> Result<Step> {
    match plaintext.first().copied() {
        Some(b'd') => parse_bencoded(plaintext),
        Some(b'{') => parse_json(plaintext),
        _ => Err(OnionError::BadHeader("neither bencode nor JSON".into())),
    }
}

fn parse_bencoded(plaintext: &[u8]) -> Result<Step> {
    let value = haven_bencode::decode(plaintext)
        .map_err(|e| OnionError::BadHeader(e.to_string()))?;
    let dict = value
        .as_dict()
        .ok_or_else(|| OnionError::BadHeader("not a dict".into()))?;

    if let Some(next) = dict.get(b"n".as_slice()) {
        let next_hop: [u8; 32] = next
            .as_bytes()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| OnionError::BadHeader("bad next hop key".into()))?;
        let onion = dict
            .get(b"o".as_slice())
            .and_then(|v| v.as_bytes())
            .ok_or_else(|| OnionError::BadHeader("missing inner onion".into()))?;
        return Ok(Step::Forward {
            next_hop,
            onion: onion.to_vec(),
        });
    }

    if dict.get(b"t".as_slice()).and_then(|v| v.as_int()) == Some(1) {
        let req = dict
            .get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .ok_or_else(|| OnionError::BadHeader("missing request".into()))?;
        let method = req
            .get(b"m".as_slice())
            .and_then(|v| v.as_str())
            .ok_or_else(|| OnionError::BadHeader("missing method".into()))?
            .to_string();
        let mut headers = BTreeMap::new();
        if let Some(hs) = req.get(b"h".as_slice()).and_then(|v| v.as_dict()) {
            for (k, v) in hs {
                let key = String::from_utf8_lossy(k).into_owned();
                let val = v.as_str().unwrap_or_default().to_string();
                headers.insert(key, val);
            }
        }
        let body = req
            .get(b"b".as_slice())
            .and_then(|v| v.as_bytes())
            .unwrap_or_default()
            .to_vec();
        return Ok(Step::Terminal(TerminalRequest {
            method,
            headers,
            body,
        }));
    }

    Err(OnionError::BadHeader("neither next hop nor terminal".into()))
}

fn parse_json(plaintext: &[u8]) -> Result<Step> {
    let value: serde_json::Value = serde_json::from_slice(plaintext)
        .map_err(|e| OnionError::BadHeader(e.to_string()))?;

    if let Some(next) = value.get("next_hop").and_then(|v| v.as_str()) {
        let bytes = hex::decode_hex32(next)
            .ok_or_else(|| OnionError::BadHeader("bad next hop key".into()))?;
        let onion = value
            .get("onion")
            .and_then(|v| v.as_str())
            .and_then(|s| BASE64.decode(s).ok())
            .ok_or_else(|| OnionError::BadHeader("missing inner onion".into()))?;
        return Ok(Step::Forward {
            next_hop: bytes,
            onion,
        });
    }

    if value.get("terminal").and_then(|v| v.as_bool()) == Some(true) {
        let req = value
            .get("request")
            .ok_or_else(|| OnionError::BadHeader("missing request".into()))?;
        let method = req
            .get("method")
            .and_then(|v| v.as_str())
            .ok_or_else(|| OnionError::BadHeader("missing method".into()))?
            .to_string();
        let mut headers = BTreeMap::new();
        if let Some(map) = req.get("headers").and_then(|v| v.as_object()) {
            for (k, v) in map {
                headers.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
        let body = req
            .get("body")
            .and_then(|v| v.as_str())
            .map(|s| BASE64.decode(s).unwrap_or_else(|_| s.as_bytes().to_vec()))
            .unwrap_or_default();
        return Ok(Step::Terminal(TerminalRequest {
            method,
            headers,
            body,
        }));
    }

    Err(OnionError::BadHeader("neither next hop nor terminal".into()))
}

mod hex {
    /// Decode exactly 64 hex chars into 32 bytes.
    pub fn decode_hex32(s: &str) -> Option<[u8; 32]> {
        if s.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(&s[2 * i..2 * i + 2], 16).ok()?;
        }
        Some(out)
    }
}

// ---------------------------------------------------------------------------
// Client-side construction (used by tests and by nodes relaying inward)
// ---------------------------------------------------------------------------

/// Keys a sender retains to decrypt the reply that comes back through a
/// layer it built.
pub struct LayerKeys {
    key: [u8; 32],
    kind: AeadKind,
}

impl LayerKeys {
    /// Decrypt a reply that traveled back through this layer.
    pub fn decrypt_reply(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        aead::decrypt(self.kind, &self.key, &reply_nonce(self.kind), ciphertext)
            .map_err(|_| OnionError::Decrypt)
    }
}

/// Encrypt one layer addressed to `recipient`, returning the frame and the
/// keys needed to open the eventual reply.
pub fn seal_layer(
    version: u8,
    recipient: &X25519PublicKey,
    plaintext: &[u8],
) -> Result<(Vec<u8>, LayerKeys)> {
    let kind = match version {
        VERSION_CHACHA => AeadKind::ChaCha20,
        VERSION_XCHACHA => AeadKind::XChaCha20,
        v => return Err(OnionError::BadFrame(format!("unknown version {v}"))),
    };
    let eph = X25519SecretKey::generate();
    let shared = eph.diffie_hellman(recipient);
    let key = blake2b_256(&[KDF_CONTEXT, shared.as_bytes()]);

    let ciphertext = aead::encrypt(kind, &key, &request_nonce(kind), plaintext)
        .map_err(|_| OnionError::Decrypt)?;

    let mut frame = Vec::with_capacity(1 + 32 + ciphertext.len());
    frame.push(version);
    frame.extend_from_slice(&eph.public_key().to_bytes());
    frame.extend_from_slice(&ciphertext);
    Ok((frame, LayerKeys { key, kind }))
}

/// Bencode a relay header around an inner onion.
pub fn relay_header(next_hop: [u8; 32], inner: &[u8]) -> Vec<u8> {
    haven_bencode::dict([
        (b"n".as_slice(), haven_bencode::Value::bytes(next_hop.to_vec())),
        (b"o".as_slice(), haven_bencode::Value::bytes(inner.to_vec())),
    ])
    .encode()
}

/// Bencode a terminal header embedding a pseudo-request.
pub fn terminal_header(request: &TerminalRequest) -> Vec<u8> {
    let headers = haven_bencode::Value::Dict(
        request
            .headers
            .iter()
            .map(|(k, v)| (k.clone().into_bytes(), haven_bencode::Value::bytes(v.clone().into_bytes())))
            .collect(),
    );
    haven_bencode::dict([
        (
            b"r".as_slice(),
            haven_bencode::dict([
                (b"b".as_slice(), haven_bencode::Value::bytes(request.body.clone())),
                (b"h".as_slice(), headers),
                (b"m".as_slice(), haven_bencode::Value::bytes(request.method.clone().into_bytes())),
            ]),
        ),
        (b"t".as_slice(), haven_bencode::Value::Int(1)),
    ])
    .encode()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TerminalRequest {
        TerminalRequest {
            method: "retrieve".into(),
            headers: BTreeMap::from([("pubkey".to_string(), "05ab".to_string())]),
            body: b"{\"namespace\":0}".to_vec(),
        }
    }

    #[test]
    fn test_terminal_roundtrip_bencoded() {
        let node = X25519SecretKey::generate();
        let header = terminal_header(&request());
        let (frame, keys) = seal_layer(VERSION_CHACHA, &node.public_key(), &header).expect("seal");

        let peeled = peel(&frame, &node).expect("peel");
        match peeled.step {
            Step::Terminal(req) => assert_eq!(req, request()),
            other => panic!("expected terminal, got {other:?}"),
        }

        // Reply path: encrypt at the node, decrypt at the sender.
        let reply = peeled.secret.encrypt_reply(b"{\"messages\":[]}");
        assert_eq!(keys.decrypt_reply(&reply).expect("open"), b"{\"messages\":[]}");
    }

    #[test]
    fn test_terminal_roundtrip_xchacha() {
        let node = X25519SecretKey::generate();
        let header = terminal_header(&request());
        let (frame, keys) = seal_layer(VERSION_XCHACHA, &node.public_key(), &header).expect("seal");
        let peeled = peel(&frame, &node).expect("peel");
        assert!(matches!(peeled.step, Step::Terminal(_)));
        let reply = peeled.secret.encrypt_reply(b"ok");
        assert_eq!(keys.decrypt_reply(&reply).expect("open"), b"ok");
    }

    #[test]
    fn test_two_hop_forward_then_terminal() {
        let relay = X25519SecretKey::generate();
        let terminal = X25519SecretKey::generate();
        let terminal_ed = [0xEE; 32];

        let inner_header = terminal_header(&request());
        let (inner_frame, _keys) =
            seal_layer(VERSION_CHACHA, &terminal.public_key(), &inner_header).expect("seal inner");

        let outer_header = relay_header(terminal_ed, &inner_frame);
        let (outer_frame, _) =
            seal_layer(VERSION_CHACHA, &relay.public_key(), &outer_header).expect("seal outer");

        // Relay hop sees only the next-hop identity and an opaque blob.
        let peeled = peel(&outer_frame, &relay).expect("peel outer");
        let (next_hop, onion) = match peeled.step {
            Step::Forward { next_hop, onion } => (next_hop, onion),
            other => panic!("expected forward, got {other:?}"),
        };
        assert_eq!(next_hop, terminal_ed);
        assert_eq!(onion, inner_frame);

        // Terminal hop recovers the request.
        let peeled = peel(&onion, &terminal).expect("peel inner");
        assert!(matches!(peeled.step, Step::Terminal(_)));
    }

    #[test]
    fn test_json_terminal_header() {
        let node = X25519SecretKey::generate();
        let body = BASE64.encode(b"payload");
        let header = serde_json::json!({
            "terminal": true,
            "request": {"method": "store", "headers": {"X-Loki-ttl": "60000"}, "body": body},
        });
        let (frame, _) = seal_layer(
            VERSION_CHACHA,
            &node.public_key(),
            header.to_string().as_bytes(),
        )
        .expect("seal");
        let peeled = peel(&frame, &node).expect("peel");
        match peeled.step {
            Step::Terminal(req) => {
                assert_eq!(req.method, "store");
                assert_eq!(req.headers["X-Loki-ttl"], "60000");
                assert_eq!(req.body, b"payload");
            }
            other => panic!("expected terminal, got {other:?}"),
        }
    }

    #[test]
    fn test_json_relay_header() {
        let node = X25519SecretKey::generate();
        let next = [0x11u8; 32];
        let header = serde_json::json!({
            "next_hop": next.iter().map(|b| format!("{b:02x}")).collect::<String>(),
            "onion": BASE64.encode(b"inner-frame"),
        });
        let (frame, _) = seal_layer(
            VERSION_CHACHA,
            &node.public_key(),
            header.to_string().as_bytes(),
        )
        .expect("seal");
        let peeled = peel(&frame, &node).expect("peel");
        match peeled.step {
            Step::Forward { next_hop, onion } => {
                assert_eq!(next_hop, next);
                assert_eq!(onion, b"inner-frame");
            }
            other => panic!("expected forward, got {other:?}"),
        }
    }

    #[test]
    fn test_wrong_recipient_fails_opaquely() {
        let node = X25519SecretKey::generate();
        let other = X25519SecretKey::generate();
        let (frame, _) =
            seal_layer(VERSION_CHACHA, &node.public_key(), &terminal_header(&request()))
                .expect("seal");
        assert!(matches!(peel(&frame, &other), Err(OnionError::Decrypt)));
    }

    #[test]
    fn test_malformed_frames_rejected() {
        let node = X25519SecretKey::generate();
        assert!(peel(b"", &node).is_err());
        assert!(peel(&[9u8; 64], &node).is_err());

        let (mut frame, _) =
            seal_layer(VERSION_CHACHA, &node.public_key(), &terminal_header(&request()))
                .expect("seal");
        frame[0] = 77; // unknown version
        assert!(peel(&frame, &node).is_err());
    }

    #[test]
    fn test_error_reply_is_constant() {
        let node = X25519SecretKey::generate();
        let (frame, keys) =
            seal_layer(VERSION_CHACHA, &node.public_key(), &terminal_header(&request()))
                .expect("seal");
        let peeled = peel(&frame, &node).expect("peel");
        let err = peeled.secret.encrypt_error();
        assert_eq!(keys.decrypt_reply(&err).expect("open"), OPAQUE_ERROR);
    }

    #[test]
    fn test_reply_nonce_differs_from_request_nonce() {
        assert_ne!(request_nonce(AeadKind::ChaCha20), reply_nonce(AeadKind::ChaCha20));
        assert_ne!(request_nonce(AeadKind::XChaCha20), reply_nonce(AeadKind::XChaCha20));
    }
}
