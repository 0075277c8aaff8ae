//! Typed request parameters.
//!
//! Client requests arrive as JSON (directly, or bridged from bencode via
//! [`haven_bencode::to_json`]); each method's parameters deserialize into a
//! struct here and then pass through validation that yields either a typed
//! error or validated arguments. Binary fields travel as hex (keys,
//! signatures) or base64 (message data).

use serde::Deserialize;

use haven_types::NamespaceId;

use crate::RpcError;

/// `store` parameters.
#[derive(Debug, Deserialize)]
pub struct StoreParams {
    pub pubkey: String,
    pub timestamp: u64,
    /// TTL in milliseconds; exactly one of `ttl` / `expiry` is required.
    pub ttl: Option<u64>,
    /// Absolute expiry in unix milliseconds.
    pub expiry: Option<u64>,
    #[serde(default)]
    pub namespace: NamespaceId,
    /// Message body, base64.
    pub data: String,
    /// Proof-of-work nonce, base64 text as hashed by the client.
    pub nonce: Option<String>,
}

impl StoreParams {
    /// Resolve the effective TTL in milliseconds.
    pub fn ttl_ms(&self) -> Result<u64, RpcError> {
        match (self.ttl, self.expiry) {
            (Some(ttl), None) => Ok(ttl),
            (None, Some(expiry)) => expiry
                .checked_sub(self.timestamp)
                .ok_or_else(|| RpcError::BadRequest("expiry precedes timestamp".into())),
            _ => Err(RpcError::BadRequest(
                "exactly one of ttl/expiry is required".into(),
            )),
        }
    }
}

/// `retrieve` parameters.
#[derive(Debug, Deserialize)]
pub struct RetrieveParams {
    pub pubkey: String,
    #[serde(default)]
    pub namespace: NamespaceId,
    pub last_hash: Option<String>,
    pub max_count: Option<usize>,
}

/// Shared fields of the signed mutating requests.
#[derive(Debug, Deserialize)]
pub struct SignedParams {
    pub pubkey: String,
    /// Ed25519 key behind a netid-prefixed account, hex.
    pub pubkey_ed25519: Option<String>,
    /// Subkey tag authorizing a delegated signer, hex.
    pub subkey: Option<String>,
    /// Signature, base64 or hex.
    pub signature: String,
}

/// `delete` parameters.
#[derive(Debug, Deserialize)]
pub struct DeleteParams {
    #[serde(flatten)]
    pub signed: SignedParams,
    pub messages: Vec<String>,
    pub timestamp: u64,
}

/// `delete_all` parameters.
#[derive(Debug, Deserialize)]
pub struct DeleteAllParams {
    #[serde(flatten)]
    pub signed: SignedParams,
    pub namespace: Option<NamespaceId>,
    pub timestamp: u64,
}

/// `delete_before` parameters.
#[derive(Debug, Deserialize)]
pub struct DeleteBeforeParams {
    #[serde(flatten)]
    pub signed: SignedParams,
    pub namespace: Option<NamespaceId>,
    pub before: u64,
}

/// `expire` parameters.
#[derive(Debug, Deserialize)]
pub struct ExpireParams {
    #[serde(flatten)]
    pub signed: SignedParams,
    pub messages: Vec<String>,
    pub expiry: u64,
    #[serde(default)]
    pub extend: bool,
}

/// `get_expiries` parameters.
#[derive(Debug, Deserialize)]
pub struct GetExpiriesParams {
    pub pubkey: String,
    pub messages: Vec<String>,
}

/// `oxend_request` parameters: forwarded verbatim to the chain daemon.
#[derive(Debug, Deserialize)]
pub struct OxendRequestParams {
    pub endpoint: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

/// Parse a method's parameter struct out of a JSON body.
pub fn parse<T: serde::de::DeserializeOwned>(body: &serde_json::Value) -> Result<T, RpcError> {
    serde_json::from_value(body.clone())
        .map_err(|e| RpcError::BadRequest(format!("invalid parameters: {e}")))
}

/// Decode a field that may be hex or base64, expecting `N` bytes.
pub fn decode_bytes<const N: usize>(field: &str, value: &str) -> Result<[u8; N], RpcError> {
    let bytes = if value.len() == N * 2 {
        hex::decode(value).ok()
    } else {
        use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
        use base64::Engine as _;
        STANDARD
            .decode(value)
            .ok()
            .or_else(|| STANDARD_NO_PAD.decode(value).ok())
    };
    bytes
        .and_then(|b| <[u8; N]>::try_from(b.as_slice()).ok())
        .ok_or_else(|| RpcError::BadRequest(format!("{field}: expected {N} bytes")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_params_ttl_xor_expiry() {
        let p: StoreParams = parse(&serde_json::json!({
            "pubkey": "05aa", "timestamp": 1000u64, "ttl": 60_000u64, "data": "aGk=",
        }))
        .expect("parse");
        assert_eq!(p.ttl_ms().expect("ttl"), 60_000);

        let p: StoreParams = parse(&serde_json::json!({
            "pubkey": "05aa", "timestamp": 1000u64, "expiry": 61_000u64, "data": "aGk=",
        }))
        .expect("parse");
        assert_eq!(p.ttl_ms().expect("ttl"), 60_000);

        let p: StoreParams = parse(&serde_json::json!({
            "pubkey": "05aa", "timestamp": 1000u64, "ttl": 1u64, "expiry": 2u64, "data": "",
        }))
        .expect("parse");
        assert!(p.ttl_ms().is_err());
    }

    #[test]
    fn test_missing_field_is_bad_request() {
        let r: Result<StoreParams, _> = parse(&serde_json::json!({"pubkey": "05aa"}));
        assert!(matches!(r, Err(RpcError::BadRequest(_))));
    }

    #[test]
    fn test_decode_bytes_hex_and_base64() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let raw = [7u8; 32];
        let from_hex: [u8; 32] = decode_bytes("k", &hex::encode(raw)).expect("hex");
        assert_eq!(from_hex, raw);
        let from_b64: [u8; 32] = decode_bytes("k", &STANDARD.encode(raw)).expect("b64");
        assert_eq!(from_b64, raw);
        let bad: Result<[u8; 32], _> = decode_bytes("k", "nope");
        assert!(bad.is_err());
    }

    #[test]
    fn test_signed_params_flatten() {
        let p: DeleteParams = parse(&serde_json::json!({
            "pubkey": "05aa",
            "signature": "c2ln",
            "messages": ["h1", "h2"],
            "timestamp": 5u64,
        }))
        .expect("parse");
        assert_eq!(p.messages.len(), 2);
        assert!(p.signed.subkey.is_none());
    }
}
