//! Stored messages.
//!
//! Messages are content-addressed: the hash over
//! `(account || namespace || timestamp || data)` is the primary key, which
//! gives admission dedup and swarm-replication idempotence in one
//! structure.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};

use crate::account::AccountId;
use crate::{NamespaceId, TypeError, MAX_MESSAGE_SIZE, TTL_MAX_MS, TTL_MIN_MS};

type Blake2b256 = Blake2b<U32>;

/// A message deposited by a client and held until its expiry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Content address: 43 chars of unpadded base64 over a 32-byte blake2b.
    pub hash: String,
    /// Recipient mailbox.
    pub account: AccountId,
    /// Namespace bucket within the mailbox.
    pub namespace: NamespaceId,
    /// Opaque encrypted payload.
    pub data: Vec<u8>,
    /// Client-asserted deposit time, unix milliseconds.
    pub timestamp_ms: u64,
    /// Expiry, unix milliseconds (`timestamp_ms + ttl`).
    pub expiry_ms: u64,
}

impl Message {
    /// Build a message from client-supplied fields, computing the hash.
    ///
    /// Checks the size cap and the TTL bounds; the timestamp-skew check is
    /// the request handler's job since it needs the local clock.
    pub fn new(
        account: AccountId,
        namespace: NamespaceId,
        data: Vec<u8>,
        timestamp_ms: u64,
        ttl_ms: u64,
    ) -> crate::Result<Self> {
        if data.len() > MAX_MESSAGE_SIZE {
            return Err(TypeError::MessageTooLarge {
                size: data.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        if ttl_ms < TTL_MIN_MS || ttl_ms > TTL_MAX_MS {
            return Err(TypeError::TtlOutOfRange(ttl_ms));
        }
        let hash = compute_hash(&account, namespace, timestamp_ms, &data);
        Ok(Self {
            hash,
            account,
            namespace,
            data,
            timestamp_ms,
            expiry_ms: timestamp_ms + ttl_ms,
        })
    }
}

/// Compute the content address of a message.
///
/// Preimage is `account_bytes || ns_dec || ts_dec || data`, where the
/// namespace and timestamp are base-10 ascii. The digest is 32-byte
/// blake2b, rendered as unpadded base64 (43 chars). This construction is
/// part of the wire contract; all nodes must agree on it byte for byte.
pub fn compute_hash(
    account: &AccountId,
    namespace: NamespaceId,
    timestamp_ms: u64,
    data: &[u8],
) -> String {
    let mut h = Blake2b256::new();
    h.update(account.as_bytes());
    h.update(namespace.to_string().as_bytes());
    h.update(timestamp_ms.to_string().as_bytes());
    h.update(data);
    STANDARD_NO_PAD.encode(h.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::Network;
    use crate::MESSAGE_HASH_LEN;

    fn account() -> AccountId {
        AccountId::from_hex(&format!("05{}", "01".repeat(32)), Network::Mainnet).expect("account")
    }

    #[test]
    fn test_hash_length() {
        let h = compute_hash(&account(), 0, 1_700_000_000_000, b"hi");
        assert_eq!(h.len(), MESSAGE_HASH_LEN);
        // Unpadded base64 never contains '='.
        assert!(!h.contains('='));
    }

    #[test]
    fn test_hash_deterministic() {
        let a = compute_hash(&account(), 3, 1_700_000_000_000, b"payload");
        let b = compute_hash(&account(), 3, 1_700_000_000_000, b"payload");
        assert_eq!(a, b);
    }

    #[test]
    fn test_hash_varies_by_field() {
        let base = compute_hash(&account(), 0, 1000, b"x");
        assert_ne!(base, compute_hash(&account(), 1, 1000, b"x"));
        assert_ne!(base, compute_hash(&account(), 0, 1001, b"x"));
        assert_ne!(base, compute_hash(&account(), 0, 1000, b"y"));
    }

    #[test]
    fn test_new_computes_expiry() {
        let msg = Message::new(account(), 0, b"hi".to_vec(), 1_000_000, TTL_MIN_MS).expect("msg");
        assert_eq!(msg.expiry_ms, 1_000_000 + TTL_MIN_MS);
    }

    #[test]
    fn test_size_cap() {
        let ok = Message::new(account(), 0, vec![0u8; MAX_MESSAGE_SIZE], 0, TTL_MIN_MS);
        assert!(ok.is_ok());
        let too_big = Message::new(account(), 0, vec![0u8; MAX_MESSAGE_SIZE + 1], 0, TTL_MIN_MS);
        assert!(matches!(too_big, Err(TypeError::MessageTooLarge { .. })));
    }

    #[test]
    fn test_ttl_bounds() {
        assert!(Message::new(account(), 0, vec![], 0, TTL_MIN_MS - 1).is_err());
        assert!(Message::new(account(), 0, vec![], 0, TTL_MAX_MS + 1).is_err());
        assert!(Message::new(account(), 0, vec![], 0, TTL_MAX_MS).is_ok());
    }
}
