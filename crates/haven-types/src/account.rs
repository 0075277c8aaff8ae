//! Account identities.
//!
//! An account is the addressable mailbox of the overlay: a fixed-length
//! byte string whose length depends on the network. On mainnet an account
//! is 33 bytes (one netid prefix byte, then a 32-byte X25519 key); on
//! testnet it is the bare 32-byte key.
//!
//! The netid prefix for mainnet accounts derived from Ed25519 keys is
//! [`SESSION_NETID`] (0x05).

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// Netid prefix byte prepended to converted Ed25519 keys on mainnet.
pub const SESSION_NETID: u8 = 0x05;

/// Account key length on mainnet (netid byte + 32-byte key).
pub const MAINNET_ACCOUNT_SIZE: usize = 33;

/// Account key length on testnet (bare 32-byte key).
pub const TESTNET_ACCOUNT_SIZE: usize = 32;

/// Which overlay network this node serves.
///
/// Carried inside the node configuration and passed explicitly to every
/// pubkey parse; there is deliberately no process-global network state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Byte length of an account key on this network.
    pub fn account_size(self) -> usize {
        match self {
            Network::Mainnet => MAINNET_ACCOUNT_SIZE,
            Network::Testnet => TESTNET_ACCOUNT_SIZE,
        }
    }
}

impl Default for Network {
    fn default() -> Self {
        Network::Mainnet
    }
}

/// An account public key, validated against the configured network.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AccountId {
    bytes: Vec<u8>,
}

impl AccountId {
    /// Parse an account from raw bytes, checking the network length.
    pub fn from_bytes(bytes: &[u8], network: Network) -> crate::Result<Self> {
        if bytes.len() != network.account_size() {
            return Err(TypeError::InvalidPubkey(format!(
                "wrong length: {} bytes, expected {}",
                bytes.len(),
                network.account_size()
            )));
        }
        Ok(Self {
            bytes: bytes.to_vec(),
        })
    }

    /// Parse an account from its hex form (66 chars mainnet, 64 testnet).
    pub fn from_hex(s: &str, network: Network) -> crate::Result<Self> {
        let bytes = hex::decode(s)
            .map_err(|_| TypeError::InvalidPubkey(format!("not hex: {s:?}")))?;
        Self::from_bytes(&bytes, network)
    }

    /// Reconstruct an account from stored bytes, accepting either network
    /// length. Used when reading rows back from the database, where the
    /// bytes were validated at admission.
    pub fn from_stored(bytes: Vec<u8>) -> crate::Result<Self> {
        if bytes.len() != MAINNET_ACCOUNT_SIZE && bytes.len() != TESTNET_ACCOUNT_SIZE {
            return Err(TypeError::InvalidPubkey(format!(
                "stored account has {} bytes",
                bytes.len()
            )));
        }
        Ok(Self { bytes })
    }

    /// Build a mainnet account from a converted X25519 key by prepending
    /// the netid byte. Used for the Ed25519 subscription projection.
    pub fn from_x25519(key: [u8; 32]) -> Self {
        let mut bytes = Vec::with_capacity(MAINNET_ACCOUNT_SIZE);
        bytes.push(SESSION_NETID);
        bytes.extend_from_slice(&key);
        Self { bytes }
    }

    /// The full account bytes, netid prefix included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The key body with any netid prefix stripped: always 32 bytes.
    pub fn key(&self) -> &[u8] {
        if self.bytes.len() == MAINNET_ACCOUNT_SIZE {
            &self.bytes[1..]
        } else {
            &self.bytes
        }
    }

    /// Hex rendering of the full account, as used in signed payloads.
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }
}

impl std::fmt::Debug for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AccountId({})", self.to_hex())
    }
}

impl std::fmt::Display for AccountId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_parse() {
        let hex = format!("05{}", "ab".repeat(32));
        let acct = AccountId::from_hex(&hex, Network::Mainnet).expect("parse");
        assert_eq!(acct.as_bytes().len(), 33);
        assert_eq!(acct.key().len(), 32);
        assert_eq!(acct.to_hex(), hex);
    }

    #[test]
    fn test_testnet_parse() {
        let hex = "cd".repeat(32);
        let acct = AccountId::from_hex(&hex, Network::Testnet).expect("parse");
        assert_eq!(acct.as_bytes().len(), 32);
        assert_eq!(acct.key(), acct.as_bytes());
    }

    #[test]
    fn test_wrong_length_rejected() {
        assert!(AccountId::from_hex(&"ab".repeat(32), Network::Mainnet).is_err());
        assert!(AccountId::from_hex(&format!("05{}", "ab".repeat(32)), Network::Testnet).is_err());
    }

    #[test]
    fn test_not_hex_rejected() {
        let bad = "zz".repeat(33);
        assert!(AccountId::from_hex(&bad, Network::Mainnet).is_err());
    }

    #[test]
    fn test_from_x25519_prefixes_netid() {
        let acct = AccountId::from_x25519([7u8; 32]);
        assert_eq!(acct.as_bytes()[0], SESSION_NETID);
        assert_eq!(acct.key(), &[7u8; 32]);
    }
}
