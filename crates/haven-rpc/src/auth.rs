//! Signature authentication for mutating endpoints.
//!
//! A request mutating an account must carry an Ed25519 signature over a
//! per-endpoint ascii concatenation. The accepted signer is either the
//! account's own Ed25519 key or a delegated signer derived from a
//! published subkey tag.
//!
//! For netid-prefixed accounts the Ed25519 key is supplied separately
//! (`pubkey_ed25519`) and must convert, via the Edwards→Montgomery map, to
//! the X25519 key inside the account; that check ties the signature to the
//! mailbox being mutated. Bare 32-byte accounts are themselves Ed25519
//! keys.

use haven_crypto::ed25519::{Signature, VerifyingKey};
use haven_crypto::{subkey, x25519};
use haven_types::{AccountId, NamespaceId};

use crate::params::{decode_bytes, SignedParams};
use crate::{Result, RpcError};

/// Resolve and verify the signer for a mutating request.
pub fn verify_signed(account: &AccountId, signed: &SignedParams, payload: &[u8]) -> Result<()> {
    let ed_key = signer_key(account, signed)?;
    let verifier = match &signed.subkey {
        Some(tag_hex) => {
            let tag: [u8; 32] = decode_bytes("subkey", tag_hex)?;
            subkey::derive_signer(&tag, &ed_key.to_bytes())
                .map_err(|e| RpcError::Unauthorized(e.to_string()))?
        }
        None => ed_key,
    };

    let sig_bytes: [u8; 64] = decode_bytes("signature", &signed.signature)?;
    verifier
        .verify(payload, &Signature::from_bytes(&sig_bytes))
        .map_err(|_| RpcError::Unauthorized("signature does not match".into()))
}

/// The Ed25519 key an account's signatures verify against.
fn signer_key(account: &AccountId, signed: &SignedParams) -> Result<VerifyingKey> {
    match &signed.pubkey_ed25519 {
        Some(ed_hex) => {
            let ed_bytes: [u8; 32] = decode_bytes("pubkey_ed25519", ed_hex)?;
            let derived_x = x25519::ed25519_pubkey_to_x25519(&ed_bytes)
                .map_err(|e| RpcError::Unauthorized(e.to_string()))?;
            if derived_x != account.key() {
                return Err(RpcError::Unauthorized(
                    "pubkey_ed25519 does not derive the account".into(),
                ));
            }
            VerifyingKey::from_bytes(&ed_bytes).map_err(|e| RpcError::Unauthorized(e.to_string()))
        }
        None => {
            // Only a bare account is its own Ed25519 key; a netid-prefixed
            // account holds an X25519 key and needs the separate field.
            if account.as_bytes().len() != 32 {
                return Err(RpcError::Unauthorized(
                    "prefixed account requires pubkey_ed25519".into(),
                ));
            }
            let key: [u8; 32] = account
                .key()
                .try_into()
                .map_err(|_| RpcError::Unauthorized("account is not an ed25519 key".into()))?;
            VerifyingKey::from_bytes(&key).map_err(|e| RpcError::Unauthorized(e.to_string()))
        }
    }
}

/// `delete` signs `"delete" || timestamp || h_0 || … || h_n`.
pub fn delete_payload(timestamp: u64, hashes: &[String]) -> Vec<u8> {
    let mut out = format!("delete{timestamp}").into_bytes();
    for h in hashes {
        out.extend_from_slice(h.as_bytes());
    }
    out
}

/// `delete_all` signs `"delete_all" || ns || timestamp`; `ns` is the
/// decimal namespace or `all` when every namespace is targeted.
pub fn delete_all_payload(namespace: Option<NamespaceId>, timestamp: u64) -> Vec<u8> {
    format!("delete_all{}{timestamp}", namespace_str(namespace)).into_bytes()
}

/// `delete_before` signs `"delete_before" || ns || before`.
pub fn delete_before_payload(namespace: Option<NamespaceId>, before: u64) -> Vec<u8> {
    format!("delete_before{}{before}", namespace_str(namespace)).into_bytes()
}

/// `expire` signs `"expire" || expiry || h_0 || … || h_n`.
pub fn expire_payload(expiry: u64, hashes: &[String]) -> Vec<u8> {
    let mut out = format!("expire{expiry}").into_bytes();
    for h in hashes {
        out.extend_from_slice(h.as_bytes());
    }
    out
}

/// `monitor.messages` signs
/// `"MONITOR" || account_hex || timestamp || ("0"|"1") || join(",", ns)`.
pub fn monitor_payload(
    account_hex: &str,
    timestamp: u64,
    want_data: bool,
    namespaces: &[NamespaceId],
) -> Vec<u8> {
    let ns_list = namespaces
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "MONITOR{account_hex}{timestamp}{}{ns_list}",
        if want_data { "1" } else { "0" }
    )
    .into_bytes()
}

fn namespace_str(namespace: Option<NamespaceId>) -> String {
    namespace.map_or_else(|| "all".to_string(), |n| n.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use haven_crypto::ed25519::KeyPair;
    use haven_types::account::Network;

    fn mainnet_account_for(kp: &KeyPair) -> AccountId {
        let x = x25519::ed25519_pubkey_to_x25519(&kp.verifying_key.to_bytes()).expect("convert");
        AccountId::from_x25519(x)
    }

    fn signed(kp: &KeyPair, account: &AccountId, payload: &[u8], subkey_tag: Option<[u8; 32]>) -> SignedParams {
        SignedParams {
            pubkey: account.to_hex(),
            pubkey_ed25519: Some(hex::encode(kp.verifying_key.to_bytes())),
            subkey: subkey_tag.map(hex::encode),
            signature: hex::encode(kp.signing_key.sign(payload).to_bytes()),
        }
    }

    #[test]
    fn test_mainnet_signature_accepted() {
        let kp = KeyPair::generate();
        let account = mainnet_account_for(&kp);
        let payload = delete_all_payload(Some(0), 1234);
        let params = signed(&kp, &account, &payload, None);
        assert!(verify_signed(&account, &params, &payload).is_ok());
    }

    #[test]
    fn test_wrong_ed_key_rejected() {
        let kp = KeyPair::generate();
        let other = KeyPair::generate();
        let account = mainnet_account_for(&kp);
        let payload = delete_all_payload(None, 1);
        // Signed by the right key but claiming the wrong ed pubkey.
        let mut params = signed(&kp, &account, &payload, None);
        params.pubkey_ed25519 = Some(hex::encode(other.verifying_key.to_bytes()));
        assert!(matches!(
            verify_signed(&account, &params, &payload),
            Err(RpcError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let kp = KeyPair::generate();
        let account = mainnet_account_for(&kp);
        let payload = expire_payload(999, &["h1".into()]);
        let params = signed(&kp, &account, &payload, None);
        let other_payload = expire_payload(1000, &["h1".into()]);
        assert!(verify_signed(&account, &params, &other_payload).is_err());
    }

    #[test]
    fn test_testnet_account_is_its_own_signer() {
        let kp = KeyPair::generate();
        let account =
            AccountId::from_bytes(&kp.verifying_key.to_bytes(), Network::Testnet).expect("account");
        let payload = delete_payload(5, &["abc".into()]);
        let params = SignedParams {
            pubkey: account.to_hex(),
            pubkey_ed25519: None,
            subkey: None,
            signature: hex::encode(kp.signing_key.sign(&payload).to_bytes()),
        };
        assert!(verify_signed(&account, &params, &payload).is_ok());
    }

    #[test]
    fn test_prefixed_account_requires_ed_key() {
        let kp = KeyPair::generate();
        let account = mainnet_account_for(&kp);
        let payload = delete_payload(5, &[]);
        let params = SignedParams {
            pubkey: account.to_hex(),
            pubkey_ed25519: None,
            subkey: None,
            signature: hex::encode(kp.signing_key.sign(&payload).to_bytes()),
        };
        assert!(verify_signed(&account, &params, &payload).is_err());
    }

    #[test]
    fn test_payload_constructions() {
        assert_eq!(delete_payload(7, &["a".into(), "b".into()]), b"delete7ab");
        assert_eq!(delete_all_payload(None, 9), b"delete_allall9");
        assert_eq!(delete_all_payload(Some(-3), 9), b"delete_all-39");
        assert_eq!(delete_before_payload(Some(2), 11), b"delete_before211");
        assert_eq!(expire_payload(4, &["x".into()]), b"expire4x");
        assert_eq!(
            monitor_payload("05ff", 10, true, &[-1, 0, 4]),
            b"MONITOR05ff101-1,0,4"
        );
    }
}
