//! AEAD encryption for onion envelopes.
//!
//! Two variants are live on the network: ChaCha20-Poly1305 (12-byte nonce,
//! protocol version 1) and XChaCha20-Poly1305 (24-byte nonce, version 2).
//! The variant is selected per onion-frame version and is part of the wire
//! contract.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce, XChaCha20Poly1305, XNonce};

use crate::{CryptoError, Result};

/// AEAD key size (both variants).
pub const KEY_SIZE: usize = 32;

/// Authentication tag size (both variants).
pub const TAG_SIZE: usize = 16;

/// Which AEAD construction a frame uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AeadKind {
    /// ChaCha20-Poly1305, 12-byte nonce.
    ChaCha20,
    /// XChaCha20-Poly1305, 24-byte nonce.
    XChaCha20,
}

impl AeadKind {
    /// Nonce length for this variant.
    pub fn nonce_size(self) -> usize {
        match self {
            AeadKind::ChaCha20 => 12,
            AeadKind::XChaCha20 => 24,
        }
    }
}

/// Encrypt `plaintext`; the tag is appended to the ciphertext.
pub fn encrypt(kind: AeadKind, key: &[u8; KEY_SIZE], nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    check_nonce(kind, nonce)?;
    match kind {
        AeadKind::ChaCha20 => ChaCha20Poly1305::new(Key::from_slice(key))
            .encrypt(Nonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::AeadFailure),
        AeadKind::XChaCha20 => XChaCha20Poly1305::new(Key::from_slice(key))
            .encrypt(XNonce::from_slice(nonce), plaintext)
            .map_err(|_| CryptoError::AeadFailure),
    }
}

/// Decrypt and authenticate `ciphertext`.
pub fn decrypt(kind: AeadKind, key: &[u8; KEY_SIZE], nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
    check_nonce(kind, nonce)?;
    match kind {
        AeadKind::ChaCha20 => ChaCha20Poly1305::new(Key::from_slice(key))
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AeadFailure),
        AeadKind::XChaCha20 => XChaCha20Poly1305::new(Key::from_slice(key))
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AeadFailure),
    }
}

fn check_nonce(kind: AeadKind, nonce: &[u8]) -> Result<()> {
    if nonce.len() != kind.nonce_size() {
        return Err(CryptoError::InvalidKey(format!(
            "nonce is {} bytes, {:?} needs {}",
            nonce.len(),
            kind,
            kind.nonce_size()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chacha_roundtrip() {
        let key = [0x42; KEY_SIZE];
        let nonce = [0u8; 12];
        let ct = encrypt(AeadKind::ChaCha20, &key, &nonce, b"hello").expect("encrypt");
        assert_eq!(ct.len(), 5 + TAG_SIZE);
        let pt = decrypt(AeadKind::ChaCha20, &key, &nonce, &ct).expect("decrypt");
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn test_xchacha_roundtrip() {
        let key = [0x42; KEY_SIZE];
        let nonce = [1u8; 24];
        let ct = encrypt(AeadKind::XChaCha20, &key, &nonce, b"hello").expect("encrypt");
        let pt = decrypt(AeadKind::XChaCha20, &key, &nonce, &ct).expect("decrypt");
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn test_wrong_key_fails() {
        let ct = encrypt(AeadKind::ChaCha20, &[1; 32], &[0; 12], b"x").expect("encrypt");
        assert!(decrypt(AeadKind::ChaCha20, &[2; 32], &[0; 12], &ct).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let key = [3; 32];
        let mut ct = encrypt(AeadKind::ChaCha20, &key, &[0; 12], b"x").expect("encrypt");
        ct[0] ^= 0xFF;
        assert!(decrypt(AeadKind::ChaCha20, &key, &[0; 12], &ct).is_err());
    }

    #[test]
    fn test_nonce_size_enforced() {
        assert!(encrypt(AeadKind::ChaCha20, &[0; 32], &[0; 24], b"x").is_err());
        assert!(encrypt(AeadKind::XChaCha20, &[0; 32], &[0; 12], b"x").is_err());
    }
}
