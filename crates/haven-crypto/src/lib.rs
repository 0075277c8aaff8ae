//! # haven-crypto
//!
//! Typed wrappers over the primitives the storage node consumes as black
//! boxes: Ed25519 signatures, X25519 key agreement, the two
//! ChaCha20-Poly1305 AEAD variants, SHA-512, and blake2b. Also home to the
//! two derivations that are part of the wire contract: the Ed25519 →
//! account conversion and the delegated-signer subkey scheme.

pub mod aead;
pub mod ed25519;
pub mod hash;
pub mod subkey;
pub mod x25519;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("signature verification failed")]
    BadSignature,

    #[error("AEAD open failed")]
    AeadFailure,
}

pub type Result<T> = std::result::Result<T, CryptoError>;
