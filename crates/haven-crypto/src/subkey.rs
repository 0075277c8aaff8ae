//! Delegated-signer subkeys.
//!
//! An account owner can authorize a secondary device to sign mutating
//! requests without handing over the account key. The owner publishes a
//! 32-byte tag `c`; the authorized verifying key is
//!
//! ```text
//! D = scalar( blake2b_512( "HavenSubkey" || c || A ) ) * A
//! ```
//!
//! where `A` is the account's Ed25519 point. Both sides can compute `D`
//! from public data, and only a device holding the matching derived scalar
//! can produce signatures that verify against it. The derivation is part of
//! the wire contract.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;

use crate::ed25519::VerifyingKey;
use crate::hash::blake2b_512;
use crate::{CryptoError, Result};

/// Domain-separation prefix for subkey derivation.
const SUBKEY_CONTEXT: &[u8] = b"HavenSubkey";

/// Derive the verifying key authorized by subkey tag `c` for account key
/// `account_ed`.
///
/// Fails if the account bytes are not a valid curve point, or if the
/// derived point is not a usable Ed25519 verifying key (e.g. it landed on a
/// small-order point).
pub fn derive_signer(tag: &[u8; 32], account_ed: &[u8; 32]) -> Result<VerifyingKey> {
    let point = CompressedEdwardsY(*account_ed)
        .decompress()
        .ok_or_else(|| CryptoError::InvalidKey("account is not a curve point".into()))?;

    let wide = blake2b_512(&[SUBKEY_CONTEXT, tag, account_ed]);
    let d = Scalar::from_bytes_mod_order_wide(&wide);

    let derived = d * point;
    VerifyingKey::from_bytes(&derived.compress().to_bytes())
}
