//! Digest helpers: SHA-512 (proof-of-work) and blake2b (content addresses,
//! key derivation).

use blake2::digest::consts::{U32, U64};
use blake2::{Blake2b, Digest};
use sha2::Sha512;

type Blake2b256 = Blake2b<U32>;
type Blake2b512 = Blake2b<U64>;

/// SHA-512 over the concatenation of the given parts.
pub fn sha512(parts: &[&[u8]]) -> [u8; 64] {
    let mut h = Sha512::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// 32-byte blake2b over the concatenation of the given parts.
pub fn blake2b_256(parts: &[&[u8]]) -> [u8; 32] {
    let mut h = Blake2b256::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}

/// 64-byte blake2b, used where a wide output feeds scalar reduction.
pub fn blake2b_512(parts: &[&[u8]]) -> [u8; 64] {
    let mut h = Blake2b512::new();
    for part in parts {
        h.update(part);
    }
    h.finalize().into()
}
