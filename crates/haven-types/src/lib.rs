//! # haven-types
//!
//! Shared domain types for the haven storage node: account identities,
//! namespaces, stored messages, clock helpers, and the constants that make
//! up the wire contract between nodes and clients.

pub mod account;
pub mod message;
pub mod time;

pub use account::{AccountId, Network};
pub use message::Message;

/// Namespace identifier: a client-chosen bucket within an account.
pub type NamespaceId = i16;

/// Swarm identifier on the 64-bit ring.
pub type SwarmId = u64;

/// Sentinel for "no swarm assigned".
pub const INVALID_SWARM_ID: SwarmId = u64::MAX;

/// Maximum size of a single message body, in bytes.
pub const MAX_MESSAGE_SIZE: usize = 76_800;

/// Minimum accepted message TTL.
pub const TTL_MIN_MS: u64 = 10_000;

/// Maximum accepted message TTL (14 days).
pub const TTL_MAX_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Maximum tolerated skew between a client timestamp and the local wall
/// clock, in either direction (14 days).
pub const TIMESTAMP_SKEW_MS: u64 = 14 * 24 * 60 * 60 * 1000;

/// Recommended period for the cleanup tick driving store GC and
/// subscription expiry.
pub const CLEANUP_PERIOD_SECS: u64 = 10;

/// Lifetime of a push-notification subscription.
pub const MONITOR_EXPIRY_SECS: u64 = 65 * 60;

/// SQLite page size used by the message database.
pub const DB_PAGE_SIZE: u64 = 4096;

/// Default on-disk size cap for the message database (3.5 GiB).
pub const DB_SIZE_LIMIT: u64 = 3584 * 1024 * 1024;

/// Default number of messages returned by a retrieve call.
pub const RETRIEVE_DEFAULT_LIMIT: usize = 100;

/// Hard ceiling on the number of messages returned by a retrieve call.
pub const RETRIEVE_MAX_LIMIT: usize = 256;

/// Length of a message hash: base64 (unpadded) of a 32-byte blake2b digest.
pub const MESSAGE_HASH_LEN: usize = 43;

/// Errors arising from domain-type construction and validation.
#[derive(Debug, thiserror::Error)]
pub enum TypeError {
    #[error("invalid account pubkey: {0}")]
    InvalidPubkey(String),

    #[error("message too large: {size} bytes, max {max}")]
    MessageTooLarge { size: usize, max: usize },

    #[error("ttl {0}ms outside the accepted range")]
    TtlOutOfRange(u64),

    #[error("timestamp {0}ms outside the accepted clock skew")]
    TimestampSkew(u64),
}

pub type Result<T> = std::result::Result<T, TypeError>;
