//! # haven-transport
//!
//! Authenticated peer-to-peer message bus between service nodes.
//!
//! The transport runs over QUIC with TLS 1.3. TLS certificates are
//! self-signed and carry no identity; immediately after the QUIC handshake
//! both sides exchange a hello frame binding their long-term Ed25519 key to
//! the connection's keying material, and every inbound message is delivered
//! together with the authenticated peer pubkey.
//!
//! Request-form calls (`sn.ping`, `sn.storage_test`, `sn.onion_req`,
//! forwarded `storage.*` requests) use one bidirectional stream and await a
//! single reply with a 30 s deadline. Send-form calls (`sn.replicate`,
//! `notify.message` pushes) are fire-and-forget on unidirectional streams.
//! Delivery is unordered and at-least-once; the content-addressed store
//! absorbs duplicates.

pub mod bus;
pub mod quic;
pub mod wire;

pub use bus::{ConnHandle, Event, Inbound, PeerBus};
pub use wire::Envelope;

/// Errors from transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("TLS error: {0}")]
    Tls(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("invalid frame: {0}")]
    InvalidFrame(String),

    #[error("peer authentication failed: {0}")]
    Auth(String),

    #[error("request timed out")]
    Timeout,

    #[error("peer closed the stream without replying")]
    NoReply,
}

pub type Result<T> = std::result::Result<T, TransportError>;
