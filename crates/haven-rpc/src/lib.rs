//! # haven-rpc
//!
//! The single request router shared by the HTTP surface and the peer bus,
//! plus the subsystems it leans on: signature authentication, the
//! push-subscription engine, the rate limiter, and the stats/logs gate.
//!
//! Every validation step returns `Result<_, RpcError>`; only the outermost
//! adapters (the axum handlers and the bus dispatcher in the daemon)
//! convert an error into its wire form. Handlers never panic on client
//! input.

pub mod auth;
pub mod handler;
pub mod monitor;
pub mod params;
pub mod ratelimit;
pub mod stats;

pub use handler::{Encoding, OracleGateway, Replicator, RequestContext, RequestHandler};
pub use monitor::{MonitorMap, PushSink};

/// Request-level errors, one variant per error kind of the protocol.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("{0}")]
    BadRequest(String),

    #[error("signature verification failed: {0}")]
    Unauthorized(String),

    /// The historical PoW rejection, with its exact legacy message text.
    #[error("Provided PoW nonce is not valid.")]
    PowFailed,

    #[error("forbidden")]
    Forbidden,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    /// The account belongs to another swarm; the payload lists its peers.
    #[error("wrong swarm")]
    WrongSwarm { peers: serde_json::Value },

    #[error("rate limited")]
    RateLimited,

    #[error("storage capacity exhausted")]
    StorageFull,

    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    #[error("request timed out")]
    Timeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// HTTP-style status code, also used on the peer bus failure path.
    pub fn status(&self) -> u16 {
        match self {
            RpcError::BadRequest(_) => 400,
            RpcError::Unauthorized(_) => 401,
            RpcError::PowFailed | RpcError::Forbidden => 403,
            RpcError::NotFound(_) => 404,
            RpcError::Conflict(_) => 409,
            RpcError::WrongSwarm { .. } => 421,
            RpcError::RateLimited => 429,
            RpcError::Internal(_) => 500,
            RpcError::UpstreamUnavailable(_) => 502,
            RpcError::Timeout => 504,
            RpcError::StorageFull => 507,
        }
    }
}

impl From<haven_store::StoreError> for RpcError {
    fn from(e: haven_store::StoreError) -> Self {
        match e {
            haven_store::StoreError::Full => RpcError::StorageFull,
            haven_store::StoreError::Duplicate => {
                RpcError::Conflict("hash conflict - resource already present.".into())
            }
            other => RpcError::Internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(RpcError::BadRequest("x".into()).status(), 400);
        assert_eq!(RpcError::PowFailed.status(), 403);
        assert_eq!(RpcError::WrongSwarm { peers: serde_json::json!([]) }.status(), 421);
        assert_eq!(RpcError::StorageFull.status(), 507);
    }

    #[test]
    fn test_pow_message_text_is_exact() {
        // Clients match on this string; it must not drift.
        assert_eq!(RpcError::PowFailed.to_string(), "Provided PoW nonce is not valid.");
    }

    #[test]
    fn test_store_error_conversion() {
        let e: RpcError = haven_store::StoreError::Full.into();
        assert!(matches!(e, RpcError::StorageFull));
        let e: RpcError = haven_store::StoreError::Duplicate.into();
        assert_eq!(e.status(), 409);
    }
}
