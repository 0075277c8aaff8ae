//! The legacy HTTP surface.
//!
//! Two JSON endpoints survive from the original client protocol:
//! `GET /retrieve` (headers `pubkey`, optional `last_hash`) and
//! `POST /store` (the `X-Loki-*` headers with a raw message body). Every
//! response carries `Connection: close`; each request gets a 60 second
//! deadline from dispatch to response.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use tracing::info;

use haven_rpc::{Encoding, RequestContext, RpcError};

use crate::NodeState;

/// Per-request processing deadline.
const REQUEST_DEADLINE: Duration = Duration::from_secs(60);

/// Build the router and serve it until the listener fails.
pub async fn serve(node: Arc<NodeState>, bind: SocketAddr) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/retrieve", get(retrieve))
        .route("/store", post(store))
        .with_state(node);

    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "http surface listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn retrieve(
    State(node): State<Arc<NodeState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let Some(pubkey) = header_str(&headers, "pubkey") else {
        return plain(StatusCode::BAD_REQUEST, "Missing field in header : pubkey");
    };
    let mut body = json!({ "pubkey": pubkey });
    if let Some(last_hash) = header_str(&headers, "last_hash") {
        body["last_hash"] = json!(last_hash);
    }

    let ctx = RequestContext::client(Encoding::Json, Some(remote.ip()));
    match with_deadline(node.handler.handle("retrieve", &body, &ctx)).await {
        Ok(value) => json_response(StatusCode::OK, &value),
        Err(e) => error_response(e),
    }
}

async fn store(
    State(node): State<Arc<NodeState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    for required in ["X-Loki-pow-nonce", "X-Loki-ttl", "X-Loki-timestamp", "X-Loki-recipient"] {
        if header_str(&headers, required).is_none() {
            return plain(
                StatusCode::BAD_REQUEST,
                &format!("Missing field in header : {required}"),
            );
        }
    }
    let nonce = header_str(&headers, "X-Loki-pow-nonce").unwrap_or_default();
    let recipient = header_str(&headers, "X-Loki-recipient").unwrap_or_default();
    let Some(ttl) = header_str(&headers, "X-Loki-ttl").and_then(|v| v.parse::<u64>().ok()) else {
        return plain(StatusCode::BAD_REQUEST, "Invalid TTL header");
    };
    let Some(timestamp) =
        header_str(&headers, "X-Loki-timestamp").and_then(|v| v.parse::<u64>().ok())
    else {
        return plain(StatusCode::BAD_REQUEST, "Invalid timestamp header");
    };

    let request = json!({
        "pubkey": recipient,
        "timestamp": timestamp,
        "ttl": ttl,
        "nonce": nonce,
        "data": BASE64.encode(&body),
    });

    let ctx = RequestContext::client(Encoding::Json, Some(remote.ip()));
    match with_deadline(node.handler.handle("store", &request, &ctx)).await {
        Ok(_) => json_response(StatusCode::OK, &json!({ "status": "ok" })),
        Err(e) => error_response(e),
    }
}

async fn with_deadline<F>(fut: F) -> Result<serde_json::Value, RpcError>
where
    F: std::future::Future<Output = Result<serde_json::Value, RpcError>>,
{
    tokio::time::timeout(REQUEST_DEADLINE, fut)
        .await
        .map_err(|_| RpcError::Timeout)?
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn error_response(e: RpcError) -> Response {
    let status = StatusCode::from_u16(e.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    match e {
        RpcError::WrongSwarm { peers } => json_response(status, &peers),
        other => plain(status, &other.to_string()),
    }
}

fn json_response(status: StatusCode, value: &serde_json::Value) -> Response {
    let body = serde_json::to_string(value).unwrap_or_default();
    (
        status,
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CONNECTION, "close"),
        ],
        body,
    )
        .into_response()
}

fn plain(status: StatusCode, message: &str) -> Response {
    (
        status,
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::CONNECTION, "close"),
        ],
        message.to_string(),
    )
        .into_response()
}
