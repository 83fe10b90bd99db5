//! HTTP transport: JSON-RPC POSTs plus a health endpoint.
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/mcp` | JSON-RPC 2.0 request (or legacy tool envelope) |
//! | `GET`  | `/health` | Health check (returns version) |

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use crate::error::{Error, Result};

use super::protocol::{handle_request, McpState};

/// Serve the tool surface over HTTP until the process is terminated.
pub async fn serve_http(state: McpState, host: &str, port: u16) -> Result<()> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/mcp", post(handle_rpc))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(Arc::new(state));

    let bind_addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(|e| Error::Connection(format!("cannot bind {bind_addr}: {e}")))?;
    axum::serve(listener, app)
        .await
        .map_err(|e| Error::Other(format!("http server: {e}")))?;
    Ok(())
}

async fn handle_rpc(
    State(state): State<Arc<McpState>>,
    Json(payload): Json<Value>,
) -> Json<Value> {
    if !payload.is_object() {
        return Json(json!({
            "jsonrpc": "2.0", "id": null,
            "error": {"code": -32600, "message": "Invalid Request"},
        }));
    }
    match handle_request(&state, &payload).await {
        Some(response) => Json(response),
        None => Json(Value::Null),
    }
}

async fn handle_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
