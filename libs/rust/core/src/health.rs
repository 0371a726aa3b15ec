//! `/live`, `/ready` and `/status` endpoints for a running node.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::node::NodeStatus;

static NODE_LIVENESS: AtomicBool = AtomicBool::new(true);
static NODE_READINESS: AtomicBool = AtomicBool::new(false);

pub fn mark_ready() { NODE_READINESS.store(true, Ordering::SeqCst); }
pub fn clear_ready() { NODE_READINESS.store(false, Ordering::SeqCst); }
pub fn mark_not_live() { NODE_LIVENESS.store(false, Ordering::SeqCst); }

fn router(status: Arc<NodeStatus>) -> Router {
    Router::new()
        .route("/live", get(|| async { Json(json!({"live": NODE_LIVENESS.load(Ordering::SeqCst)})) }))
        .route("/ready", get(|| async { Json(json!({"ready": NODE_READINESS.load(Ordering::SeqCst)})) }))
        .route("/status", get(status_handler))
        .with_state(status)
}

async fn status_handler(State(status): State<Arc<NodeStatus>>) -> Json<Value> {
    Json(json!({
        "live": NODE_LIVENESS.load(Ordering::SeqCst),
        "ready": NODE_READINESS.load(Ordering::SeqCst),
        "node": status.view(),
    }))
}

pub async fn start_health_server(port: u16, status: Arc<NodeStatus>) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(?addr, "health_server_listening");
    let app = router(status);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error=?e, "health_server_failed");
        }
    });
    Ok(())
}
