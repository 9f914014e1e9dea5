//! Status/monitoring HTTP surface: a small axum router serving the node's
//! consensus snapshot. Read-only; it never touches consensus state beyond
//! taking a status snapshot.

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde_json::{json, Value};
use tokio::net::TcpListener;

use crate::error::Result;
use crate::raft::RaftNode;

pub fn router(node: RaftNode) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/health", get(health))
        .with_state(node)
}

pub async fn serve(node: RaftNode, listener: TcpListener) -> Result<()> {
    let mut shutdown = node.shutdown_signal();
    axum::serve(listener, router(node))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn status(State(node): State<RaftNode>) -> Json<Value> {
    let status = node.status().await;
    let uptime_secs = (Utc::now() - status.started_at).num_seconds();
    let mut body = serde_json::to_value(&status).unwrap_or_else(|_| json!({}));
    if let Some(map) = body.as_object_mut() {
        map.insert("uptime_secs".into(), json!(uptime_secs));
    }
    Json(body)
}

async fn health() -> &'static str {
    "ok"
}
