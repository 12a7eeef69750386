//! Admin surface: liveness and tunnel introspection on a separate port.

use std::sync::Arc;

use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub connected_hospitals: usize,
    pub uptime_secs: i64,
    pub hospitals: Vec<HospitalStatus>,
}

#[derive(Debug, Serialize)]
pub struct HospitalStatus {
    pub code: String,
    pub subdomain: String,
    pub connected_at: String,
    pub last_seen: String,
    pub remote_addr: String,
}

pub async fn health() -> &'static str {
    "OK"
}

/// Point-in-time snapshot of connected tunnels.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    let tunnels = state.registry.snapshot();
    let hospitals = tunnels
        .iter()
        .map(|t| HospitalStatus {
            code: t.code.clone(),
            subdomain: t.subdomain.clone(),
            connected_at: t.connected_at.to_rfc3339(),
            last_seen: t.last_seen().to_rfc3339(),
            remote_addr: t.remote_addr.to_string(),
        })
        .collect();
    Json(StatusResponse {
        connected_hospitals: tunnels.len(),
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        hospitals,
    })
}

pub fn router(state: Arc<AppState>) -> Router {
    // browser tooling reads /status cross-origin
    let cors = CorsLayer::new().allow_origin(Any);
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .layer(cors)
        .with_state(state)
}

/// Run the admin listener until shutdown.
pub async fn serve(state: Arc<AppState>, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
    let addr = state.config.metrics_addr;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(addr = %addr, "admin endpoint listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}
