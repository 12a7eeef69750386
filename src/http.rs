//! Public listener router: tunnel upgrade, diagnostics, and the relay
//! catch-all.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;

use crate::state::AppState;
use crate::tunnel::session;
use crate::{admin, relay};

/// Upper bound on a single WebSocket message from the edge.
const MAX_WS_MESSAGE: usize = 16 * 1024 * 1024;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tunnel", get(tunnel_upgrade))
        .route("/health", get(admin::health))
        .route("/status", get(admin::status))
        .fallback(relay::handle_public)
        .with_state(state)
}

/// Entry point for edge sessions: WebSocket upgrade into the session loop.
async fn tunnel_upgrade(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.max_message_size(MAX_WS_MESSAGE)
        .max_frame_size(MAX_WS_MESSAGE)
        .on_upgrade(move |socket| session::run(state, socket, remote_addr))
}
