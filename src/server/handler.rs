//! Axum WebSocket upgrade handler.

use axum::extract::State;
use axum::extract::ws::WebSocketUpgrade;
use axum::response::IntoResponse;
use std::sync::Arc;

use super::connection::run_connection;
use crate::app_state::AppState;

/// `GET /wsrpc` — Upgrade the HTTP connection to the RPC WebSocket.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let dispatch = Arc::clone(&state.dispatch);
    let broker = Arc::clone(&state.broker);

    ws.on_upgrade(move |socket| run_connection(socket, dispatch, broker))
}
