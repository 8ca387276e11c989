//! WebSocket upgrade endpoint.

use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
};

use crate::AppState;
use crate::ws::handle_stream_ws;

/// GET /api/ws - upgrade to the streaming WebSocket
pub async fn stream_websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_stream_ws(socket, state))
}
