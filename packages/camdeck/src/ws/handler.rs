//! Per-connection WebSocket handler.
//!
//! Each connection gets three cooperating loops: an input loop parsing client
//! messages, an event pump converting session events into outbound messages,
//! and a sender draining the outbound queue to the socket. When any of them
//! ends, every remaining subscription for the connection is unwound.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::AppState;
use crate::broadcast::StreamEvent;
use crate::ws::protocol::{ClientMessage, ServerMessage};

/// Convert a session event into the outbound message for this connection.
/// Returns the camera id to clear from subscription bookkeeping when the
/// event is terminal.
fn event_to_message(event: StreamEvent) -> (ServerMessage, Option<String>) {
    match event {
        StreamEvent::Frame { camera_id, frame } => (
            ServerMessage::Frame {
                camera_id,
                frame: frame.payload,
                timestamp: frame.timestamp,
                width: frame.width,
                height: frame.height,
            },
            None,
        ),
        StreamEvent::Closed { camera_id, reason } => (
            ServerMessage::StreamError {
                camera_id: camera_id.clone(),
                error: reason,
            },
            Some(camera_id),
        ),
    }
}

pub async fn handle_stream_ws(socket: WebSocket, state: AppState) {
    let connection_id = Uuid::new_v4().to_string();
    info!(conn = %connection_id, "new stream WebSocket connection");
    state.metrics.connection_opened();
    state.tracker.on_connect(&connection_id).await;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Outbound queue: control acks and frames share one ordered pipe to the
    // socket.
    let (out_tx, mut out_rx) = mpsc::channel::<ServerMessage>(256);
    // Sink handed to sessions this connection subscribes to.
    let (event_tx, mut event_rx) =
        mpsc::channel::<StreamEvent>(state.stream_config.subscriber_buffer);

    let event_pump = {
        let tracker = state.tracker.clone();
        let out_tx = out_tx.clone();
        let connection_id = connection_id.clone();
        async move {
            while let Some(event) = event_rx.recv().await {
                let (message, closed_camera) = event_to_message(event);
                if let Some(camera_id) = closed_camera {
                    // The session is gone; disconnect cleanup must not try to
                    // unsubscribe from it again.
                    tracker.remove_subscription(&connection_id, &camera_id).await;
                }
                if out_tx.send(message).await.is_err() {
                    break;
                }
            }
        }
    };

    let sender_loop = async move {
        while let Some(message) = out_rx.recv().await {
            let json = match serde_json::to_string(&message) {
                Ok(json) => json,
                Err(e) => {
                    error!(error = %e, "failed to serialize outbound message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    };

    let input_loop = {
        let registry = state.registry.clone();
        let directory = state.directory.clone();
        let tracker = state.tracker.clone();
        let metrics = state.metrics.clone();
        let out_tx = out_tx.clone();
        let event_tx = event_tx.clone();
        let connection_id = connection_id.clone();
        async move {
            while let Some(message) = ws_receiver.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        metrics.message_received();
                        let client_message = match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) => message,
                            Err(e) => {
                                debug!(
                                    conn = %connection_id,
                                    error = %e,
                                    "ignoring malformed client message"
                                );
                                continue;
                            }
                        };

                        match client_message {
                            ClientMessage::StartStream { camera_id } => {
                                let Some(registration) = directory.lookup(&camera_id) else {
                                    warn!(
                                        conn = %connection_id,
                                        camera = %camera_id,
                                        "start requested for unknown camera"
                                    );
                                    let _ = out_tx
                                        .send(ServerMessage::StreamError {
                                            camera_id,
                                            error: "unknown camera".to_string(),
                                        })
                                        .await;
                                    continue;
                                };

                                tracker.add_subscription(&connection_id, &camera_id).await;
                                match registry
                                    .subscribe(&registration, &connection_id, event_tx.clone())
                                    .await
                                {
                                    Ok(outcome) => {
                                        debug!(
                                            conn = %connection_id,
                                            camera = %camera_id,
                                            ?outcome,
                                            "stream started"
                                        );
                                        let _ = out_tx
                                            .send(ServerMessage::StreamStarted { camera_id })
                                            .await;
                                    }
                                    Err(e) => {
                                        warn!(
                                            conn = %connection_id,
                                            camera = %camera_id,
                                            error = %e,
                                            "failed to start stream"
                                        );
                                        tracker
                                            .remove_subscription(&connection_id, &camera_id)
                                            .await;
                                        let _ = out_tx
                                            .send(ServerMessage::StreamError {
                                                camera_id,
                                                error: format!("failed to start stream: {e}"),
                                            })
                                            .await;
                                    }
                                }
                            }
                            ClientMessage::StopStream { camera_id } => {
                                registry.unsubscribe(&camera_id, &connection_id).await;
                                tracker.remove_subscription(&connection_id, &camera_id).await;
                                let _ = out_tx
                                    .send(ServerMessage::StreamStopped { camera_id })
                                    .await;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        debug!(conn = %connection_id, "client closed connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(conn = %connection_id, error = %e, "WebSocket error");
                        metrics.websocket_error();
                        break;
                    }
                }
            }
        }
    };

    tokio::select! {
        _ = event_pump => debug!(conn = %connection_id, "event pump ended"),
        _ = sender_loop => debug!(conn = %connection_id, "sender loop ended"),
        _ = input_loop => debug!(conn = %connection_id, "input loop ended"),
    }

    // Unwind whatever the connection was still watching.
    for camera_id in state.tracker.on_disconnect(&connection_id).await {
        state.registry.unsubscribe(&camera_id, &connection_id).await;
    }
    state.metrics.connection_closed();
    info!(conn = %connection_id, "stream WebSocket connection closed");
}
