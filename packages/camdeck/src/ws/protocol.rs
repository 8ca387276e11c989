//! JSON wire protocol spoken over `/api/ws`.
//!
//! Tagged with a camelCase `type` field so browser dashboards can switch on
//! it directly.

use serde::{Deserialize, Serialize};

/// Messages from the dashboard to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Start (or join) the live stream for a camera.
    StartStream { camera_id: String },
    /// Stop watching a camera.
    StopStream { camera_id: String },
}

/// Messages from the server to the dashboard.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    /// Acknowledges a start request; frames for this camera follow.
    StreamStarted { camera_id: String },
    /// Acknowledges a stop request.
    StreamStopped { camera_id: String },
    /// One video frame. `frame` is the already-encoded image payload.
    Frame {
        camera_id: String,
        frame: String,
        timestamp: String,
        width: u32,
        height: u32,
    },
    /// The stream failed or was rejected; no more frames for this camera.
    StreamError { camera_id: String, error: String },
}
