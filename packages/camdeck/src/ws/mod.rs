//! Viewer-facing WebSocket layer: the JSON wire protocol and the
//! per-connection handler that bridges messages to camera sessions.

mod handler;
mod protocol;

pub use handler::handle_stream_ws;
pub use protocol::{ClientMessage, ServerMessage};
