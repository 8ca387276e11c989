//! Fan-out of session events to subscriber sinks.
//!
//! Delivery is lossy for frames and lossless for terminal errors: a slow
//! subscriber misses frames but never stalls the session, and never misses
//! the event that tells it the stream died.

use std::collections::HashMap;
use std::sync::Arc;

use frame_source::Frame;
use tokio::sync::mpsc;
use tracing::debug;

use crate::metrics::ServerMetrics;

/// Events a session pushes to its subscribers.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Frame { camera_id: String, frame: Frame },
    /// Terminal: the session has stopped and will emit nothing further.
    Closed { camera_id: String, reason: String },
}

/// Per-subscriber delivery channel, bounded so backpressure stays local to
/// one viewer.
pub type FrameSink = mpsc::Sender<StreamEvent>;

/// Delivers one event to every current subscriber without blocking on any of
/// them.
pub struct Broadcaster {
    metrics: Arc<ServerMetrics>,
}

impl Broadcaster {
    pub fn new(metrics: Arc<ServerMetrics>) -> Self {
        Self { metrics }
    }

    /// Deliver `frame` to every subscriber. Each subscriber gets its own copy
    /// of the payload. A full sink skips this frame for that subscriber only;
    /// the subscriber is never removed here.
    pub fn emit_frame(
        &self,
        subscribers: &HashMap<String, FrameSink>,
        camera_id: &str,
        frame: Frame,
    ) {
        for (viewer_id, sink) in subscribers {
            let event = StreamEvent::Frame {
                camera_id: camera_id.to_string(),
                frame: frame.clone(),
            };
            match sink.try_send(event) {
                Ok(()) => self.metrics.frame_relayed(),
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.metrics.frame_dropped();
                    debug!(
                        viewer = %viewer_id,
                        camera = %camera_id,
                        "subscriber lagging, frame skipped"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    // Disconnect cleanup will remove this subscriber shortly.
                    self.metrics.frame_dropped();
                }
            }
        }
    }

    /// Deliver the terminal error to every subscriber. Never blocks the
    /// caller; if a sink is momentarily full the event is handed to a
    /// detached task so it still arrives.
    pub fn emit_closed(
        &self,
        subscribers: &HashMap<String, FrameSink>,
        camera_id: &str,
        reason: &str,
    ) {
        for (viewer_id, sink) in subscribers {
            let event = StreamEvent::Closed {
                camera_id: camera_id.to_string(),
                reason: reason.to_string(),
            };
            match sink.try_send(event) {
                Ok(()) => self.metrics.stream_error_sent(),
                Err(mpsc::error::TrySendError::Full(event)) => {
                    self.metrics.stream_error_sent();
                    let sink = sink.clone();
                    tokio::spawn(async move {
                        let _ = sink.send(event).await;
                    });
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(
                        viewer = %viewer_id,
                        camera = %camera_id,
                        "subscriber gone before terminal error delivery"
                    );
                }
            }
        }
    }
}
