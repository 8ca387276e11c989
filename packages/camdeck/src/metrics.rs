//! Server metrics for observability
//!
//! Runtime counters for monitoring relay health: connections, live sessions,
//! frame throughput and error rates.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Server-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently active WebSocket connections
    pub active_connections: AtomicU64,
    /// Total connections since server start
    pub total_connections: AtomicU64,

    // Session metrics
    /// Currently live camera sessions
    pub active_sessions: AtomicU64,
    /// Total sessions created since server start
    pub total_sessions_created: AtomicU64,
    /// Sessions that have been stopped
    pub sessions_stopped: AtomicU64,

    // Frame metrics
    /// Frames delivered to subscribers
    pub frames_relayed: AtomicU64,
    /// Frame deliveries skipped because a subscriber was lagging
    pub frames_dropped: AtomicU64,
    /// Terminal stream errors delivered to subscribers
    pub stream_errors_sent: AtomicU64,

    // Message metrics
    /// WebSocket messages received from clients
    pub messages_received: AtomicU64,

    // Error metrics
    /// Upstream fetch failures (transient or otherwise)
    pub fetch_errors: AtomicU64,
    /// WebSocket transport errors
    pub websocket_errors: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    // Connection tracking
    pub fn connection_opened(&self) {
        self.active_connections.fetch_add(1, Ordering::Relaxed);
        self.total_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    // Session tracking
    pub fn session_created(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_stopped(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
        self.sessions_stopped.fetch_add(1, Ordering::Relaxed);
    }

    // Frame tracking
    pub fn frame_relayed(&self) {
        self.frames_relayed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_error_sent(&self) {
        self.stream_errors_sent.fetch_add(1, Ordering::Relaxed);
    }

    // Message tracking
    pub fn message_received(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    // Error tracking
    pub fn fetch_error(&self) {
        self.fetch_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn websocket_error(&self) {
        self.websocket_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active: self.active_connections.load(Ordering::Relaxed),
                total: self.total_connections.load(Ordering::Relaxed),
            },
            sessions: SessionMetrics {
                active: self.active_sessions.load(Ordering::Relaxed),
                total_created: self.total_sessions_created.load(Ordering::Relaxed),
                stopped: self.sessions_stopped.load(Ordering::Relaxed),
            },
            frames: FrameMetrics {
                relayed: self.frames_relayed.load(Ordering::Relaxed),
                dropped: self.frames_dropped.load(Ordering::Relaxed),
                terminal_errors: self.stream_errors_sent.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                received: self.messages_received.load(Ordering::Relaxed),
            },
            errors: ErrorMetrics {
                fetch: self.fetch_errors.load(Ordering::Relaxed),
                websocket: self.websocket_errors.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub sessions: SessionMetrics,
    pub frames: FrameMetrics,
    pub messages: MessageMetrics,
    pub errors: ErrorMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active: u64,
    pub total: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionMetrics {
    pub active: u64,
    pub total_created: u64,
    pub stopped: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameMetrics {
    pub relayed: u64,
    pub dropped: u64,
    pub terminal_errors: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub received: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorMetrics {
    pub fetch: u64,
    pub websocket: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub sessions: SessionHealth,
    pub connections: u64,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHealth {
    pub active: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_tracking() {
        let metrics = ServerMetrics::new();

        metrics.connection_opened();
        metrics.connection_opened();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);

        metrics.connection_closed();
        assert_eq!(metrics.active_connections.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.total_connections.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_session_tracking() {
        let metrics = ServerMetrics::new();

        metrics.session_created();
        metrics.session_created();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 2);

        metrics.session_stopped();
        assert_eq!(metrics.active_sessions.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.sessions_stopped.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_snapshot() {
        let metrics = ServerMetrics::new();
        metrics.connection_opened();
        metrics.session_created();
        metrics.frame_relayed();
        metrics.frame_dropped();
        metrics.fetch_error();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections.active, 1);
        assert_eq!(snapshot.sessions.active, 1);
        assert_eq!(snapshot.frames.relayed, 1);
        assert_eq!(snapshot.frames.dropped, 1);
        assert_eq!(snapshot.errors.fetch, 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = ServerMetrics::new();
        metrics.stream_error_sent();

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["frames"]["terminal_errors"], 1);
        assert!(json["uptime_secs"].is_u64());
    }
}
