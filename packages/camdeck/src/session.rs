//! Camera session actor.
//!
//! One actor per live camera. The actor owns the poll cadence, the error
//! accounting and the subscriber set; everything else talks to it through a
//! [`SessionHandle`]. Fetches run as detached tasks reporting back over an
//! internal channel, so commands are answered even while the upstream is
//! slow, and at most one fetch is in flight at a time.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use frame_source::{CameraRegistration, FetchError, Frame, FrameSource};

use crate::broadcast::{Broadcaster, FrameSink};
use crate::config::StreamConfig;
use crate::metrics::ServerMetrics;
use crate::registry::SessionTable;

/// Why a session is winding down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Last subscriber left.
    Drained,
    /// Consecutive fetch failures reached the configured threshold.
    ErrorThreshold,
    /// Server is shutting down.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Starting,
    Active,
    Stopped,
}

/// Point-in-time view of one session, for health reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub camera_id: String,
    pub state: SessionState,
    pub subscriber_count: usize,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub started_at: String,
    pub last_frame_at: Option<String>,
}

enum SessionCommand {
    Subscribe {
        viewer_id: String,
        sink: FrameSink,
        respond_to: oneshot::Sender<usize>,
    },
    Unsubscribe {
        viewer_id: String,
        respond_to: oneshot::Sender<usize>,
    },
    Snapshot {
        respond_to: oneshot::Sender<SessionInfo>,
    },
    Stop {
        reason: StopReason,
        respond_to: oneshot::Sender<()>,
    },
}

/// Cheap-to-clone handle to a session actor.
#[derive(Clone)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Add a subscriber; returns the subscriber count afterwards.
    pub async fn subscribe(&self, viewer_id: &str, sink: FrameSink) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Subscribe {
                viewer_id: viewer_id.to_string(),
                sink,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("session actor did not respond"))
    }

    /// Remove a subscriber; returns how many remain.
    pub async fn unsubscribe(&self, viewer_id: &str) -> Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Unsubscribe {
                viewer_id: viewer_id.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow::anyhow!("session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("session actor did not respond"))
    }

    pub async fn snapshot(&self) -> Result<SessionInfo> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SessionCommand::Snapshot { respond_to: tx })
            .await
            .map_err(|_| anyhow::anyhow!("session actor is gone"))?;
        rx.await
            .map_err(|_| anyhow::anyhow!("session actor did not respond"))
    }

    /// Ask the session to stop and wait for the acknowledgement. A session
    /// that already stopped on its own is not an error.
    pub async fn stop(&self, reason: StopReason) {
        let (tx, rx) = oneshot::channel();
        if self
            .sender
            .send(SessionCommand::Stop {
                reason,
                respond_to: tx,
            })
            .await
            .is_err()
        {
            return;
        }
        let _ = rx.await;
    }
}

pub struct SpawnOptions<S> {
    pub registration: CameraRegistration,
    /// Distinguishes this session from any later session for the same camera,
    /// so a stopping actor never removes its successor's table entry.
    pub epoch: u64,
    pub config: StreamConfig,
    pub source: Arc<S>,
    pub broadcaster: Arc<Broadcaster>,
    pub metrics: Arc<ServerMetrics>,
    pub table: SessionTable,
    pub first_subscriber: (String, FrameSink),
}

/// Spawn a session actor for one camera and return its handle.
pub fn spawn_session<S: FrameSource>(options: SpawnOptions<S>) -> SessionHandle {
    let (sender, receiver) = mpsc::channel(32);
    let (fetch_tx, fetch_rx) = mpsc::channel(1);

    let (viewer_id, sink) = options.first_subscriber;
    let mut subscribers = HashMap::new();
    subscribers.insert(viewer_id, sink);

    let actor = SessionActor {
        camera_id: options.registration.camera_id.clone(),
        registration: options.registration,
        epoch: options.epoch,
        state: SessionState::Starting,
        subscribers,
        consecutive_errors: 0,
        total_errors: 0,
        started_at: Utc::now(),
        last_frame_at: None,
        fetch_in_flight: false,
        config: options.config,
        source: options.source,
        broadcaster: options.broadcaster,
        metrics: options.metrics,
        table: options.table,
        receiver,
        fetch_tx,
        fetch_rx,
    };
    tokio::spawn(actor.run());

    SessionHandle { sender }
}

struct SessionActor<S: FrameSource> {
    camera_id: String,
    registration: CameraRegistration,
    epoch: u64,
    state: SessionState,
    subscribers: HashMap<String, FrameSink>,
    consecutive_errors: u32,
    total_errors: u64,
    started_at: DateTime<Utc>,
    last_frame_at: Option<DateTime<Utc>>,
    fetch_in_flight: bool,
    config: StreamConfig,
    source: Arc<S>,
    broadcaster: Arc<Broadcaster>,
    metrics: Arc<ServerMetrics>,
    table: SessionTable,
    receiver: mpsc::Receiver<SessionCommand>,
    fetch_tx: mpsc::Sender<Result<Frame, FetchError>>,
    fetch_rx: mpsc::Receiver<Result<Frame, FetchError>>,
}

impl<S: FrameSource> SessionActor<S> {
    async fn run(mut self) {
        // Upstream registration must not delay the first subscriber's ack or
        // the poll loop; the fetch path is the authoritative health signal
        // and will stop the session if the upstream never comes up.
        {
            let source = self.source.clone();
            let registration = self.registration.clone();
            tokio::spawn(async move {
                if let Err(e) = source.register_camera(&registration).await {
                    warn!(
                        camera = %registration.camera_id,
                        error = %e,
                        "upstream registration failed, session continues"
                    );
                }
            });
        }
        self.state = SessionState::Active;
        info!(camera = %self.camera_id, "session active");

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let reason = loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.fetch_in_flight {
                        self.start_fetch();
                    }
                }
                Some(result) = self.fetch_rx.recv() => {
                    self.fetch_in_flight = false;
                    if let Some(reason) = self.handle_fetch_result(result) {
                        break reason;
                    }
                }
                command = self.receiver.recv() => {
                    match command {
                        Some(command) => {
                            if let Some(reason) = self.handle_command(command) {
                                break reason;
                            }
                        }
                        // All handles dropped; nothing can subscribe anymore.
                        None => break StopReason::Drained,
                    }
                }
            }
        };

        self.shutdown(reason).await;
    }

    fn handle_command(&mut self, command: SessionCommand) -> Option<StopReason> {
        match command {
            SessionCommand::Subscribe {
                viewer_id,
                sink,
                respond_to,
            } => {
                self.subscribers.insert(viewer_id.clone(), sink);
                debug!(
                    camera = %self.camera_id,
                    viewer = %viewer_id,
                    subscribers = self.subscribers.len(),
                    "subscriber joined"
                );
                let _ = respond_to.send(self.subscribers.len());
                None
            }
            SessionCommand::Unsubscribe {
                viewer_id,
                respond_to,
            } => {
                if self.subscribers.remove(&viewer_id).is_some() {
                    debug!(
                        camera = %self.camera_id,
                        viewer = %viewer_id,
                        subscribers = self.subscribers.len(),
                        "subscriber left"
                    );
                }
                let _ = respond_to.send(self.subscribers.len());
                None
            }
            SessionCommand::Snapshot { respond_to } => {
                let _ = respond_to.send(self.info());
                None
            }
            SessionCommand::Stop { reason, respond_to } => {
                let _ = respond_to.send(());
                Some(reason)
            }
        }
    }

    fn start_fetch(&mut self) {
        self.fetch_in_flight = true;
        let source = self.source.clone();
        let camera_id = self.camera_id.clone();
        let timeout = self.config.fetch_timeout;
        let fetch_tx = self.fetch_tx.clone();
        tokio::spawn(async move {
            let result = source.fetch_frame(&camera_id, timeout).await;
            // The receiver dies with the actor, so a result arriving after
            // the session stopped is silently discarded here.
            let _ = fetch_tx.send(result).await;
        });
    }

    fn handle_fetch_result(&mut self, result: Result<Frame, FetchError>) -> Option<StopReason> {
        match result {
            Ok(frame) => {
                self.consecutive_errors = 0;
                self.last_frame_at = Some(Utc::now());
                self.broadcaster
                    .emit_frame(&self.subscribers, &self.camera_id, frame);
                None
            }
            Err(e) => {
                self.consecutive_errors += 1;
                self.total_errors += 1;
                self.metrics.fetch_error();
                debug!(
                    camera = %self.camera_id,
                    error = %e,
                    consecutive = self.consecutive_errors,
                    "frame fetch failed"
                );
                if self.consecutive_errors >= self.config.error_threshold {
                    warn!(
                        camera = %self.camera_id,
                        threshold = self.config.error_threshold,
                        "error threshold reached, stopping session"
                    );
                    Some(StopReason::ErrorThreshold)
                } else {
                    None
                }
            }
        }
    }

    fn info(&self) -> SessionInfo {
        SessionInfo {
            camera_id: self.camera_id.clone(),
            state: self.state,
            subscriber_count: self.subscribers.len(),
            consecutive_errors: self.consecutive_errors,
            total_errors: self.total_errors,
            started_at: self.started_at.to_rfc3339(),
            last_frame_at: self.last_frame_at.map(|t| t.to_rfc3339()),
        }
    }

    async fn shutdown(mut self, reason: StopReason) {
        self.state = SessionState::Stopped;

        if reason == StopReason::ErrorThreshold {
            self.broadcaster.emit_closed(
                &self.subscribers,
                &self.camera_id,
                "stream stopped after repeated upstream failures",
            );
        }

        // Refuse further commands before touching the shared table, so a
        // caller holding the table lock gets an immediate error instead of
        // waiting on an actor that is waiting on that same lock.
        self.receiver.close();
        while self.receiver.try_recv().is_ok() {}

        {
            let mut table = self.table.lock().await;
            if let Some(entry) = table.get(&self.camera_id) {
                if entry.epoch == self.epoch {
                    table.remove(&self.camera_id);
                }
            }
        }

        self.metrics.session_stopped();

        // Best-effort; teardown never waits on the upstream.
        let source = self.source.clone();
        let camera_id = self.camera_id.clone();
        tokio::spawn(async move {
            if let Err(e) = source.deregister_camera(&camera_id).await {
                debug!(camera = %camera_id, error = %e, "upstream deregistration failed");
            }
        });

        info!(
            camera = %self.camera_id,
            reason = ?reason,
            total_errors = self.total_errors,
            "session stopped"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::StreamEvent;
    use crate::registry::SessionEntry;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::time::Duration;
    use tokio::sync::{Mutex, Notify};

    fn test_frame(payload: &str) -> Frame {
        Frame {
            payload: payload.to_string(),
            timestamp: "2025-06-01T12:00:00".to_string(),
            width: 640,
            height: 480,
        }
    }

    fn test_registration(camera_id: &str) -> CameraRegistration {
        CameraRegistration {
            camera_id: camera_id.to_string(),
            name: "Test camera".to_string(),
            rtsp_url: "rtsp://10.0.0.2/stream".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }

    fn test_config(error_threshold: u32) -> StreamConfig {
        StreamConfig {
            tick_interval: Duration::from_millis(10),
            fetch_timeout: Duration::from_millis(5),
            error_threshold,
            subscriber_buffer: 64,
        }
    }

    struct MockSource {
        scripted: StdMutex<VecDeque<Result<Frame, FetchError>>>,
        when_empty: StdMutex<Result<Frame, FetchError>>,
        fetch_calls: AtomicU64,
        registrations: StdMutex<Vec<String>>,
        deregistrations: StdMutex<Vec<String>>,
        fail_register: AtomicBool,
        gate: Option<Arc<Notify>>,
    }

    impl MockSource {
        fn with_when_empty(when_empty: Result<Frame, FetchError>) -> Arc<Self> {
            Arc::new(Self {
                scripted: StdMutex::new(VecDeque::new()),
                when_empty: StdMutex::new(when_empty),
                fetch_calls: AtomicU64::new(0),
                registrations: StdMutex::new(Vec::new()),
                deregistrations: StdMutex::new(Vec::new()),
                fail_register: AtomicBool::new(false),
                gate: None,
            })
        }

        /// Every fetch succeeds.
        fn healthy() -> Arc<Self> {
            Self::with_when_empty(Ok(test_frame("live")))
        }

        /// Every fetch fails.
        fn failing() -> Arc<Self> {
            Self::with_when_empty(Err(FetchError::Timeout))
        }

        /// Scripted results are consumed first, then `when_empty` applies.
        fn scripted(
            results: Vec<Result<Frame, FetchError>>,
            when_empty: Result<Frame, FetchError>,
        ) -> Arc<Self> {
            let source = Self::with_when_empty(when_empty);
            *source.scripted.lock().unwrap() = results.into();
            source
        }

        /// Fetches block until the returned notify is signalled.
        fn gated() -> (Arc<Self>, Arc<Notify>) {
            let notify = Arc::new(Notify::new());
            let source = Arc::new(Self {
                scripted: StdMutex::new(VecDeque::new()),
                when_empty: StdMutex::new(Ok(test_frame("live"))),
                fetch_calls: AtomicU64::new(0),
                registrations: StdMutex::new(Vec::new()),
                deregistrations: StdMutex::new(Vec::new()),
                fail_register: AtomicBool::new(false),
                gate: Some(notify.clone()),
            });
            (source, notify)
        }
    }

    impl FrameSource for MockSource {
        async fn register_camera(
            &self,
            registration: &CameraRegistration,
        ) -> Result<(), FetchError> {
            self.registrations
                .lock()
                .unwrap()
                .push(registration.camera_id.clone());
            if self.fail_register.load(Ordering::SeqCst) {
                Err(FetchError::Transport("engine offline".to_string()))
            } else {
                Ok(())
            }
        }

        async fn deregister_camera(&self, camera_id: &str) -> Result<(), FetchError> {
            self.deregistrations
                .lock()
                .unwrap()
                .push(camera_id.to_string());
            Ok(())
        }

        async fn fetch_frame(
            &self,
            _camera_id: &str,
            _timeout: Duration,
        ) -> Result<Frame, FetchError> {
            self.fetch_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            let scripted = self.scripted.lock().unwrap().pop_front();
            match scripted {
                Some(result) => result,
                None => self.when_empty.lock().unwrap().clone(),
            }
        }
    }

    fn sink(capacity: usize) -> (FrameSink, mpsc::Receiver<StreamEvent>) {
        mpsc::channel(capacity)
    }

    fn spawn_for_test(
        source: Arc<MockSource>,
        error_threshold: u32,
        first_viewer: &str,
        first_sink: FrameSink,
    ) -> (SessionTable, SessionHandle) {
        let metrics = Arc::new(ServerMetrics::new());
        let broadcaster = Arc::new(Broadcaster::new(metrics.clone()));
        let table: SessionTable = Arc::new(Mutex::new(HashMap::new()));
        let handle = spawn_session(SpawnOptions {
            registration: test_registration("cam-1"),
            epoch: 1,
            config: test_config(error_threshold),
            source,
            broadcaster,
            metrics,
            table: table.clone(),
            first_subscriber: (first_viewer.to_string(), first_sink),
        });
        (table, handle)
    }

    async fn insert_entry(table: &SessionTable, handle: &SessionHandle) {
        table.lock().await.insert(
            "cam-1".to_string(),
            SessionEntry {
                epoch: 1,
                handle: handle.clone(),
            },
        );
    }

    async fn recv_frame(rx: &mut mpsc::Receiver<StreamEvent>) -> Frame {
        loop {
            match rx.recv().await.expect("event stream ended early") {
                StreamEvent::Frame { frame, .. } => return frame,
                StreamEvent::Closed { reason, .. } => panic!("unexpected close: {}", reason),
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn frames_reach_all_subscribers() {
        let (sink_a, mut rx_a) = sink(64);
        let (sink_b, mut rx_b) = sink(64);
        let (_table, handle) = spawn_for_test(MockSource::healthy(), 20, "viewer-a", sink_a);

        let count = handle.subscribe("viewer-b", sink_b).await.unwrap();
        assert_eq!(count, 2);

        assert_eq!(recv_frame(&mut rx_a).await.payload, "live");
        assert_eq!(recv_frame(&mut rx_b).await.payload, "live");

        handle.stop(StopReason::Drained).await;
    }

    #[tokio::test(start_paused = true)]
    async fn subscriber_counts_track_joins_and_leaves() {
        let (sink_a, _rx_a) = sink(64);
        let (sink_b, _rx_b) = sink(64);
        let (_table, handle) = spawn_for_test(MockSource::healthy(), 20, "viewer-a", sink_a);

        assert_eq!(handle.subscribe("viewer-b", sink_b).await.unwrap(), 2);
        assert_eq!(handle.unsubscribe("viewer-a").await.unwrap(), 1);
        assert_eq!(handle.unsubscribe("viewer-a").await.unwrap(), 1);

        let info = handle.snapshot().await.unwrap();
        assert_eq!(info.subscriber_count, 1);
        assert_eq!(info.state, SessionState::Active);

        handle.stop(StopReason::Drained).await;
    }

    #[tokio::test(start_paused = true)]
    async fn success_at_nineteen_errors_resets_the_run() {
        // One short of the default threshold of 20, then a success.
        let source = MockSource::scripted(
            vec![Err(FetchError::Timeout); 19],
            Ok(test_frame("recovered")),
        );
        let (sink_a, mut rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(source, 20, "viewer-a", sink_a);

        // The first frame only arrives once all nineteen failures are
        // consumed, so the session survived the whole run.
        assert_eq!(recv_frame(&mut rx_a).await.payload, "recovered");

        let info = handle.snapshot().await.unwrap();
        assert_eq!(info.consecutive_errors, 0);
        assert_eq!(info.total_errors, 19);
        assert_eq!(info.state, SessionState::Active);
        assert!(info.last_frame_at.is_some());

        handle.stop(StopReason::Drained).await;
    }

    #[tokio::test(start_paused = true)]
    async fn error_threshold_stops_session_with_one_terminal_error() {
        let source = MockSource::failing();
        let (sink_a, mut rx_a) = sink(64);
        let (sink_b, mut rx_b) = sink(64);
        let (table, handle) = spawn_for_test(source.clone(), 4, "viewer-a", sink_a);
        insert_entry(&table, &handle).await;
        handle.subscribe("viewer-b", sink_b).await.unwrap();

        for rx in [&mut rx_a, &mut rx_b] {
            match rx.recv().await.expect("expected terminal error") {
                StreamEvent::Closed { camera_id, reason } => {
                    assert_eq!(camera_id, "cam-1");
                    assert!(!reason.is_empty());
                }
                StreamEvent::Frame { .. } => panic!("no frames expected from failing source"),
            }
            // Nothing after the terminal error.
            assert!(rx.recv().await.is_none());
        }

        // The actor removed its own table entry and deregistered upstream.
        while !table.lock().await.is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        while source.deregistrations.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert_eq!(source.deregistrations.lock().unwrap()[0], "cam-1");
    }

    #[tokio::test(start_paused = true)]
    async fn drained_stop_emits_no_terminal_error() {
        let (sink_a, mut rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(MockSource::healthy(), 20, "viewer-a", sink_a);

        recv_frame(&mut rx_a).await;
        handle.stop(StopReason::Drained).await;

        while let Some(event) = rx_a.recv().await {
            assert!(matches!(event, StreamEvent::Frame { .. }));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn at_most_one_fetch_in_flight() {
        let (source, gate) = MockSource::gated();
        let (sink_a, mut rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(source.clone(), 20, "viewer-a", sink_a);

        // Many tick periods pass while the first fetch is stuck.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 1);

        gate.notify_one();
        recv_frame(&mut rx_a).await;

        // The next tick starts exactly one more fetch.
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(source.fetch_calls.load(Ordering::SeqCst), 2);

        gate.notify_one();
        handle.stop(StopReason::Drained).await;
    }

    #[tokio::test(start_paused = true)]
    async fn commands_are_answered_while_fetch_is_stuck() {
        let (source, gate) = MockSource::gated();
        let (sink_a, _rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(source, 20, "viewer-a", sink_a);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let info = handle.snapshot().await.unwrap();
        assert_eq!(info.state, SessionState::Active);
        assert_eq!(info.subscriber_count, 1);

        gate.notify_one();
        handle.stop(StopReason::Drained).await;
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_completing_after_stop_is_discarded() {
        let (source, gate) = MockSource::gated();
        let (sink_a, mut rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(source, 20, "viewer-a", sink_a);

        tokio::time::sleep(Duration::from_millis(15)).await;
        handle.stop(StopReason::Drained).await;
        gate.notify_one();

        // The sink closes without ever seeing the late frame.
        assert!(rx_a.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn registration_failure_does_not_block_streaming() {
        let source = MockSource::healthy();
        source.fail_register.store(true, Ordering::SeqCst);
        let (sink_a, mut rx_a) = sink(64);
        let (_table, handle) = spawn_for_test(source.clone(), 20, "viewer-a", sink_a);

        assert_eq!(recv_frame(&mut rx_a).await.payload, "live");
        assert_eq!(source.registrations.lock().unwrap().len(), 1);

        handle.stop(StopReason::Drained).await;
    }
}
