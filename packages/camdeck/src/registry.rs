//! Session registry.
//!
//! Maps camera ids to live session actors. All table mutations happen under
//! one async lock so the invariant holds at this level: an entry exists
//! exactly while at least one subscriber is attached. Sessions that stop on
//! their own (error threshold) remove their entry too; the epoch guard keeps
//! an old actor from removing a newer session for the same camera.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, info};

use frame_source::{CameraRegistration, FrameSource};

use crate::broadcast::{Broadcaster, FrameSink};
use crate::config::StreamConfig;
use crate::metrics::ServerMetrics;
use crate::session::{SessionHandle, SessionInfo, SpawnOptions, StopReason, spawn_session};

pub(crate) struct SessionEntry {
    pub(crate) epoch: u64,
    pub(crate) handle: SessionHandle,
}

pub(crate) type SessionTable = Arc<Mutex<HashMap<String, SessionEntry>>>;

/// Whether a subscribe created the session or joined a running one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeOutcome {
    Created,
    Joined,
}

pub struct SessionRegistry<S: FrameSource> {
    table: SessionTable,
    source: Arc<S>,
    broadcaster: Arc<Broadcaster>,
    config: StreamConfig,
    metrics: Arc<ServerMetrics>,
    next_epoch: AtomicU64,
}

impl<S: FrameSource> SessionRegistry<S> {
    pub fn new(
        source: Arc<S>,
        broadcaster: Arc<Broadcaster>,
        config: StreamConfig,
        metrics: Arc<ServerMetrics>,
    ) -> Self {
        Self {
            table: Arc::new(Mutex::new(HashMap::new())),
            source,
            broadcaster,
            config,
            metrics,
            next_epoch: AtomicU64::new(1),
        }
    }

    /// Attach a viewer to the camera's session, creating the session if this
    /// is the first subscriber.
    pub async fn subscribe(
        &self,
        registration: &CameraRegistration,
        viewer_id: &str,
        sink: FrameSink,
    ) -> Result<SubscribeOutcome> {
        let camera_id = registration.camera_id.clone();
        let mut table = self.table.lock().await;

        let existing = table.get(&camera_id).map(|entry| entry.handle.clone());
        if let Some(handle) = existing {
            match handle.subscribe(viewer_id, sink.clone()).await {
                Ok(count) => {
                    debug!(
                        camera = %camera_id,
                        viewer = %viewer_id,
                        subscribers = count,
                        "joined running session"
                    );
                    return Ok(SubscribeOutcome::Joined);
                }
                Err(_) => {
                    // The actor stopped between our lookup and the command
                    // landing; drop the stale entry and start over.
                    debug!(camera = %camera_id, "stale session entry replaced");
                    table.remove(&camera_id);
                }
            }
        }

        let epoch = self.next_epoch.fetch_add(1, Ordering::Relaxed);
        let handle = spawn_session(SpawnOptions {
            registration: registration.clone(),
            epoch,
            config: self.config.clone(),
            source: self.source.clone(),
            broadcaster: self.broadcaster.clone(),
            metrics: self.metrics.clone(),
            table: self.table.clone(),
            first_subscriber: (viewer_id.to_string(), sink),
        });
        table.insert(camera_id.clone(), SessionEntry { epoch, handle });
        self.metrics.session_created();
        info!(camera = %camera_id, viewer = %viewer_id, "session created");
        Ok(SubscribeOutcome::Created)
    }

    /// Detach a viewer. The last viewer out stops the session; holding the
    /// table lock across the zero check makes the removal atomic with it.
    pub async fn unsubscribe(&self, camera_id: &str, viewer_id: &str) {
        let mut table = self.table.lock().await;
        let Some(handle) = table.get(camera_id).map(|entry| entry.handle.clone()) else {
            return;
        };

        match handle.unsubscribe(viewer_id).await {
            Ok(0) => {
                if let Some(entry) = table.remove(camera_id) {
                    info!(camera = %camera_id, "last subscriber left, stopping session");
                    entry.handle.stop(StopReason::Drained).await;
                }
            }
            Ok(remaining) => {
                debug!(
                    camera = %camera_id,
                    viewer = %viewer_id,
                    subscribers = remaining,
                    "subscriber detached"
                );
            }
            Err(_) => {
                // Already stopped on its own; just drop the stale entry.
                table.remove(camera_id);
            }
        }
    }

    pub async fn contains(&self, camera_id: &str) -> bool {
        self.table.lock().await.contains_key(camera_id)
    }

    pub async fn session_count(&self) -> usize {
        self.table.lock().await.len()
    }

    /// Snapshots of all live sessions. Sessions stopping concurrently are
    /// simply absent from the result.
    pub async fn snapshot(&self) -> Vec<SessionInfo> {
        let handles: Vec<SessionHandle> = {
            let table = self.table.lock().await;
            table.values().map(|entry| entry.handle.clone()).collect()
        };

        let mut infos = Vec::with_capacity(handles.len());
        for handle in handles {
            if let Ok(info) = handle.snapshot().await {
                infos.push(info);
            }
        }
        infos
    }

    /// Stop every session; used on server shutdown.
    pub async fn shutdown_all(&self) {
        let entries: Vec<SessionEntry> = {
            let mut table = self.table.lock().await;
            table.drain().map(|(_, entry)| entry).collect()
        };

        for entry in entries {
            entry.handle.stop(StopReason::Shutdown).await;
        }
    }
}
