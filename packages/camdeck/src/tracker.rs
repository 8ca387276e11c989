//! Per-connection subscription bookkeeping.
//!
//! Tracks which cameras each live WebSocket connection is watching so that a
//! disconnect can unwind every remaining subscription in one pass.

use std::collections::{HashMap, HashSet};

use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Default)]
pub struct ConnectionTracker {
    connections: RwLock<HashMap<String, HashSet<String>>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn on_connect(&self, connection_id: &str) {
        self.connections
            .write()
            .await
            .insert(connection_id.to_string(), HashSet::new());
    }

    /// Record a subscription. Returns false if it was already present.
    pub async fn add_subscription(&self, connection_id: &str, camera_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        connections
            .entry(connection_id.to_string())
            .or_default()
            .insert(camera_id.to_string())
    }

    /// Drop a subscription. Returns false if it was not present, which is
    /// routine when a session already closed itself.
    pub async fn remove_subscription(&self, connection_id: &str, camera_id: &str) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get_mut(connection_id) {
            Some(cameras) => cameras.remove(camera_id),
            None => false,
        }
    }

    /// Remove the connection entirely, returning the cameras it was still
    /// subscribed to.
    pub async fn on_disconnect(&self, connection_id: &str) -> Vec<String> {
        let mut connections = self.connections.write().await;
        let cameras: Vec<String> = connections
            .remove(connection_id)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();
        if !cameras.is_empty() {
            debug!(
                conn = %connection_id,
                count = cameras.len(),
                "unwinding subscriptions on disconnect"
            );
        }
        cameras
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    #[cfg(test)]
    pub async fn subscriptions(&self, connection_id: &str) -> Vec<String> {
        self.connections
            .read()
            .await
            .get(connection_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }
}
