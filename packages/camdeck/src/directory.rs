//! Camera directory boundary.
//!
//! The relay does not own camera records; it only needs enough of them to
//! register a camera upstream. Lookups happen before any session work, so an
//! unknown id is rejected without touching the registry.

use std::collections::HashMap;

use frame_source::CameraRegistration;
use tracing::debug;

use crate::config::CameraEntry;

pub trait CameraDirectory: Send + Sync + 'static {
    fn lookup(&self, camera_id: &str) -> Option<CameraRegistration>;
}

/// Directory backed by the `[[cameras]]` entries in config.toml.
pub struct StaticDirectory {
    cameras: HashMap<String, CameraRegistration>,
}

impl StaticDirectory {
    pub fn from_entries(entries: &[CameraEntry]) -> Self {
        let mut cameras = HashMap::new();
        for entry in entries {
            let previous = cameras.insert(
                entry.id.clone(),
                CameraRegistration {
                    camera_id: entry.id.clone(),
                    name: entry.name.clone(),
                    rtsp_url: entry.rtsp_url.clone(),
                    username: entry.username.clone(),
                    password: entry.password.clone(),
                },
            );
            if previous.is_some() {
                debug!(camera = %entry.id, "duplicate camera entry, last one wins");
            }
        }
        Self { cameras }
    }

    pub fn len(&self) -> usize {
        self.cameras.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cameras.is_empty()
    }
}

impl CameraDirectory for StaticDirectory {
    fn lookup(&self, camera_id: &str) -> Option<CameraRegistration> {
        self.cameras.get(camera_id).cloned()
    }
}
