use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FetchError;

/// One fetched camera frame.
///
/// `payload` is the upstream's already-encoded image (base64 JPEG in
/// practice); this crate never decodes it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "frame")]
    pub payload: String,
    pub timestamp: String,
    pub width: u32,
    pub height: u32,
}

/// Registration payload for a camera, supplied by whatever owns the camera
/// records (this crate does not own them).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraRegistration {
    pub camera_id: String,
    pub name: String,
    pub rtsp_url: String,
    pub username: String,
    pub password: String,
}

/// Contract against the upstream detection engine.
///
/// A trait rather than a concrete type so the session core can be driven by a
/// scripted source in tests.
pub trait FrameSource: Send + Sync + 'static {
    /// Register a camera with the upstream engine.
    ///
    /// Idempotent from the caller's perspective: registering an
    /// already-registered camera is a success-equivalent outcome.
    fn register_camera(
        &self,
        registration: &CameraRegistration,
    ) -> impl Future<Output = Result<(), FetchError>> + Send;

    /// Deregister a camera. Best-effort; callers must never let a failure
    /// here block local teardown.
    fn deregister_camera(
        &self,
        camera_id: &str,
    ) -> impl Future<Output = Result<(), FetchError>> + Send;

    /// Fetch a single frame, bounded by `timeout`.
    fn fetch_frame(
        &self,
        camera_id: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Frame, FetchError>> + Send;
}

/// HTTP implementation of [`FrameSource`] against the detection engine's
/// REST surface. Owns no state beyond connection parameters.
#[derive(Clone)]
pub struct HttpFrameSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpFrameSource {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    fn add_url(&self) -> String {
        format!("{}/cameras/add", self.base_url)
    }

    fn remove_url(&self, camera_id: &str) -> String {
        format!("{}/cameras/{}", self.base_url, camera_id)
    }

    fn frame_url(&self, camera_id: &str) -> String {
        format!("{}/stream/{}/frame", self.base_url, camera_id)
    }
}

impl FrameSource for HttpFrameSource {
    async fn register_camera(&self, registration: &CameraRegistration) -> Result<(), FetchError> {
        let resp = self
            .client
            .post(self.add_url())
            .json(registration)
            .send()
            .await?;

        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        // The engine answers 409 when the camera is already registered; that
        // is a success-equivalent outcome for this contract.
        if status.as_u16() == 409 {
            debug!(
                camera_id = %registration.camera_id,
                "camera already registered upstream"
            );
            return Ok(());
        }

        Err(FetchError::Status {
            code: status.as_u16(),
        })
    }

    async fn deregister_camera(&self, camera_id: &str) -> Result<(), FetchError> {
        let resp = self.client.delete(self.remove_url(camera_id)).send().await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }
        Ok(())
    }

    async fn fetch_frame(&self, camera_id: &str, timeout: Duration) -> Result<Frame, FetchError> {
        let resp = self
            .client
            .get(self.frame_url(camera_id))
            .timeout(timeout)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                code: status.as_u16(),
            });
        }

        let frame: Frame = resp.json().await?;
        Ok(frame)
    }
}
