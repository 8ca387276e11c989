//! Frame Source - upstream detection-engine client library
//!
//! This crate provides a clean, minimal API for talking to the upstream
//! detection engine that owns the actual camera connections. It has no
//! server-side knowledge (no sessions, no subscribers) and no opinion about
//! frame contents: payloads are opaque, already-encoded images.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use frame_source::{CameraRegistration, FrameSource, HttpFrameSource};
//!
//! #[tokio::main]
//! async fn main() {
//!     let source = HttpFrameSource::new("http://localhost:5000");
//!
//!     let registration = CameraRegistration {
//!         camera_id: "cam-1".to_string(),
//!         name: "Front door".to_string(),
//!         rtsp_url: "rtsp://10.0.0.2/stream".to_string(),
//!         username: "viewer".to_string(),
//!         password: "secret".to_string(),
//!     };
//!
//!     if let Err(e) = source.register_camera(&registration).await {
//!         eprintln!("registration failed: {}", e);
//!     }
//!
//!     match source.fetch_frame("cam-1", Duration::from_millis(50)).await {
//!         Ok(frame) => println!("{}x{} frame at {}", frame.width, frame.height, frame.timestamp),
//!         Err(e) => eprintln!("fetch failed: {}", e),
//!     }
//! }
//! ```

mod client;
mod error;

pub use client::{CameraRegistration, Frame, FrameSource, HttpFrameSource};
pub use error::FetchError;
