use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::warn;

// =============================================================================
// Unified config (figment-deserialized from defaults / config.toml / env vars)
// =============================================================================
//
// Two equivalent ways to configure:
//
//   config.toml:     [stream]
//                    tick_ms = 100
//
//   env var:         CAMDECK_STREAM__TICK_MS=100   (double underscore = nesting)
//
//   (single underscore stays within field names: CAMDECK_STREAM__ERROR_THRESHOLD)

/// Top-level tunable configuration, deserialized by figment.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerFileConfig,
    #[serde(default)]
    pub upstream: UpstreamFileConfig,
    #[serde(default)]
    pub stream: StreamFileConfig,
    #[serde(default)]
    pub cameras: Vec<CameraEntry>,
}

/// Server tuning knobs (lives under `[server]` in config.toml).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ServerFileConfig {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

/// Upstream detection-engine settings (lives under `[upstream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpstreamFileConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

impl Default for UpstreamFileConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
        }
    }
}

/// Stream session tunables (lives under `[stream]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StreamFileConfig {
    /// Poll cadence per camera session, in milliseconds (~15fps default).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Per-fetch deadline, in milliseconds. Must stay below tick_ms.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    /// Consecutive fetch failures before a session gives up.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Event buffer per subscriber connection.
    #[serde(default = "default_subscriber_buffer")]
    pub subscriber_buffer: usize,
}

impl Default for StreamFileConfig {
    fn default() -> Self {
        Self {
            tick_ms: default_tick_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            error_threshold: default_error_threshold(),
            subscriber_buffer: default_subscriber_buffer(),
        }
    }
}

/// One camera record (lives under `[[cameras]]` in config.toml).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CameraEntry {
    pub id: String,
    pub name: String,
    pub rtsp_url: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_base_url() -> String {
    "http://localhost:5000".to_string()
}
fn default_tick_ms() -> u64 {
    66
}
fn default_fetch_timeout_ms() -> u64 {
    50
}
fn default_error_threshold() -> u32 {
    20
}
fn default_subscriber_buffer() -> usize {
    32
}

/// Build a figment that layers: defaults → config.toml → CAMDECK_* env vars.
///
/// Env vars use double-underscore for nesting into sections:
///   `CAMDECK_UPSTREAM__BASE_URL=http://engine:5000`  →  `upstream.base_url`
///   `CAMDECK_STREAM__TICK_MS=100`  →  `stream.tick_ms = 100`
pub fn load_config(config_dir: &Path) -> figment::Figment {
    use figment::{
        Figment,
        providers::{Env, Format, Serialized, Toml},
    };

    Figment::from(Serialized::defaults(FileConfig::default()))
        .merge(Toml::file(config_dir.join("config.toml")))
        .merge(Env::prefixed("CAMDECK_").split("__"))
}

// =============================================================================
// Runtime config structs (derived from FileConfig, used throughout the server)
// =============================================================================

/// Stream session configuration (runtime view).
#[derive(Clone, Debug)]
pub struct StreamConfig {
    /// Poll cadence per camera session.
    pub tick_interval: Duration,
    /// Per-fetch deadline, strictly below the tick interval.
    pub fetch_timeout: Duration,
    /// Consecutive fetch failures before a session gives up.
    pub error_threshold: u32,
    /// Event buffer per subscriber connection.
    pub subscriber_buffer: usize,
}

impl StreamConfig {
    /// The fetch deadline must stay below the tick period so one stuck
    /// request cannot pile up behind the cadence; out-of-range values are
    /// clamped rather than rejected.
    pub fn from_file(fc: &StreamFileConfig) -> Self {
        let tick_ms = fc.tick_ms.max(1);
        let mut fetch_timeout_ms = fc.fetch_timeout_ms.max(1);
        if fetch_timeout_ms >= tick_ms {
            let clamped = (tick_ms * 3 / 4).max(1);
            warn!(
                requested = fetch_timeout_ms,
                clamped, "fetch_timeout_ms must be below tick_ms, clamping"
            );
            fetch_timeout_ms = clamped;
        }

        Self {
            tick_interval: Duration::from_millis(tick_ms),
            fetch_timeout: Duration::from_millis(fetch_timeout_ms),
            error_threshold: fc.error_threshold.max(1),
            subscriber_buffer: fc.subscriber_buffer.max(1),
        }
    }
}
