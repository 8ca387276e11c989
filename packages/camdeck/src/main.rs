use anyhow::{Context, Result};
use axum::{Router, routing::get};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use uuid::Uuid;

mod broadcast;
mod config;
mod directory;
mod handlers;
mod metrics;
mod registry;
mod session;
mod tracker;
mod ws;

use frame_source::HttpFrameSource;

use crate::broadcast::Broadcaster;
use crate::config::{FileConfig, StreamConfig, load_config};
use crate::directory::{CameraDirectory, StaticDirectory};
use crate::metrics::ServerMetrics;
use crate::registry::SessionRegistry;
use crate::tracker::ConnectionTracker;

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "camdeck")]
#[command(about = "Camera surveillance stream relay")]
struct Cli {
    /// Host to bind to (overrides config)
    #[arg(short = 'b', long)]
    host: Option<String>,

    /// Port for the web server (overrides config)
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory containing config.toml
    #[arg(long, default_value = ".")]
    config_dir: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

/// Shared state passed to all handlers
#[derive(Clone)]
pub(crate) struct AppState {
    pub registry: Arc<SessionRegistry<HttpFrameSource>>,
    pub directory: Arc<dyn CameraDirectory>,
    pub tracker: Arc<ConnectionTracker>,
    pub metrics: Arc<ServerMetrics>,
    pub stream_config: StreamConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let default_directive = if cli.debug {
        "camdeck=debug,tower_http=debug,info"
    } else {
        "camdeck=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    info!("Starting Camdeck - camera surveillance stream relay");

    let file_config: FileConfig = load_config(&cli.config_dir)
        .extract()
        .context("Invalid configuration")?;

    let host = cli
        .host
        .or(file_config.server.host.clone())
        .unwrap_or_else(|| "127.0.0.1".to_string());
    let port = cli.port.or(file_config.server.port).unwrap_or(3001);
    let stream_config = StreamConfig::from_file(&file_config.stream);

    let directory = Arc::new(StaticDirectory::from_entries(&file_config.cameras));
    if directory.is_empty() {
        warn!("no cameras configured, all start requests will be rejected");
    } else {
        info!(cameras = directory.len(), "camera directory loaded");
    }

    let metrics = Arc::new(ServerMetrics::new());
    let broadcaster = Arc::new(Broadcaster::new(metrics.clone()));
    let source = Arc::new(HttpFrameSource::new(&file_config.upstream.base_url));
    info!(upstream = %file_config.upstream.base_url, "using upstream detection engine");

    let registry = Arc::new(SessionRegistry::new(
        source,
        broadcaster,
        stream_config.clone(),
        metrics.clone(),
    ));
    let tracker = Arc::new(ConnectionTracker::new());

    let app_state = AppState {
        registry: registry.clone(),
        directory,
        tracker,
        metrics,
        stream_config,
    };

    let app = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/health/live", get(handlers::health_live_handler))
        .route("/metrics", get(handlers::metrics_handler))
        .route("/api/ws", get(handlers::stream_websocket_handler))
        .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
        .layer(CorsLayer::permissive())
        .with_state(app_state);

    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .with_context(|| format!("Invalid bind address {}:{}", host, port))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("Camdeck listening on http://{}", actual_addr);
    info!("Endpoints:");
    info!("  GET /health      - readiness");
    info!("  GET /health/live - liveness");
    info!("  GET /metrics     - counters and per-session detail");
    info!("  GET /api/ws      - streaming WebSocket");

    // Create shutdown signal handler
    let shutdown_signal = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
        info!("Received shutdown signal, cleaning up...");
    };

    // Run server with graceful shutdown
    let server_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("Server error");

    // Perform cleanup after shutdown
    info!("Stopping live sessions...");
    registry.shutdown_all().await;
    info!("Shutdown complete");

    server_result
}
