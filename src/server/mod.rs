pub mod api;
pub mod sse;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;

use crate::broker::StreamHub;
use crate::config::ReviveConfig;
use crate::pipeline::PipelineRunner;
use crate::registry::JobRegistry;
use crate::sandbox;

pub use api::{AppState, SharedState};

/// Configuration for the revive server.
pub struct ServerConfig {
    pub port: u16,
    pub work_root: PathBuf,
    pub dev_mode: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 5000,
            work_root: PathBuf::from("./work_dir"),
            dev_mode: false,
        }
    }
}

/// Build the application router: job API plus the per-job SSE stream.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/api/jobs/{id}/stream", get(sse::stream_job))
        .with_state(state)
}

/// Start the revive server.
pub async fn start_server(config: ServerConfig, revive: ReviveConfig) -> Result<()> {
    std::fs::create_dir_all(&config.work_root)
        .context("Failed to create work root directory")?;

    let registry = Arc::new(JobRegistry::new());
    let streams = Arc::new(StreamHub::new());
    let provider = sandbox::provider_from_settings(revive.sandbox.as_ref());
    let runner = Arc::new(PipelineRunner::new(
        Arc::clone(&registry),
        Arc::clone(&streams),
        revive.clone(),
        provider,
    ));

    let state = Arc::new(AppState {
        registry,
        streams,
        runner,
        config: revive,
        work_root: config.work_root.clone(),
    });

    let mut app = build_router(state);
    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Revive running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
