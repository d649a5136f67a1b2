//! Mail Web Server - notification trigger.
//!
//! This binary provides a thin web server that:
//! - Accepts notification requests
//! - Publishes them to the mail queue with broker confirmation and retries
//! - Reports publish failures in logs without failing the request
//!
//! Recording happens in the `mail-consumer` process.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use mailpipe::util::shutdown_signal;
use mailpipe::web::{health, notify, AppState};
use mailpipe::{Config, Publisher};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize structured JSON logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().flatten_event(true))
        .init();

    info!("web_server_starting");

    // Load configuration
    let config = Config::from_env();
    info!(
        port = config.port,
        queue = %config.queue_name,
        enable_emails = config.enable_emails,
        publish_max_retries = config.publish_max_retries,
        "config_loaded"
    );

    // Publisher dials per attempt, so there is nothing to close on shutdown
    let publisher = Arc::new(Publisher::from_config(&config));

    // Create application state
    let state = AppState::new(config.clone(), publisher);

    // Build the router
    let app = Router::new()
        .route("/health", get(health))
        .route("/notifications", post(notify))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Bind to address
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = TcpListener::bind(addr)
        .await
        .context("Failed to bind to address")?;

    info!(address = %addr, "web_server_listening");

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            shutdown_signal().await;
            info!("web_server_shutting_down");
        })
        .await
        .context("Server error")?;

    info!("web_server_shutdown_complete");

    Ok(())
}
