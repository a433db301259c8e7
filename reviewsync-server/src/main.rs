use anyhow::Result;
use axum::{http::StatusCode, response::Json, routing::get, Router};
use serde_json::json;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use reviewsync_server::config::Config;
use reviewsync_server::github::GitHubClient;
use reviewsync_server::http::create_http_client;
use reviewsync_server::tracker::TrackerClient;
use reviewsync_server::webhook::webhook_router;
use reviewsync_server::{AppState, SqliteLeaseStore};

async fn health_check() -> Result<Json<serde_json::Value>, StatusCode> {
    Ok(Json(json!({
        "status": "healthy",
        "service": "reviewsync",
        "version": reviewsync_server::get_service_version()
    })))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!(
        "Starting reviewsync {}",
        reviewsync_server::get_service_version()
    );

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let http_client = create_http_client()?;
    let github_client = GitHubClient::new(
        http_client.clone(),
        config.github_api_url.clone(),
        config.github_auth.clone(),
    );
    let tracker_client = TrackerClient::new(
        http_client,
        config.tracker_api_url.clone(),
        config.tracker_api_token.clone(),
    );

    let db_path = config.state_db_path();
    info!("Using lease database: {}", db_path.display());
    let lease_store = SqliteLeaseStore::new(&db_path).expect("Failed to initialize SQLite database");

    match config.gate.coalesce_window {
        Some(window) => info!("Coalescing triggers within {}ms", window.as_millis()),
        None => info!("Trigger coalescing disabled"),
    }

    let app_state = Arc::new(AppState {
        github_client,
        tracker_client,
        lease_store: Arc::new(lease_store),
        gate_config: config.gate,
        engine_settings: config.engine.clone(),
        webhook_secret: config.github_webhook_secret.clone().unwrap_or_default(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .merge(webhook_router(app_state.clone()))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
