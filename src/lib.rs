//! Infinitune Song Generation Core
//!
//! An endless/one-shot generative-music playlist pipeline: per-song state
//! machines driven through text metadata, cover art, and audio generation by
//! bounded-concurrency admission queues, supervised per-playlist and
//! system-wide.

use axum::{routing::get, routing::post, routing::put, routing::delete, Router};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub mod config;
pub mod error;
pub mod health;
pub mod metrics;
pub mod models;
pub mod services;

pub mod handlers;
pub mod middleware;

pub use config::{AppConfig, ConfigError, DatabaseSettings, Environment, ServerConfig, StorageSettings};
pub use error::{AppError, ErrorResponse, Result};
pub use health::{liveness_check, readiness_check, HealthCheckResponse, HealthChecker, HealthStatus};
pub use metrics::{metrics_handler, DatabaseMetrics, MetricsCollector, RequestTimer};
pub use middleware::create_cors_layer;
pub use services::song_worker::SongWorkerDeps;
pub use services::{EventBus, Store, Supervisor};

/// Application state shared across every handler.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub deps: SongWorkerDeps,
    pub supervisor: Arc<Supervisor>,
    pub metrics: Arc<MetricsCollector>,
}

/// Build the axum router exposing the playlist/song/queue surface (§0.4).
pub fn create_router(state: AppState) -> Router {
    let playlist_routes = Router::new()
        .route("/", post(handlers::playlists::create_playlist_handler))
        .route("/", get(handlers::playlists::list_playlists_handler))
        .route("/:id", get(handlers::playlists::get_playlist_handler))
        .route("/:id", delete(handlers::playlists::delete_playlist_handler))
        .route("/:id/steer", post(handlers::playlists::steer_handler))
        .route("/:id/heartbeat", post(handlers::playlists::heartbeat_handler))
        .route("/:id/close", post(handlers::playlists::close_handler))
        .route("/:id/work-queue", get(handlers::playlists::get_work_queue_handler))
        .route("/:id/songs", post(handlers::songs::create_song_handler));

    let song_routes = Router::new()
        .route("/:id", get(handlers::songs::get_song_handler))
        .route("/:id/rating", put(handlers::songs::rate_song_handler))
        .route("/:id/listen", post(handlers::songs::record_listen_handler))
        .route("/:id/cancel", post(handlers::songs::cancel_song_handler));

    Router::new()
        .route("/health", get(health_check))
        .route("/health/ready", get(readiness_check_endpoint))
        .route("/health/live", get(liveness_check_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/events", get(handlers::events::events_handler))
        .nest("/api/v1/playlists", playlist_routes)
        .nest("/api/v1/songs", song_routes)
        .route("/api/v1/queues", get(handlers::queues::get_queues_handler))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()).layer(create_cors_layer()))
        .with_state(state)
}

async fn health_check(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> axum::response::Json<HealthCheckResponse> {
    let checker = HealthChecker::new();
    let response = checker.check_health(state.store.pool()).await;

    tracing::info!(status = ?response.status, correlation_id = %response.correlation_id, "health check completed");
    axum::response::Json(response)
}

async fn readiness_check_endpoint(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<axum::response::Json<serde_json::Value>> {
    readiness_check(state.store.pool()).await?;
    Ok(axum::response::Json(serde_json::json!({
        "status": "ready",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn liveness_check_endpoint() -> Result<axum::response::Json<serde_json::Value>> {
    liveness_check().await?;
    Ok(axum::response::Json(serde_json::json!({
        "status": "alive",
        "timestamp": chrono::Utc::now().to_rfc3339(),
    })))
}

async fn metrics_endpoint(axum::extract::State(state): axum::extract::State<AppState>) -> impl axum::response::IntoResponse {
    metrics::metrics_handler(axum::extract::State(state.metrics)).await
}
