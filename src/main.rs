use std::sync::Arc;

use infinitune_core::config::AppConfig;
use infinitune_core::services::audio_queue::AudioQueue;
use infinitune_core::services::circuit_breaker::CircuitBreaker;
use infinitune_core::services::endpoint_queue::EndpointQueue;
use infinitune_core::services::external::{FakeAudioService, FakeImageGenerator, FakeTextGenerator};
use infinitune_core::services::settings::SettingsStore;
use infinitune_core::services::song_worker::SongWorkerDeps;
use infinitune_core::services::{EventBus, Store, Supervisor};
use infinitune_core::{create_router, AppState, MetricsCollector};

const DEFAULT_MAX_CONCURRENCY: usize = 3;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let environment = infinitune_core::config::Environment::from_env();
    init_tracing(environment);

    let config = AppConfig::from_env().map_err(|e| anyhow::anyhow!(e.to_string()))?;

    tracing::info!(
        environment = ?config.environment,
        bind = %config.server.bind_address(),
        "starting infinitune-core"
    );

    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .acquire_timeout(config.database.acquire_timeout)
        .connect(&config.database.url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;

    let events = EventBus::new();
    let store = Store::new(pool, events);
    let settings = SettingsStore::new(store.clone());

    let job_settings = settings.job_settings().await?;
    let text_concurrency = job_settings.text_max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);
    let image_concurrency = job_settings.image_max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY);

    let metrics = Arc::new(MetricsCollector::new().map_err(|e| anyhow::anyhow!(e.to_string()))?);

    let circuit_breaker = Arc::new(
        CircuitBreaker::new()
            .with_metrics(&metrics.registry())
            .map_err(|e| anyhow::anyhow!(e.to_string()))?,
    );

    // No production TextGenerator/ImageGenerator/AudioService adapter ships
    // in this crate (§6): the fakes double as the default runtime
    // implementation until a real adapter is wired in their place.
    let audio_service = Arc::new(FakeAudioService::new());

    let deps = SongWorkerDeps {
        store: store.clone(),
        settings,
        text_queue: Arc::new(EndpointQueue::new(text_concurrency)),
        image_queue: Arc::new(EndpointQueue::new(image_concurrency)),
        audio_queue: Arc::new(AudioQueue::new(audio_service.clone())),
        text_generator: Arc::new(FakeTextGenerator::new()),
        image_generator: Arc::new(FakeImageGenerator::new()),
        audio_service,
        circuit_breaker,
        music_root: config.storage.music_root.clone(),
        metrics: metrics.clone(),
    };

    let supervisor = Arc::new(Supervisor::new(store.clone(), deps.clone()));
    supervisor.recover().await?;

    let supervisor_loop = supervisor.clone();
    let supervisor_handle = tokio::spawn(async move {
        supervisor_loop.run().await;
    });

    let state = AppState {
        store,
        deps,
        supervisor: supervisor.clone(),
        metrics,
    };

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    tracing::info!(bind = %config.server.bind_address(), "listening");

    let app = create_router(state);

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "server exited with error");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    supervisor.request_shutdown();
    let _ = supervisor_handle.await;

    Ok(())
}

fn init_tracing(environment: infinitune_core::config::Environment) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if environment.is_production() {
        fmt().json().with_env_filter(filter).init();
    } else {
        fmt().pretty().with_env_filter(filter).init();
    }
}
