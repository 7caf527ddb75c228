mod error;
mod handlers;
mod metrics;

use autotest_common::config::AutotestConfig;
use axum::{
    routing::{get, post, put},
    Router,
};
use metrics::Metrics;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};

pub struct AppState {
    pub redis: ConnectionManager,
    pub config: AutotestConfig,
    pub metrics: Metrics,
}

fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/register", post(handlers::register))
        .route("/reset_credentials", put(handlers::reset_credentials))
        .route("/schema", get(handlers::schema))
        .route("/settings", post(handlers::create_settings))
        .route(
            "/settings/:settings_id",
            get(handlers::get_settings).put(handlers::update_settings),
        )
        .route("/settings/:settings_id/test", put(handlers::run_tests))
        .route("/settings/:settings_id/test/:tests_id", get(handlers::get_results))
        .route("/status", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Autotest API booting...");

    let config = AutotestConfig::load_default().map_err(|e| {
        error!("Failed to load autotester configuration: {:#}", e);
        e
    })?;

    // Connect to Redis
    let redis_url = config.redis_url();
    let client = redis::Client::open(redis_url.as_str())?;
    let redis_conn = ConnectionManager::new(client).await?;

    info!("Connected to Redis: {}", redis_url);

    let state = Arc::new(AppState {
        redis: redis_conn,
        config,
        metrics: Metrics::new()?,
    });

    // Build router
    let app = routes().with_state(state);

    // Start server
    let addr = std::env::var("API_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app).await?;
    Ok(())
}
