use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use ybs_be::{config::AppConfig, handlers::routes, telemetry, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init();

    let app_config = AppConfig::from_env()?;
    info!("Configuration loaded: {}", serde_json::to_string(&app_config)?);

    let app_state = AppState::new(&app_config).await?;

    match app_state.stops.reload().await {
        Ok(count) => info!("Loaded {} stops from {}", count, app_config.stops_source),
        Err(e) => warn!("Stop table unavailable, starting without stops: {}", e),
    }

    let advisory = app_state.advisory.clone();
    tokio::spawn(async move {
        advisory.probe().await;
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = routes::create_router(app_state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr = app_config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server running on http://{}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}
