//! Service entry point: configuration, state graph, recovery sweep, HTTP
//! listener.

use caseworker::api::build_app;
use caseworker::state::AppState;
use caseworker::storage::ConfigService;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_service = ConfigService::new()?;
    let config = config_service.get_clone();
    let addr = format!("{}:{}", config.server.host, config.server.port);

    let state = AppState::initialize(config_service, None, None)?;

    // Recovery runs before the listener accepts work: stale tasks fail with
    // ServerRestart, fresh ones re-enter the queue
    state.start()?;

    let app = build_app(state.clone());
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "caseworker listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            state.scheduler.shutdown();
        })
        .await?;

    Ok(())
}
