mod config;
mod routes;
mod services;
mod state;

use tracing::{info, warn};

use crate::config::HubConfig;
use crate::services::{presence, stats};

#[derive(Debug, thiserror::Error)]
enum HubError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("server failed: {0}")]
    Serve(#[source] std::io::Error),
}

#[tokio::main]
async fn main() -> Result<(), HubError> {
    let dotenv = dotenvy::dotenv();
    tracing_subscriber::fmt::init();
    if let Ok(path) = dotenv {
        info!(path = %path.display(), "loaded environment file");
    }

    let config = HubConfig::from_env();
    let state = state::AppState::new(config);

    // Background liveness sweep and stats broadcast.
    let _liveness = presence::spawn_liveness_task(state.clone());
    let _stats = stats::spawn_stats_task(state.clone());

    let app = routes::app(state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|source| HubError::Bind { addr: addr.clone(), source })?;

    info!(port = config.port, "pixelverse hub listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(HubError::Serve)?;

    info!("pixelverse hub stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for ctrl-c; running until killed");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
