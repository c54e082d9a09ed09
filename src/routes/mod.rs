//! Router assembly.
//!
//! SYSTEM CONTEXT
//! ==============
//! One Axum router serves the `/ws` relay upgrade plus two read-only HTTP
//! endpoints: `/health` for probes and `/api/canvas-data` for clients that
//! want the recent-paint snapshot without opening a socket.

pub mod ws;

use axum::Router;
use axum::extract::State;
use axum::response::Json;
use axum::routing::get;
use frames::CanvasData;
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::services::{presence, stats};
use crate::state::AppState;

/// Build the hub router.
pub fn app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/ws", get(ws::handle_ws))
        .route("/health", get(health))
        .route("/api/canvas-data", get(canvas_data))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Health {
    status: &'static str,
    active_sessions: usize,
    total_paints: usize,
    uptime_secs: u64,
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(Health {
        status: "ok",
        active_sessions: presence::active_count(&state).await,
        total_paints: state.history.read().await.len(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

async fn canvas_data(State(state): State<AppState>) -> Json<CanvasData> {
    Json(stats::canvas_data(&state).await)
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
