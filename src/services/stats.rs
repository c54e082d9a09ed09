//! Periodic `canvas_stats` broadcast and snapshot builders.

use frames::{CanvasData, CanvasStats, Message};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::services::presence;
use crate::state::AppState;

/// Current stats over the paint history.
pub async fn snapshot(state: &AppState) -> CanvasStats {
    let active = presence::active_count(state).await;
    state.history.read().await.stats_at(active, frames::now_ms())
}

/// Body of `canvas_data` and `GET /api/canvas-data`.
pub async fn canvas_data(state: &AppState) -> CanvasData {
    let active = presence::active_count(state).await;
    let history = state.history.read().await;
    CanvasData {
        pixels: history.recent(state.config.canvas_data_replay),
        active_sessions: active,
        stats: history.stats_at(active, frames::now_ms()),
    }
}

/// Spawn the task that broadcasts `canvas_stats` to every session.
pub fn spawn_stats_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.config.stats_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if presence::active_count(&state).await == 0 {
                continue;
            }
            let stats = snapshot(&state).await;
            presence::broadcast(&state, &Message::CanvasStats(stats), None).await;
        }
    })
}

#[cfg(test)]
#[path = "stats_test.rs"]
mod tests;
