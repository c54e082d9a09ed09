//! Presence service: session registry, fan-out and liveness.
//!
//! DESIGN
//! ======
//! Sessions live in `AppState::sessions`, keyed by a server-generated id.
//! Fan-out is best effort: each session has a bounded queue and a full queue
//! drops the message for that session only. Nothing is retried and no order
//! is promised across sessions.
//!
//! LIVENESS
//! ========
//! Any inbound traffic refreshes `last_seen`. The liveness task probes every
//! session on a fixed interval and evicts sessions silent for longer than the
//! timeout. Eviction removes the registry entry, which drops the session's
//! sender and ends its connection task. `user_left` is broadcast by whoever
//! removes the entry, so it goes out exactly once.

use frames::{CursorMoved, Message, Presence};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::state::{AppState, Outbound, PresenceSession};

// =============================================================================
// REGISTRY
// =============================================================================

/// Register a new session. Returns its id and the active session count
/// including it.
pub async fn register(state: &AppState, tx: tokio::sync::mpsc::Sender<Outbound>) -> (Uuid, usize) {
    let session_id = Uuid::new_v4();
    let mut sessions = state.sessions.write().await;
    sessions.insert(session_id, PresenceSession::new(tx, Instant::now()));
    (session_id, sessions.len())
}

/// Remove a session. `None` if it was already gone (e.g. evicted).
pub async fn remove(state: &AppState, session_id: Uuid) -> Option<PresenceSession> {
    state.sessions.write().await.remove(&session_id)
}

pub async fn active_count(state: &AppState) -> usize {
    state.sessions.read().await.len()
}

pub async fn identify(state: &AppState, session_id: Uuid, identity: String) {
    if let Some(session) = state.sessions.write().await.get_mut(&session_id) {
        session.identity = Some(identity);
    }
}

pub async fn identity_of(state: &AppState, session_id: Uuid) -> Option<String> {
    state.sessions.read().await.get(&session_id).and_then(|s| s.identity.clone())
}

pub async fn record_cursor(state: &AppState, session_id: Uuid, cursor: CursorMoved) {
    if let Some(session) = state.sessions.write().await.get_mut(&session_id) {
        session.cursor = Some(cursor);
    }
}

pub async fn touch(state: &AppState, session_id: Uuid) {
    touch_at(state, session_id, Instant::now()).await;
}

pub async fn touch_at(state: &AppState, session_id: Uuid, now: Instant) {
    if let Some(session) = state.sessions.write().await.get_mut(&session_id) {
        session.last_seen = now;
    }
}

// =============================================================================
// FAN-OUT
// =============================================================================

/// Queue `message` for every session except `exclude`.
pub async fn broadcast(state: &AppState, message: &Message, exclude: Option<Uuid>) {
    let sessions = state.sessions.read().await;
    for (session_id, session) in sessions.iter() {
        if exclude == Some(*session_id) {
            continue;
        }
        // Best-effort: if a session's queue is full, skip it.
        let _ = session.tx.try_send(Outbound::Message(message.clone()));
    }
}

/// Tell everyone still connected that `session_id` is gone.
pub async fn announce_departure(state: &AppState, session_id: Uuid) {
    let left = Message::UserLeft(Presence { session_id: session_id.to_string(), timestamp: frames::now_ms() });
    broadcast(state, &left, None).await;
}

// =============================================================================
// LIVENESS
// =============================================================================

/// Evict sessions silent for longer than the liveness timeout as of `now`,
/// broadcast `user_left` for each, and return the evicted ids.
pub async fn sweep_at(state: &AppState, now: Instant) -> Vec<Uuid> {
    let timeout = state.config.liveness_timeout;
    let evicted: Vec<Uuid> = {
        let mut sessions = state.sessions.write().await;
        let stale: Vec<Uuid> = sessions
            .iter()
            .filter(|(_, s)| now.saturating_duration_since(s.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            sessions.remove(id);
        }
        stale
    };

    for session_id in &evicted {
        info!(%session_id, "presence: evicted silent session");
        announce_departure(state, *session_id).await;
    }
    evicted
}

/// Queue a liveness probe for every session.
pub async fn ping_all(state: &AppState) {
    let sessions = state.sessions.read().await;
    for session in sessions.values() {
        let _ = session.tx.try_send(Outbound::Ping);
    }
}

/// Spawn the periodic sweep-then-probe task.
pub fn spawn_liveness_task(state: AppState) -> JoinHandle<()> {
    tokio::spawn(async move {
        let period = state.config.ping_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let evicted = sweep_at(&state, Instant::now()).await;
            ping_all(&state).await;
            debug!(evicted = evicted.len(), "presence: liveness sweep");
        }
    })
}

#[cfg(test)]
#[path = "presence_test.rs"]
mod tests;
