//! Shared hub state.
//!
//! DESIGN
//! ======
//! `AppState` is injected into Axum handlers via the `State` extractor. It
//! owns the session registry and the paint history. Each session is one
//! WebSocket connection with a bounded outbound queue; dropping its sender
//! from the registry is what ends the connection task.

use std::collections::HashMap;
use std::sync::Arc;

use frames::{CursorMoved, Message};
use tokio::sync::{RwLock, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::HubConfig;
use crate::services::history::PaintHistory;

// =============================================================================
// SESSION
// =============================================================================

/// Item queued for delivery to one session.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(Message),
    /// Liveness probe; the connection task turns it into a ping frame.
    Ping,
}

/// Registry entry for one connected session.
pub struct PresenceSession {
    pub tx: mpsc::Sender<Outbound>,
    /// Identity bound by `identify`. Metadata only, never checked.
    pub identity: Option<String>,
    pub last_seen: Instant,
    /// Last cursor this session reported.
    pub cursor: Option<CursorMoved>,
}

impl PresenceSession {
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>, now: Instant) -> Self {
        Self { tx, identity: None, last_seen: now, cursor: None }
    }
}

// =============================================================================
// APP STATE
// =============================================================================

/// Shared application state. Clone is required by Axum; inner fields are
/// Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    pub config: HubConfig,
    pub sessions: Arc<RwLock<HashMap<Uuid, PresenceSession>>>,
    pub history: Arc<RwLock<PaintHistory>>,
    pub started_at: Instant,
}

impl AppState {
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        Self {
            config,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            history: Arc::new(RwLock::new(PaintHistory::new(config.history_capacity))),
            started_at: Instant::now(),
        }
    }
}

// =============================================================================
// TEST HELPERS
// =============================================================================

#[cfg(test)]
pub mod test_helpers {
    use super::*;
    use frames::PixelPainted;

    #[must_use]
    pub fn test_app_state() -> AppState {
        AppState::new(HubConfig::default())
    }

    /// Register a session directly and return its id and outbound receiver.
    pub async fn seed_session(state: &AppState) -> (Uuid, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(state.config.session_queue);
        let (session_id, _) = crate::services::presence::register(state, tx).await;
        (session_id, rx)
    }

    #[must_use]
    pub fn paint(x: u32, y: u32, owner: &str, timestamp: i64) -> PixelPainted {
        PixelPainted { x, y, color: frames::Rgb::new(0x11_22_33), owner: owner.into(), timestamp, tx_hash: None }
    }
}
