//! Sync orchestrator: ties the store to the ledger and the relay.
//!
//! DESIGN
//! ======
//! [`SyncEngine`] is the surface the rendering layer talks to. Writes go
//! out optimistically: every cell of a batch is shown as pending before the
//! ledger call, rolled back at once if the ledger refuses, and otherwise
//! left to be displaced by the confirmation or expired by a timer.
//!
//! One event loop ([`SyncEngine::spawn`]) consumes the ledger's
//! confirmation stream, decoded relay messages, and a periodic sweep. The
//! loop never decides ordering itself; every cell goes through the store's
//! version rule.

#[cfg(test)]
#[path = "sync_test.rs"]
mod sync_test;

use std::future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frames::{CanvasStats, Message, PixelPainted, Rgb};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use crate::consts::{PENDING_TIMEOUT, RELAYED_HINT_TTL, SWEEP_INTERVAL};
use crate::error::ErrorCode;
use crate::grid::Coord;
use crate::ledger::{Ledger, LedgerError, PixelWrite, WriteHandle};
use crate::raster::Shape;
use crate::region::{RefreshReport, RegionConfig, RegionLoader};
use crate::relay::{ConnectionStatus, RelayError, RelayHandle};
use crate::selection::SelectionEngine;
use crate::store::{Cell, CellChange, Cursor, PendingToken, SharedCellStore};

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("no committed selection")]
    NothingCommitted,
    #[error("selection covers no cells")]
    EmptySelection,
    #[error("coordinate ({x}, {y}) is outside the grid")]
    OutOfBounds { x: u32, y: u32 },
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ErrorCode for SyncError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::NothingCommitted => "E_NOTHING_COMMITTED",
            Self::EmptySelection => "E_EMPTY_SELECTION",
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
            Self::Ledger(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Ledger(e) if e.retryable())
    }
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Identity put on relayed paints; the hub falls back to the session's
    /// bound identity when empty.
    pub identity: Option<String>,
    pub pending_timeout: Duration,
    pub relayed_hint_ttl: Duration,
    pub sweep_interval: Duration,
    pub region: RegionConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            identity: None,
            pending_timeout: PENDING_TIMEOUT,
            relayed_hint_ttl: RELAYED_HINT_TTL,
            sweep_interval: SWEEP_INTERVAL,
            region: RegionConfig::default(),
        }
    }
}

#[derive(Default)]
struct EngineState {
    session_id: Option<String>,
    latest_stats: Option<CanvasStats>,
}

// =============================================================================
// ENGINE
// =============================================================================

pub struct SyncEngine {
    store: SharedCellStore,
    ledger: Arc<dyn Ledger>,
    regions: RegionLoader,
    relay: Option<RelayHandle>,
    selection: Mutex<SelectionEngine>,
    state: Mutex<EngineState>,
    config: SyncConfig,
}

impl SyncEngine {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, store: SharedCellStore, relay: Option<RelayHandle>, config: SyncConfig) -> Self {
        let grid = store.lock().grid();
        let regions = RegionLoader::new(Arc::clone(&ledger), store.clone(), config.region);
        Self {
            store,
            ledger,
            regions,
            relay,
            selection: Mutex::new(SelectionEngine::new(grid)),
            state: Mutex::new(EngineState::default()),
            config,
        }
    }

    fn selection(&self) -> MutexGuard<'_, SelectionEngine> {
        self.selection.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn store(&self) -> &SharedCellStore {
        &self.store
    }

    #[must_use]
    pub fn regions(&self) -> &RegionLoader {
        &self.regions
    }

    // =========================================================================
    // EVENT LOOP
    // =========================================================================

    /// Subscribe to ledger confirmations and start the event loop.
    ///
    /// The subscription is taken before this returns, so no confirmation
    /// emitted afterwards is missed.
    pub fn spawn(self: &Arc<Self>, relay_events: Option<mpsc::Receiver<Message>>) -> JoinHandle<()> {
        let confirmed = self.ledger.subscribe_confirmed();
        tokio::spawn(Arc::clone(self).run(confirmed, relay_events))
    }

    async fn run(self: Arc<Self>, mut confirmed: broadcast::Receiver<Cell>, mut relay_events: Option<mpsc::Receiver<Message>>) {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("sync: event loop started");

        loop {
            tokio::select! {
                result = confirmed.recv() => match result {
                    Ok(cell) => self.handle_confirmed(cell),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "sync: confirmation stream lagged; refreshing regions");
                        self.regions.refresh().await;
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("sync: ledger subscription closed; event loop stopping");
                        return;
                    }
                },
                event = next_relay_event(&mut relay_events) => match event {
                    Some(message) => self.handle_relay(message),
                    None => {
                        warn!("sync: relay stream ended; continuing on ledger confirmations");
                        relay_events = None;
                    }
                },
                _ = sweep.tick() => self.sweep_at(Instant::now()),
            }
        }
    }

    /// Apply one ledger confirmation.
    pub fn handle_confirmed(&self, cell: Cell) {
        let coord = cell.coord;
        let outcome = self.store.lock().upsert(cell);
        trace!(x = coord.x, y = coord.y, ?outcome, "sync: confirmation merged");
        self.regions.note_touched(coord);
    }

    /// Apply one message received from the hub.
    pub fn handle_relay(&self, message: Message) {
        match message {
            Message::PixelPainted(paint) => self.apply_hint(&paint),
            Message::CursorMoved(cursor) => {
                if self.state().session_id.as_deref() == Some(cursor.session_id.as_str()) {
                    return;
                }
                self.store.lock().update_cursor(&cursor.session_id, cursor.x, cursor.y, cursor.color);
            }
            Message::UserJoined(presence) => debug!(session_id = %presence.session_id, "sync: peer joined"),
            Message::UserLeft(presence) => {
                self.store.lock().remove_cursor(&presence.session_id);
                debug!(session_id = %presence.session_id, "sync: peer left");
            }
            Message::Welcome(welcome) => {
                info!(session_id = %welcome.session_id, active = welcome.active_sessions, replay = welcome.recent_paints.len(), "sync: welcomed by hub");
                self.state().session_id = Some(welcome.session_id);
                for paint in &welcome.recent_paints {
                    self.apply_hint(paint);
                }
            }
            Message::CanvasStats(stats) => self.state().latest_stats = Some(stats),
            Message::RegionData(data) => {
                for paint in &data.pixels {
                    self.apply_hint(paint);
                }
            }
            Message::CanvasData(data) => {
                for paint in &data.pixels {
                    self.apply_hint(paint);
                }
                self.state().latest_stats = Some(data.stats);
            }
            Message::Error(err) => warn!(message = %err.message, "sync: hub reported an error"),
            Message::Identify(_) | Message::JoinRegion(_) | Message::RequestCanvasData => {
                debug!(kind = message.kind(), "sync: ignoring client-bound message");
            }
        }
    }

    fn apply_hint(&self, paint: &PixelPainted) {
        let cell = Cell::relayed(Coord::new(paint.x, paint.y), paint.color, &paint.owner);
        self.store.lock().upsert(cell);
    }

    /// Drop expired cursors and relay hints that never got confirmed.
    pub fn sweep_at(&self, now: Instant) {
        let mut store = self.store.lock();
        let cursors = store.sweep_cursors_at(now);
        let hints = store.sweep_unconfirmed_at(now, self.config.relayed_hint_ttl);
        if cursors + hints > 0 {
            trace!(cursors, hints, "sync: sweep");
        }
    }

    // =========================================================================
    // WRITES
    // =========================================================================

    /// Paint one cell. Returns `Ok(None)` when the cell already has a
    /// pending write in flight.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::OutOfBounds`] for coordinates off the grid and
    /// [`SyncError::Ledger`] when the ledger refuses the write.
    pub async fn paint(&self, x: u32, y: u32, color: Rgb) -> Result<Option<WriteHandle>, SyncError> {
        let coord = Coord::new(x, y);
        {
            let store = self.store.lock();
            if !store.grid().contains(coord) {
                return Err(SyncError::OutOfBounds { x, y });
            }
            if store.has_pending(coord) {
                debug!(x, y, "sync: paint skipped; write already pending");
                return Ok(None);
            }
        }
        self.submit(&[PixelWrite { coord, color }]).await.map(Some)
    }

    /// Submit the committed selection as one batch in `color`. The
    /// submitted selection is cleared on success and kept on failure. A
    /// selection started while the write was in flight is left alone.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::NothingCommitted`] or
    /// [`SyncError::EmptySelection`] when there is nothing to write, and
    /// [`SyncError::Ledger`] when the ledger refuses the batch.
    pub async fn submit_selection(&self, color: Rgb) -> Result<WriteHandle, SyncError> {
        let (submitted, pixels) = {
            let selection = self.selection();
            let pixels = selection.committed_pixels().ok_or(SyncError::NothingCommitted)?;
            (selection.current().cloned(), pixels)
        };
        if pixels.is_empty() {
            return Err(SyncError::EmptySelection);
        }
        let writes: Vec<PixelWrite> = pixels.into_iter().map(|coord| PixelWrite { coord, color }).collect();

        let handle = self.submit(&writes).await?;
        let mut selection = self.selection();
        if selection.current() == submitted.as_ref() {
            selection.clear();
        }
        Ok(handle)
    }

    async fn submit(&self, writes: &[PixelWrite]) -> Result<WriteHandle, SyncError> {
        let tokens: Vec<(Coord, PendingToken)> = {
            let mut store = self.store.lock();
            writes.iter().filter_map(|w| store.add_pending(w.coord, w.color).map(|t| (w.coord, t))).collect()
        };

        match self.ledger.submit_write(writes).await {
            Ok(handle) => {
                info!(tx = %handle.tx_hash, cells = handle.cells, "sync: write submitted");
                self.relay_paints(writes, &handle);
                self.arm_expiry(tokens);
                Ok(handle)
            }
            Err(e) => {
                let mut store = self.store.lock();
                for (coord, token) in tokens {
                    store.expire_pending_token(coord, token);
                }
                warn!(error = %e, code = e.error_code(), cells = writes.len(), "sync: write failed; pending cells rolled back");
                Err(e.into())
            }
        }
    }

    fn relay_paints(&self, writes: &[PixelWrite], handle: &WriteHandle) {
        let owner = self.config.identity.clone().unwrap_or_default();
        let timestamp = frames::now_ms();
        for w in writes {
            let paint = PixelPainted {
                x: w.coord.x,
                y: w.coord.y,
                color: w.color,
                owner: owner.clone(),
                timestamp,
                tx_hash: Some(handle.tx_hash.clone()),
            };
            if let Err(e) = self.send_relay(Message::PixelPainted(paint)) {
                debug!(error = %e, "sync: paint not relayed");
                break;
            }
        }
    }

    fn arm_expiry(&self, tokens: Vec<(Coord, PendingToken)>) {
        if tokens.is_empty() {
            return;
        }
        let store = self.store.clone();
        let timeout = self.config.pending_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut store = store.lock();
            let expired = tokens.into_iter().filter(|(coord, token)| store.expire_pending_token(*coord, *token)).count();
            if expired > 0 {
                warn!(expired, "sync: pending writes timed out without confirmation");
            }
        });
    }

    // =========================================================================
    // PRESENCE
    // =========================================================================

    fn send_relay(&self, message: Message) -> Result<(), RelayError> {
        match &self.relay {
            Some(relay) => relay.send(message),
            None => Err(RelayError::NotConnected),
        }
    }

    /// Best-effort cursor ping.
    ///
    /// # Errors
    ///
    /// Returns the [`RelayError`] when the ping could not be queued.
    pub fn move_cursor(&self, x: u32, y: u32, color: Rgb) -> Result<(), RelayError> {
        let session_id = self.state().session_id.clone().unwrap_or_default();
        self.send_relay(Message::CursorMoved(frames::CursorMoved { session_id, x, y, color, timestamp: frames::now_ms() }))
    }

    #[must_use]
    pub fn relay_status(&self) -> ConnectionStatus {
        self.relay.as_ref().map_or(ConnectionStatus::Disconnected, RelayHandle::status)
    }

    #[must_use]
    pub fn session_id(&self) -> Option<String> {
        self.state().session_id.clone()
    }

    #[must_use]
    pub fn latest_stats(&self) -> Option<CanvasStats> {
        self.state().latest_stats.clone()
    }

    // =========================================================================
    // RENDERING SURFACE
    // =========================================================================

    #[must_use]
    pub fn get_cell(&self, x: u32, y: u32) -> Option<Cell> {
        self.store.lock().get(Coord::new(x, y)).cloned()
    }

    #[must_use]
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CellChange> {
        self.store.lock().subscribe()
    }

    #[must_use]
    pub fn active_cursors(&self) -> Vec<Cursor> {
        self.store.lock().active_cursors()
    }

    pub fn set_shape(&self, shape: Shape) {
        self.selection().set_shape(shape);
    }

    pub fn begin_selection(&self, shape: Shape, x: i32, y: i32) {
        self.selection().begin(shape, x, y);
    }

    pub fn extend_selection(&self, x: i32, y: i32) -> bool {
        self.selection().extend(x, y)
    }

    pub fn commit_selection(&self) -> bool {
        self.selection().commit()
    }

    pub fn clear_selection(&self) {
        self.selection().clear();
    }

    #[must_use]
    pub fn selection_pixels(&self) -> Vec<Coord> {
        self.selection().pixels()
    }

    /// Cost of the current selection at the ledger's current price, or
    /// `None` on overflow.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::Ledger`] when the price cannot be read.
    pub async fn selection_cost(&self) -> Result<Option<u128>, SyncError> {
        let price = self.ledger.unit_price().await?;
        Ok(self.selection().cost(price))
    }

    // =========================================================================
    // REGIONS
    // =========================================================================

    /// Re-read the coverage set and recently touched tiles.
    pub async fn refresh(&self) -> RefreshReport {
        self.regions.refresh().await
    }
}

async fn next_relay_event(events: &mut Option<mpsc::Receiver<Message>>) -> Option<Message> {
    match events {
        Some(rx) => rx.recv().await,
        None => future::pending().await,
    }
}
