//! Cell store: the merged view of what every cell displays.
//!
//! DESIGN
//! ======
//! Each coordinate owns a [`Slot`] with two layers. The *confirmed* layer
//! holds the highest ledger version seen for the cell. The *overlay* holds
//! at most one unconfirmed cell: either a local pending write or a paint the
//! relay broadcast before its ledger confirmation reached us. The overlay,
//! when present, is what the renderer sees.
//!
//! Merge rule for [`CellStore::upsert`]:
//! - confirmed cells (account owner, version ≥ 1) win iff the confirmed
//!   layer is empty or strictly older; winning clears the overlay.
//! - unconfirmed cells land in the overlay only while the coordinate shows
//!   nothing at all. A relay hint never hides a local pending write or an
//!   earlier hint, and the displayed version never goes backwards.
//! - zero-identity cells are ignored.
//!
//! [`CellStore::add_pending`] is the one path that may cover a confirmed cell
//! with an overlay; its [`PendingToken`] lets an expiry timer remove exactly
//! the write it was armed for.
//!
//! Every applied mutation is published as a [`CellChange`] before the call
//! returns.

#[cfg(test)]
#[path = "store_test.rs"]
mod store_test;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use frames::Rgb;
use tokio::sync::broadcast;
use tracing::{debug, trace};

use crate::consts::{CHANGE_CHANNEL_CAPACITY, CURSOR_TTL};
use crate::grid::{Coord, Grid};

/// Owner string that marks a cell nobody has painted yet.
pub const ZERO_IDENTITY: &str = "0x0000000000000000000000000000000000000000";

/// Owner string used on the wire for local unconfirmed writes.
pub const PENDING_IDENTITY: &str = "pending";

// =============================================================================
// CELL
// =============================================================================

/// Who a cell belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Owner {
    /// Never painted.
    Unpainted,
    /// Local optimistic write awaiting the ledger.
    Pending,
    /// A ledger account identity.
    Account(String),
}

impl Owner {
    /// Interpret an identity string as it appears on the wire.
    #[must_use]
    pub fn from_identity(identity: &str) -> Self {
        if identity.is_empty() || identity.eq_ignore_ascii_case(ZERO_IDENTITY) {
            Self::Unpainted
        } else if identity == PENDING_IDENTITY {
            Self::Pending
        } else {
            Self::Account(identity.to_owned())
        }
    }

    #[must_use]
    pub fn identity(&self) -> &str {
        match self {
            Self::Unpainted => ZERO_IDENTITY,
            Self::Pending => PENDING_IDENTITY,
            Self::Account(id) => id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub coord: Coord,
    pub color: Rgb,
    pub owner: Owner,
    /// Ledger timestamp (ms); absent until confirmed.
    pub confirmed_at: Option<i64>,
    /// Per-coordinate ledger counter; 0 for anything unconfirmed.
    pub version: u64,
}

impl Cell {
    /// A local optimistic write.
    #[must_use]
    pub fn pending(coord: Coord, color: Rgb) -> Self {
        Self { coord, color, owner: Owner::Pending, confirmed_at: None, version: 0 }
    }

    /// A ledger-confirmed write.
    #[must_use]
    pub fn confirmed(coord: Coord, color: Rgb, owner: impl Into<String>, version: u64, confirmed_at: i64) -> Self {
        Self { coord, color, owner: Owner::Account(owner.into()), confirmed_at: Some(confirmed_at), version }
    }

    /// A paint seen on the relay, not yet confirmed by the ledger.
    #[must_use]
    pub fn relayed(coord: Coord, color: Rgb, owner: &str) -> Self {
        Self { coord, color, owner: Owner::from_identity(owner), confirmed_at: None, version: 0 }
    }

    /// Whether this cell carries ledger authority.
    #[must_use]
    pub fn is_confirmed(&self) -> bool {
        self.version >= 1 && matches!(self.owner, Owner::Account(_))
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.owner == Owner::Pending
    }
}

/// Notification published for every applied mutation. `cell` is the newly
/// displayed cell, or `None` when the coordinate became blank.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CellChange {
    pub coord: Coord,
    pub cell: Option<Cell>,
}

/// Result of offering a cell to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The displayed state changed.
    Applied,
    /// An equal or newer entry already exists.
    Stale,
    /// The cell carries no information or lies outside the grid.
    Ignored,
}

/// Running counts of merge outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    pub applied: u64,
    pub stale: u64,
    pub ignored: u64,
}

/// Identifies one call to [`CellStore::add_pending`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PendingToken(u64);

// =============================================================================
// CURSOR
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cursor {
    pub id: String,
    pub x: u32,
    pub y: u32,
    pub color: Rgb,
    pub last_seen: Instant,
}

// =============================================================================
// SLOT
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OverlaySource {
    Local(PendingToken),
    Relayed,
}

#[derive(Debug, Clone)]
struct Overlay {
    cell: Cell,
    source: OverlaySource,
    placed_at: Instant,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    confirmed: Option<Cell>,
    overlay: Option<Overlay>,
}

impl Slot {
    fn displayed(&self) -> Option<&Cell> {
        self.overlay.as_ref().map(|o| &o.cell).or(self.confirmed.as_ref())
    }

    fn is_empty(&self) -> bool {
        self.confirmed.is_none() && self.overlay.is_none()
    }
}

// =============================================================================
// STORE
// =============================================================================

pub struct CellStore {
    grid: Grid,
    slots: HashMap<Coord, Slot>,
    cursors: HashMap<String, Cursor>,
    changes: broadcast::Sender<CellChange>,
    next_token: u64,
    stats: MergeStats,
}

impl CellStore {
    #[must_use]
    pub fn new(grid: Grid) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self { grid, slots: HashMap::new(), cursors: HashMap::new(), changes, next_token: 0, stats: MergeStats::default() }
    }

    #[must_use]
    pub fn grid(&self) -> Grid {
        self.grid
    }

    /// Receive every change applied from now on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CellChange> {
        self.changes.subscribe()
    }

    /// The cell currently displayed at `coord`.
    #[must_use]
    pub fn get(&self, coord: Coord) -> Option<&Cell> {
        self.slots.get(&coord).and_then(Slot::displayed)
    }

    /// The highest confirmed cell at `coord`, ignoring any overlay.
    #[must_use]
    pub fn confirmed(&self, coord: Coord) -> Option<&Cell> {
        self.slots.get(&coord).and_then(|s| s.confirmed.as_ref())
    }

    /// Whether `coord` shows a local pending write.
    #[must_use]
    pub fn has_pending(&self, coord: Coord) -> bool {
        self.slots
            .get(&coord)
            .and_then(|s| s.overlay.as_ref())
            .is_some_and(|o| matches!(o.source, OverlaySource::Local(_)))
    }

    /// Number of coordinates with something to display.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[must_use]
    pub fn stats(&self) -> MergeStats {
        self.stats
    }

    /// Offer a cell from any source. See the module docs for the merge rule.
    pub fn upsert(&mut self, cell: Cell) -> MergeOutcome {
        self.upsert_at(cell, Instant::now())
    }

    pub fn upsert_at(&mut self, cell: Cell, now: Instant) -> MergeOutcome {
        let outcome = self.merge(cell, now);
        match outcome {
            MergeOutcome::Applied => self.stats.applied += 1,
            MergeOutcome::Stale => self.stats.stale += 1,
            MergeOutcome::Ignored => self.stats.ignored += 1,
        }
        outcome
    }

    fn merge(&mut self, cell: Cell, now: Instant) -> MergeOutcome {
        if cell.owner == Owner::Unpainted || !self.grid.contains(cell.coord) {
            return MergeOutcome::Ignored;
        }
        let coord = cell.coord;

        if cell.is_confirmed() {
            let slot = self.slots.entry(coord).or_default();
            if slot.confirmed.as_ref().is_some_and(|c| c.version >= cell.version) {
                return MergeOutcome::Stale;
            }
            if slot.overlay.take().is_some() {
                trace!(x = coord.x, y = coord.y, version = cell.version, "store: overlay superseded");
            }
            slot.confirmed = Some(cell);
        } else {
            // Version 0 never beats anything already shown, pending or hinted.
            if self.slots.get(&coord).is_some_and(|s| s.confirmed.is_some() || s.overlay.is_some()) {
                return MergeOutcome::Stale;
            }
            let source = if cell.is_pending() { OverlaySource::Local(self.issue_token()) } else { OverlaySource::Relayed };
            let slot = self.slots.entry(coord).or_default();
            slot.overlay = Some(Overlay { cell, source, placed_at: now });
        }

        self.publish(coord);
        MergeOutcome::Applied
    }

    /// Show a local write immediately, covering whatever is displayed.
    /// Returns `None` for coordinates outside the grid.
    pub fn add_pending(&mut self, coord: Coord, color: Rgb) -> Option<PendingToken> {
        if !self.grid.contains(coord) {
            return None;
        }
        let token = self.issue_token();
        let slot = self.slots.entry(coord).or_default();
        slot.overlay =
            Some(Overlay { cell: Cell::pending(coord, color), source: OverlaySource::Local(token), placed_at: Instant::now() });
        self.publish(coord);
        Some(token)
    }

    /// Remove the pending write at `coord`, if one is still shown.
    /// Returns whether anything was removed.
    pub fn expire_pending(&mut self, coord: Coord) -> bool {
        self.remove_overlay(coord, |source| matches!(source, OverlaySource::Local(_)))
    }

    /// Remove the pending write at `coord` only if it is the one `token`
    /// was issued for.
    pub fn expire_pending_token(&mut self, coord: Coord, token: PendingToken) -> bool {
        self.remove_overlay(coord, |source| source == OverlaySource::Local(token))
    }

    /// Drop relay hints older than `max_age`. Returns how many were dropped.
    pub fn sweep_unconfirmed(&mut self, max_age: Duration) -> usize {
        self.sweep_unconfirmed_at(Instant::now(), max_age)
    }

    pub fn sweep_unconfirmed_at(&mut self, now: Instant, max_age: Duration) -> usize {
        let stale: Vec<Coord> = self
            .slots
            .iter()
            .filter_map(|(coord, slot)| {
                let overlay = slot.overlay.as_ref()?;
                let expired = overlay.source == OverlaySource::Relayed
                    && now.saturating_duration_since(overlay.placed_at) >= max_age;
                expired.then_some(*coord)
            })
            .collect();

        for coord in &stale {
            self.remove_overlay(*coord, |source| source == OverlaySource::Relayed);
        }
        if !stale.is_empty() {
            debug!(dropped = stale.len(), "store: swept unconfirmed relay hints");
        }
        stale.len()
    }

    fn remove_overlay(&mut self, coord: Coord, matches: impl Fn(OverlaySource) -> bool) -> bool {
        let Some(slot) = self.slots.get_mut(&coord) else {
            return false;
        };
        if !slot.overlay.as_ref().is_some_and(|o| matches(o.source)) {
            return false;
        }
        slot.overlay = None;
        if slot.is_empty() {
            self.slots.remove(&coord);
        }
        self.publish(coord);
        true
    }

    fn issue_token(&mut self) -> PendingToken {
        self.next_token += 1;
        PendingToken(self.next_token)
    }

    fn publish(&self, coord: Coord) {
        let change = CellChange { coord, cell: self.get(coord).cloned() };
        if self.changes.send(change).is_err() {
            trace!(x = coord.x, y = coord.y, "store: no change subscribers");
        }
    }

    // =========================================================================
    // CURSORS
    // =========================================================================

    pub fn update_cursor(&mut self, id: &str, x: u32, y: u32, color: Rgb) {
        self.update_cursor_at(id, x, y, color, Instant::now());
    }

    pub fn update_cursor_at(&mut self, id: &str, x: u32, y: u32, color: Rgb, now: Instant) {
        self.cursors
            .insert(id.to_owned(), Cursor { id: id.to_owned(), x, y, color, last_seen: now });
    }

    pub fn remove_cursor(&mut self, id: &str) -> bool {
        self.cursors.remove(id).is_some()
    }

    /// Cursors refreshed within the TTL, ordered by id.
    #[must_use]
    pub fn active_cursors(&self) -> Vec<Cursor> {
        self.active_cursors_at(Instant::now())
    }

    #[must_use]
    pub fn active_cursors_at(&self, now: Instant) -> Vec<Cursor> {
        let mut active: Vec<Cursor> = self
            .cursors
            .values()
            .filter(|c| now.saturating_duration_since(c.last_seen) < CURSOR_TTL)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.id.cmp(&b.id));
        active
    }

    /// Purge cursors past the TTL. Returns how many were removed.
    pub fn sweep_cursors(&mut self) -> usize {
        self.sweep_cursors_at(Instant::now())
    }

    pub fn sweep_cursors_at(&mut self, now: Instant) -> usize {
        let before = self.cursors.len();
        self.cursors
            .retain(|_, c| now.saturating_duration_since(c.last_seen) < CURSOR_TTL);
        before - self.cursors.len()
    }
}

impl Default for CellStore {
    fn default() -> Self {
        Self::new(Grid::default())
    }
}

// =============================================================================
// SHARED HANDLE
// =============================================================================

/// Cloneable handle to the single store instance. The lock is never held
/// across an `.await`.
#[derive(Clone, Default)]
pub struct SharedCellStore {
    inner: Arc<Mutex<CellStore>>,
}

impl SharedCellStore {
    #[must_use]
    pub fn new(store: CellStore) -> Self {
        Self { inner: Arc::new(Mutex::new(store)) }
    }

    /// Lock the store, recovering from a poisoned mutex.
    pub fn lock(&self) -> MutexGuard<'_, CellStore> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
