//! Shared constants for the canvas crate.

use std::time::Duration;

// ── Grid ────────────────────────────────────────────────────────

/// Side length of the square pixel grid.
pub const GRID_SIDE: u32 = 1000;

// ── Cell store ──────────────────────────────────────────────────

/// Cursors not refreshed within this window are hidden and swept.
pub const CURSOR_TTL: Duration = Duration::from_secs(15);

/// A local pending write is rolled back if no confirmation lands in time.
pub const PENDING_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay-broadcast paints that never get confirmed are dropped after this.
pub const RELAYED_HINT_TTL: Duration = Duration::from_secs(60);

/// Capacity of the cell-change notification channel.
pub const CHANGE_CHANNEL_CAPACITY: usize = 4096;

// ── Region loading ──────────────────────────────────────────────

/// Edge of the square tiles used for the refresh coverage set.
pub const COVERAGE_TILE: u32 = 250;

/// Edge of the aligned tile reloaded around a recently touched cell.
pub const TOUCH_SPAN: u32 = 10;

/// Most-recent touched coordinates remembered for refresh.
pub const TOUCHED_CAPACITY: usize = 256;

// ── Relay ───────────────────────────────────────────────────────

/// First reconnect delay; doubles on every further attempt.
pub const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Reconnect attempts before the relay client gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Outbound relay queue depth.
pub const RELAY_QUEUE_CAPACITY: usize = 256;

// ── Orchestrator ────────────────────────────────────────────────

/// Period of the cursor / stale-hint sweep.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
