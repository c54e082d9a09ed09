//! Ledger seam: the authoritative, append-only source of confirmed cells.
//!
//! DESIGN
//! ======
//! The engine only talks to the ledger through the [`Ledger`] trait, so a
//! chain client, an RPC proxy, or the in-process [`MemoryLedger`] can sit
//! behind it. Confirmations are pushed through a broadcast channel:
//! delivery is at-least-once and unordered across coordinates, which the
//! cell store's version rule absorbs.

#[cfg(test)]
#[path = "ledger_test.rs"]
mod ledger_test;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use frames::Rgb;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::error::ErrorCode;
use crate::grid::{Coord, Grid};
use crate::region::RegionKey;
use crate::store::Cell;

/// Default price per cell: 0.001 of the ledger's coin in its smallest unit.
pub const DEFAULT_UNIT_PRICE: u128 = 1_000_000_000_000_000;

const CONFIRMED_CHANNEL_CAPACITY: usize = 4096;

// =============================================================================
// TYPES
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    #[error("insufficient funds: need {needed}, have {available}")]
    InsufficientFunds { needed: u128, available: u128 },
    #[error("write rejected: {0}")]
    Rejected(String),
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
    #[error("coordinate ({x}, {y}) is outside the grid")]
    OutOfBounds { x: u32, y: u32 },
}

impl ErrorCode for LedgerError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InsufficientFunds { .. } => "E_INSUFFICIENT_FUNDS",
            Self::Rejected(_) => "E_WRITE_REJECTED",
            Self::Unavailable(_) => "E_LEDGER_UNAVAILABLE",
            Self::OutOfBounds { .. } => "E_OUT_OF_BOUNDS",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// One cell of a batch write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelWrite {
    pub coord: Coord,
    pub color: Rgb,
}

/// Receipt for an accepted write. Confirmation arrives later through the
/// subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteHandle {
    pub tx_hash: String,
    pub cells: usize,
    pub cost: u128,
}

/// Provider-neutral async ledger. Enables mocking in tests.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Submit one batch write.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger refuses the batch or cannot
    /// be reached.
    async fn submit_write(&self, writes: &[PixelWrite]) -> Result<WriteHandle, LedgerError>;

    /// Read every painted cell inside `region`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the read cannot be served.
    async fn read_region(&self, region: RegionKey) -> Result<Vec<Cell>, LedgerError>;

    /// Current price of one cell. May change between calls.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::Unavailable`] if the price cannot be read.
    async fn unit_price(&self) -> Result<u128, LedgerError>;

    /// Stream of confirmed cells from now on.
    fn subscribe_confirmed(&self) -> broadcast::Receiver<Cell>;
}

// =============================================================================
// MEMORY LEDGER
// =============================================================================

struct Book {
    cells: HashMap<Coord, Cell>,
    price: u128,
    balance: u128,
    next_tx: u64,
}

/// In-process ledger with per-coordinate versions, a configurable
/// confirmation delay, and failure injection.
pub struct MemoryLedger {
    grid: Grid,
    account: String,
    confirm_delay: Duration,
    read_delay: Duration,
    book: Mutex<Book>,
    confirmed: broadcast::Sender<Cell>,
    reads: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryLedger {
    #[must_use]
    pub fn new(grid: Grid, account: impl Into<String>) -> Self {
        let (confirmed, _) = broadcast::channel(CONFIRMED_CHANNEL_CAPACITY);
        Self {
            grid,
            account: account.into(),
            confirm_delay: Duration::ZERO,
            read_delay: Duration::ZERO,
            book: Mutex::new(Book { cells: HashMap::new(), price: DEFAULT_UNIT_PRICE, balance: u128::MAX, next_tx: 0 }),
            confirmed,
            reads: AtomicUsize::new(0),
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Delay between an accepted write and its confirmation event.
    #[must_use]
    pub fn with_confirm_delay(mut self, delay: Duration) -> Self {
        self.confirm_delay = delay;
        self
    }

    /// Latency added to every region read.
    #[must_use]
    pub fn with_read_delay(mut self, delay: Duration) -> Self {
        self.read_delay = delay;
        self
    }

    pub fn set_price(&self, price: u128) {
        self.book().price = price;
    }

    pub fn set_balance(&self, balance: u128) {
        self.book().balance = balance;
    }

    #[must_use]
    pub fn balance(&self) -> u128 {
        self.book().balance
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `read_region` calls served or failed so far.
    #[must_use]
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Write a confirmed cell straight into the book without emitting an
    /// event, as if it had been confirmed before this session started.
    pub fn seed(&self, coord: Coord, color: Rgb, owner: &str) -> Cell {
        let mut book = self.book();
        let version = book.cells.get(&coord).map_or(0, |c| c.version) + 1;
        let cell = Cell::confirmed(coord, color, owner, version, frames::now_ms());
        book.cells.insert(coord, cell.clone());
        cell
    }

    fn book(&self) -> MutexGuard<'_, Book> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn commit(&self, writes: &[PixelWrite]) -> Result<(WriteHandle, Vec<Cell>), LedgerError> {
        if writes.is_empty() {
            return Err(LedgerError::Rejected("empty write".into()));
        }
        if let Some(w) = writes.iter().find(|w| !self.grid.contains(w.coord)) {
            return Err(LedgerError::OutOfBounds { x: w.coord.x, y: w.coord.y });
        }

        let mut book = self.book();
        let count = u128::try_from(writes.len()).unwrap_or(u128::MAX);
        let Some(cost) = book.price.checked_mul(count) else {
            return Err(LedgerError::Rejected("cost overflow".into()));
        };
        if cost > book.balance {
            return Err(LedgerError::InsufficientFunds { needed: cost, available: book.balance });
        }
        book.balance -= cost;
        book.next_tx += 1;
        let tx_hash = format!("0x{:064x}", book.next_tx);

        let now = frames::now_ms();
        let mut confirmed = Vec::with_capacity(writes.len());
        for w in writes {
            let version = book.cells.get(&w.coord).map_or(0, |c| c.version) + 1;
            let cell = Cell::confirmed(w.coord, w.color, self.account.as_str(), version, now);
            book.cells.insert(w.coord, cell.clone());
            confirmed.push(cell);
        }

        Ok((WriteHandle { tx_hash, cells: writes.len(), cost }, confirmed))
    }
}

fn emit(tx: &broadcast::Sender<Cell>, cells: Vec<Cell>) {
    for cell in cells {
        if tx.send(cell).is_err() {
            trace!("ledger: confirmation with no subscribers");
        }
    }
}

#[async_trait::async_trait]
impl Ledger for MemoryLedger {
    async fn submit_write(&self, writes: &[PixelWrite]) -> Result<WriteHandle, LedgerError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("writes disabled".into()));
        }
        let (handle, cells) = self.commit(writes)?;
        info!(tx = %handle.tx_hash, cells = handle.cells, cost = %handle.cost, "ledger: write accepted");

        if self.confirm_delay.is_zero() {
            emit(&self.confirmed, cells);
        } else {
            let tx = self.confirmed.clone();
            let delay = self.confirm_delay;
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                emit(&tx, cells);
            });
        }
        Ok(handle)
    }

    async fn read_region(&self, region: RegionKey) -> Result<Vec<Cell>, LedgerError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        if !self.read_delay.is_zero() {
            tokio::time::sleep(self.read_delay).await;
        }
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("reads disabled".into()));
        }

        let mut cells: Vec<Cell> =
            self.book().cells.values().filter(|c| region.contains(c.coord)).cloned().collect();
        cells.sort_by_key(|c| c.coord);
        debug!(?region, cells = cells.len(), "ledger: region read");
        Ok(cells)
    }

    async fn unit_price(&self) -> Result<u128, LedgerError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("reads disabled".into()));
        }
        Ok(self.book().price)
    }

    fn subscribe_confirmed(&self) -> broadcast::Receiver<Cell> {
        self.confirmed.subscribe()
    }
}
