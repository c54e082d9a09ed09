//! Region loader: deduplicated, coalescing reads of grid rectangles.
//!
//! DESIGN
//! ======
//! The loader remembers every [`RegionKey`] it has read this session and
//! turns a repeated `load` into a no-op. A key is registered as in flight
//! before the read starts, and later callers for the same key await the
//! same shared future instead of issuing their own read. The future itself
//! settles the bookkeeping: on success the key moves from in flight to
//! loaded, on failure it is only removed so a later refresh retries it.
//!
//! `refresh` forgets the loaded set and re-reads a coverage tiling plus one
//! aligned tile around each coordinate recently touched by a confirmation.

#[cfg(test)]
#[path = "region_test.rs"]
mod region_test;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use tracing::{debug, info, warn};

use crate::consts::{COVERAGE_TILE, TOUCH_SPAN, TOUCHED_CAPACITY};
use crate::error::ErrorCode;
use crate::grid::{Coord, Grid};
use crate::ledger::{Ledger, LedgerError};
use crate::store::SharedCellStore;

// =============================================================================
// REGION KEY
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegionError {
    #[error("region ({x}, {y}, {width}x{height}) does not overlap the grid")]
    Empty { x: u32, y: u32, width: u32, height: u32 },
    #[error("region read failed: {0}")]
    Read(#[from] LedgerError),
}

impl ErrorCode for RegionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Empty { .. } => "E_REGION_EMPTY",
            Self::Read(_) => "E_REGION_READ",
        }
    }

    fn retryable(&self) -> bool {
        matches!(self, Self::Read(e) if e.retryable())
    }
}

/// A rectangle of the grid, clipped so it lies fully inside.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegionKey {
    pub start_x: u32,
    pub start_y: u32,
    pub width: u32,
    pub height: u32,
}

impl RegionKey {
    /// Normalize `(x, y, width, height)` against `grid`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Empty`] when nothing of the rectangle is left
    /// after clipping.
    pub fn new(grid: Grid, x: u32, y: u32, width: u32, height: u32) -> Result<Self, RegionError> {
        let side = u64::from(grid.side());
        let end_x = (u64::from(x) + u64::from(width)).min(side);
        let end_y = (u64::from(y) + u64::from(height)).min(side);
        let (Ok(width_clipped), Ok(height_clipped)) =
            (u32::try_from(end_x.saturating_sub(u64::from(x))), u32::try_from(end_y.saturating_sub(u64::from(y))))
        else {
            return Err(RegionError::Empty { x, y, width, height });
        };
        if width_clipped == 0 || height_clipped == 0 {
            return Err(RegionError::Empty { x, y, width, height });
        }
        Ok(Self { start_x: x, start_y: y, width: width_clipped, height: height_clipped })
    }

    /// Whether `coord` lies inside this region (half-open).
    #[must_use]
    pub fn contains(&self, coord: Coord) -> bool {
        coord.x >= self.start_x
            && coord.y >= self.start_y
            && coord.x - self.start_x < self.width
            && coord.y - self.start_y < self.height
    }

    /// Cover the whole grid with `tile × tile` regions, row by row.
    #[must_use]
    pub fn tiling(grid: Grid, tile: u32) -> Vec<Self> {
        let step = usize::try_from(tile.max(1)).unwrap_or(usize::MAX);
        let mut tiles = Vec::new();
        for y in (0..grid.side()).step_by(step) {
            for x in (0..grid.side()).step_by(step) {
                if let Ok(key) = Self::new(grid, x, y, tile, tile) {
                    tiles.push(key);
                }
            }
        }
        tiles
    }

    /// The aligned `span × span` tile containing `coord`.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Empty`] when `coord` is outside the grid.
    pub fn around(grid: Grid, coord: Coord, span: u32) -> Result<Self, RegionError> {
        let span = span.max(1);
        Self::new(grid, coord.x / span * span, coord.y / span * span, span, span)
    }
}

// =============================================================================
// LOADER
// =============================================================================

/// What a successful `load` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Read from the ledger (or joined a read in flight); carries the number
    /// of cells returned.
    Loaded(usize),
    /// Already loaded this session; nothing was read.
    Cached,
}

/// Summary of one `refresh`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub loaded: usize,
    pub cached: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionConfig {
    /// Edge of the coverage tiles re-read by `refresh`.
    pub coverage_tile: u32,
    /// Edge of the tile re-read around each touched coordinate.
    pub touch_span: u32,
    /// How many touched coordinates are remembered.
    pub touched_capacity: usize,
}

impl Default for RegionConfig {
    fn default() -> Self {
        Self { coverage_tile: COVERAGE_TILE, touch_span: TOUCH_SPAN, touched_capacity: TOUCHED_CAPACITY }
    }
}

type ReadFuture = Shared<BoxFuture<'static, Result<usize, LedgerError>>>;

#[derive(Default)]
struct LoadBook {
    loaded: HashSet<RegionKey>,
    in_flight: HashMap<RegionKey, ReadFuture>,
    touched: VecDeque<Coord>,
}

#[derive(Clone)]
pub struct RegionLoader {
    ledger: Arc<dyn Ledger>,
    store: SharedCellStore,
    config: RegionConfig,
    book: Arc<Mutex<LoadBook>>,
}

impl RegionLoader {
    #[must_use]
    pub fn new(ledger: Arc<dyn Ledger>, store: SharedCellStore, config: RegionConfig) -> Self {
        Self { ledger, store, config, book: Arc::new(Mutex::new(LoadBook::default())) }
    }

    fn book(&self) -> MutexGuard<'_, LoadBook> {
        self.book.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn grid(&self) -> Grid {
        self.store.lock().grid()
    }

    /// Load `(x, y, width, height)` unless it was already loaded.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Empty`] for a rectangle outside the grid and
    /// [`RegionError::Read`] when the ledger read fails.
    pub async fn load(&self, x: u32, y: u32, width: u32, height: u32) -> Result<LoadOutcome, RegionError> {
        let key = RegionKey::new(self.grid(), x, y, width, height)?;
        self.load_key(key).await
    }

    /// Load a normalized key unless it was already loaded.
    ///
    /// # Errors
    ///
    /// Returns [`RegionError::Read`] when the ledger read fails.
    pub async fn load_key(&self, key: RegionKey) -> Result<LoadOutcome, RegionError> {
        let read = {
            let mut book = self.book();
            if book.loaded.contains(&key) {
                return Ok(LoadOutcome::Cached);
            }
            match book.in_flight.get(&key) {
                Some(read) => read.clone(),
                None => {
                    let read = self.start_read(key);
                    book.in_flight.insert(key, read.clone());
                    read
                }
            }
        };

        let cells = read.await?;
        Ok(LoadOutcome::Loaded(cells))
    }

    fn start_read(&self, key: RegionKey) -> ReadFuture {
        let ledger = Arc::clone(&self.ledger);
        let store = self.store.clone();
        let book = Arc::clone(&self.book);

        async move {
            let result = ledger.read_region(key).await;
            let mut book = book.lock().unwrap_or_else(PoisonError::into_inner);
            book.in_flight.remove(&key);
            match result {
                Ok(cells) => {
                    let count = cells.len();
                    {
                        let mut store = store.lock();
                        for cell in cells {
                            store.upsert(cell);
                        }
                    }
                    book.loaded.insert(key);
                    debug!(?key, cells = count, "region: loaded");
                    Ok(count)
                }
                Err(e) => {
                    warn!(?key, error = %e, "region: read failed; will retry on refresh");
                    Err(e)
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Whether `key` has been loaded this session.
    #[must_use]
    pub fn is_loaded(&self, key: &RegionKey) -> bool {
        self.book().loaded.contains(key)
    }

    /// Number of loaded keys.
    #[must_use]
    pub fn loaded_count(&self) -> usize {
        self.book().loaded.len()
    }

    /// Remember a coordinate touched by a confirmed paint.
    pub fn note_touched(&self, coord: Coord) {
        let capacity = self.config.touched_capacity;
        let mut book = self.book();
        book.touched.retain(|c| *c != coord);
        book.touched.push_back(coord);
        while book.touched.len() > capacity {
            book.touched.pop_front();
        }
    }

    /// Regions `refresh` will read: the coverage tiling followed by the
    /// touched tiles not already covered by an identical key.
    #[must_use]
    pub fn refresh_set(&self) -> Vec<RegionKey> {
        let grid = self.grid();
        let mut keys = RegionKey::tiling(grid, self.config.coverage_tile);
        let mut seen: HashSet<RegionKey> = keys.iter().copied().collect();
        let touched: Vec<Coord> = self.book().touched.iter().copied().collect();
        for coord in touched {
            if let Ok(key) = RegionKey::around(grid, coord, self.config.touch_span) {
                if seen.insert(key) {
                    keys.push(key);
                }
            }
        }
        keys
    }

    /// Forget what was loaded and read the refresh set again.
    pub async fn refresh(&self) -> RefreshReport {
        let keys = self.refresh_set();
        self.book().loaded.clear();
        info!(regions = keys.len(), "region: refresh started");

        let results = join_all(keys.into_iter().map(|key| self.load_key(key))).await;
        let mut report = RefreshReport::default();
        for result in results {
            match result {
                Ok(LoadOutcome::Loaded(_)) => report.loaded += 1,
                Ok(LoadOutcome::Cached) => report.cached += 1,
                Err(_) => report.failed += 1,
            }
        }
        info!(loaded = report.loaded, cached = report.cached, failed = report.failed, "region: refresh finished");
        report
    }
}
