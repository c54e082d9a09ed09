//! Grid geometry: cell coordinates, raw gesture points, and the grid bounds.
//!
//! Gesture points are signed because a drag may leave the grid; everything
//! that reaches the store or the ledger is a [`Coord`] inside the grid.

use serde::{Deserialize, Serialize};

use crate::consts::GRID_SIDE;

/// Integer coordinate of a cell inside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Coord {
    pub x: u32,
    pub y: u32,
}

impl Coord {
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }
}

/// Raw gesture position in grid units. May lie outside the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Point {
    pub x: i32,
    pub y: i32,
}

impl Point {
    #[must_use]
    pub const fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<Coord> for Point {
    fn from(c: Coord) -> Self {
        Self { x: i32::try_from(c.x).unwrap_or(i32::MAX), y: i32::try_from(c.y).unwrap_or(i32::MAX) }
    }
}

/// Square grid of `side × side` cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Grid {
    side: u32,
}

impl Grid {
    #[must_use]
    pub const fn new(side: u32) -> Self {
        Self { side }
    }

    #[must_use]
    pub const fn side(self) -> u32 {
        self.side
    }

    /// Whether `coord` is inside `[0, side) × [0, side)`.
    #[must_use]
    pub fn contains(self, coord: Coord) -> bool {
        coord.x < self.side && coord.y < self.side
    }

    /// Map a wide signed position to a cell, or `None` when it falls outside.
    #[must_use]
    pub fn clip(self, x: i64, y: i64) -> Option<Coord> {
        let (Ok(x), Ok(y)) = (u32::try_from(x), u32::try_from(y)) else {
            return None;
        };
        let coord = Coord { x, y };
        self.contains(coord).then_some(coord)
    }

    /// Clamp an inclusive signed span to the grid's index range.
    /// Returns `None` when the span misses the grid entirely.
    pub(crate) fn clamp_span(self, lo: i64, hi: i64) -> Option<(i64, i64)> {
        let max = i64::from(self.side) - 1;
        let lo = lo.max(0);
        let hi = hi.min(max);
        (lo <= hi).then_some((lo, hi))
    }
}

impl Default for Grid {
    fn default() -> Self {
        Self::new(GRID_SIDE)
    }
}
