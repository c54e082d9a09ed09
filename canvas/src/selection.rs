//! Batch selection: the gesture that picks the cells of one ledger write.
//!
//! A selection starts with [`SelectionEngine::begin`], follows the pointer
//! through [`SelectionEngine::extend`] and is frozen by
//! [`SelectionEngine::commit`]. Pixels are derived on demand from the
//! rasterizer; nothing is cached, so the pixel set always matches the
//! current anchors. Clearing or switching shape throws the whole selection
//! away.

#[cfg(test)]
#[path = "selection_test.rs"]
mod selection_test;

use crate::grid::{Coord, Grid, Point};
use crate::raster::{self, Shape};

/// An in-progress or committed selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub shape: Shape,
    pub anchor: Point,
    pub end: Point,
    /// Visited points, only kept for freehand selections.
    pub path: Vec<Point>,
    pub committed: bool,
}

impl Selection {
    fn new(shape: Shape, at: Point) -> Self {
        let path = if shape == Shape::Freehand { vec![at] } else { Vec::new() };
        Self { shape, anchor: at, end: at, path, committed: false }
    }

    /// Cells covered by this selection on `grid`.
    #[must_use]
    pub fn pixels(&self, grid: Grid) -> Vec<Coord> {
        match self.shape {
            Shape::Rectangle => raster::rectangle(grid, self.anchor, self.end),
            Shape::Circle => raster::circle(grid, self.anchor, raster::drag_radius(self.anchor, self.end)),
            Shape::Line => raster::line(grid, self.anchor, self.end),
            Shape::Freehand => raster::freehand(grid, &self.path),
        }
    }
}

/// Owns the current shape tool and at most one selection.
#[derive(Debug, Clone)]
pub struct SelectionEngine {
    grid: Grid,
    shape: Shape,
    current: Option<Selection>,
}

impl SelectionEngine {
    #[must_use]
    pub fn new(grid: Grid) -> Self {
        Self { grid, shape: Shape::default(), current: None }
    }

    #[must_use]
    pub fn shape(&self) -> Shape {
        self.shape
    }

    /// Switch the shape tool. Any selection in progress is discarded.
    pub fn set_shape(&mut self, shape: Shape) {
        if shape != self.shape {
            self.current = None;
        }
        self.shape = shape;
    }

    /// Start a new selection at `(x, y)`, replacing any previous one.
    pub fn begin(&mut self, shape: Shape, x: i32, y: i32) {
        self.shape = shape;
        self.current = Some(Selection::new(shape, Point::new(x, y)));
    }

    /// Move the live end of the selection. Returns `false` when there is no
    /// open selection to extend.
    pub fn extend(&mut self, x: i32, y: i32) -> bool {
        let Some(sel) = self.current.as_mut().filter(|s| !s.committed) else {
            return false;
        };
        let at = Point::new(x, y);
        sel.end = at;
        if sel.shape == Shape::Freehand {
            sel.path.push(at);
        }
        true
    }

    /// Freeze the selection. Returns `false` when nothing was selected.
    pub fn commit(&mut self) -> bool {
        match self.current.as_mut() {
            Some(sel) => {
                sel.committed = true;
                true
            }
            None => false,
        }
    }

    /// Drop the selection, committed or not.
    pub fn clear(&mut self) {
        self.current = None;
    }

    #[must_use]
    pub fn current(&self) -> Option<&Selection> {
        self.current.as_ref()
    }

    #[must_use]
    pub fn is_committed(&self) -> bool {
        self.current.as_ref().is_some_and(|s| s.committed)
    }

    /// Cells of the current selection; empty when there is none.
    #[must_use]
    pub fn pixels(&self) -> Vec<Coord> {
        self.current.as_ref().map_or_else(Vec::new, |s| s.pixels(self.grid))
    }

    /// Cells of the committed selection, or `None` when the selection is
    /// missing or still in progress.
    #[must_use]
    pub fn committed_pixels(&self) -> Option<Vec<Coord>> {
        self.current.as_ref().filter(|s| s.committed).map(|s| s.pixels(self.grid))
    }

    /// `pixels().len() × unit_price`, or `None` on overflow.
    #[must_use]
    pub fn cost(&self, unit_price: u128) -> Option<u128> {
        let count = u128::try_from(self.pixels().len()).unwrap_or(u128::MAX);
        count.checked_mul(unit_price)
    }
}
