//! Shape rasterization: turn gesture geometry into grid cells.
//!
//! Every function returns cells inside the grid only, without duplicates, in
//! a deterministic order. Inputs may lie partly or wholly outside the grid.

#[cfg(test)]
#[path = "raster_test.rs"]
mod raster_test;

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::grid::{Coord, Grid, Point};

/// Selection shape kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Shape {
    /// Axis-aligned filled rectangle between two corners.
    #[default]
    Rectangle,
    /// Filled disc around the anchor; the drag distance is the radius.
    Circle,
    /// Straight segment between two points.
    Line,
    /// Every point visited along a drag path.
    Freehand,
}

/// Filled axis-aligned rectangle with `a` and `b` as opposite corners.
///
/// Corners may be given in any order. Cells are ordered x-major, then y.
#[must_use]
pub fn rectangle(grid: Grid, a: Point, b: Point) -> Vec<Coord> {
    let (x0, x1) = ordered(a.x, b.x);
    let (y0, y1) = ordered(a.y, b.y);
    let (Some((x0, x1)), Some((y0, y1))) = (grid.clamp_span(x0, x1), grid.clamp_span(y0, y1)) else {
        return Vec::new();
    };

    let mut cells = Vec::new();
    for x in x0..=x1 {
        for y in y0..=y1 {
            cells.extend(grid.clip(x, y));
        }
    }
    cells
}

/// Filled disc: every cell whose squared distance from `center` is at most
/// `radius²`.
#[must_use]
pub fn circle(grid: Grid, center: Point, radius: u32) -> Vec<Coord> {
    let r = i64::from(radius);
    let (cx, cy) = (i64::from(center.x), i64::from(center.y));
    let (Some((x0, x1)), Some((y0, y1))) = (grid.clamp_span(cx - r, cx + r), grid.clamp_span(cy - r, cy + r)) else {
        return Vec::new();
    };

    // Squares of off-grid distances exceed i64.
    let limit = i128::from(r).pow(2);
    let mut cells = Vec::new();
    for x in x0..=x1 {
        let dx = i128::from(x - cx);
        for y in y0..=y1 {
            let dy = i128::from(y - cy);
            if dx * dx + dy * dy <= limit {
                cells.extend(grid.clip(x, y));
            }
        }
    }
    cells
}

/// Radius implied by dragging from `anchor` to `end`: the integer square
/// root of the squared Euclidean distance.
#[must_use]
pub fn drag_radius(anchor: Point, end: Point) -> u32 {
    let dx = u128::from((i64::from(end.x) - i64::from(anchor.x)).unsigned_abs());
    let dy = u128::from((i64::from(end.y) - i64::from(anchor.y)).unsigned_abs());
    u32::try_from((dx * dx + dy * dy).isqrt()).unwrap_or(u32::MAX)
}

/// Bresenham segment from `a` to `b`, inclusive of both endpoints when they
/// fall inside the grid.
///
/// Each step along the longer axis takes the nearest cell on the other axis
/// (ties round up), the same choice the midpoint error term makes, but
/// computed in closed form. Only the stretch of the longer axis that
/// overlaps the grid is walked, so far off-grid endpoints cost nothing.
/// Reversing the endpoints yields the same cells in reverse order.
#[must_use]
pub fn line(grid: Grid, a: Point, b: Point) -> Vec<Coord> {
    let (ax, ay, bx, by) = (i64::from(a.x), i64::from(a.y), i64::from(b.x), i64::from(b.y));
    if (bx - ax).abs() >= (by - ay).abs() {
        walk_major(grid, (ax, ay), (bx, by), |major, minor| grid.clip(major, minor))
    } else {
        walk_major(grid, (ay, ax), (by, bx), |major, minor| grid.clip(minor, major))
    }
}

/// Walk `(major, minor)` endpoints one major unit at a time.
fn walk_major(
    grid: Grid,
    from: (i64, i64),
    to: (i64, i64),
    cell: impl Fn(i64, i64) -> Option<Coord>,
) -> Vec<Coord> {
    let reversed = from.0 > to.0;
    let ((m0, n0), (m1, n1)) = if reversed { (to, from) } else { (from, to) };
    let Some((lo, hi)) = grid.clamp_span(m0, m1) else {
        return Vec::new();
    };

    let run = i128::from(m1 - m0);
    let rise = i128::from(n1 - n0);
    let mut cells: Vec<Coord> = (lo..=hi)
        .filter_map(|m| {
            let offset = if run == 0 { 0 } else { (2 * rise * i128::from(m - m0) + run).div_euclid(2 * run) };
            let Ok(minor) = i64::try_from(i128::from(n0) + offset) else {
                return None;
            };
            cell(m, minor)
        })
        .collect();
    if reversed {
        cells.reverse();
    }
    cells
}

/// Cells visited along a drag path, in first-visit order.
#[must_use]
pub fn freehand(grid: Grid, path: &[Point]) -> Vec<Coord> {
    let mut seen = HashSet::new();
    path.iter()
        .filter_map(|p| grid.clip(i64::from(p.x), i64::from(p.y)))
        .filter(|c| seen.insert(*c))
        .collect()
}

fn ordered(a: i32, b: i32) -> (i64, i64) {
    let (a, b) = (i64::from(a), i64::from(b));
    (a.min(b), a.max(b))
}
