//! Bounded in-memory paint history.
//!
//! DESIGN
//! ======
//! The hub keeps the most recent paints it relayed so late joiners get a
//! warm start (`welcome`, `region_data`, `canvas_data`) and so it can report
//! activity stats. It is never authoritative: the ledger is. When full, the
//! oldest paint is dropped.

use std::collections::{HashSet, VecDeque};

use frames::{CanvasStats, PixelPainted, RegionRequest};

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 3_600_000;

pub struct PaintHistory {
    capacity: usize,
    paints: VecDeque<PixelPainted>,
}

impl PaintHistory {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self { capacity, paints: VecDeque::with_capacity(capacity.min(1024)) }
    }

    /// Append a paint, evicting the oldest entries beyond capacity.
    pub fn push(&mut self, paint: PixelPainted) {
        if self.capacity == 0 {
            return;
        }
        while self.paints.len() >= self.capacity {
            self.paints.pop_front();
        }
        self.paints.push_back(paint);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.paints.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.paints.is_empty()
    }

    /// The last `n` paints, oldest first.
    #[must_use]
    pub fn recent(&self, n: usize) -> Vec<PixelPainted> {
        let skip = self.paints.len().saturating_sub(n);
        self.paints.iter().skip(skip).cloned().collect()
    }

    /// Paints whose coordinate lies inside `region`, oldest first.
    #[must_use]
    pub fn in_region(&self, region: &RegionRequest) -> Vec<PixelPainted> {
        self.paints
            .iter()
            .filter(|p| region.contains(p.x, p.y))
            .cloned()
            .collect()
    }

    /// Activity stats as of `now_ms`. The per-second rate is the last
    /// minute's count over sixty, rounded to two decimals.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn stats_at(&self, active_sessions: usize, now_ms: i64) -> CanvasStats {
        let minute_ago = now_ms.saturating_sub(MINUTE_MS);
        let hour_ago = now_ms.saturating_sub(HOUR_MS);

        let recent_paints = self.paints.iter().filter(|p| p.timestamp > minute_ago).count();
        let hourly_paints = self.paints.iter().filter(|p| p.timestamp > hour_ago).count();
        let unique_artists = self.paints.iter().map(|p| p.owner.as_str()).collect::<HashSet<_>>().len();
        let paints_per_second = (recent_paints as f64 / 60.0 * 100.0).round() / 100.0;

        CanvasStats {
            active_sessions,
            total_paints: self.paints.len(),
            paints_per_second,
            unique_artists,
            recent_paints,
            hourly_paints,
            timestamp: now_ms,
        }
    }
}

#[cfg(test)]
#[path = "history_test.rs"]
mod tests;
