//! Hub configuration parsed from environment variables.
//!
//! Every knob has a default, so a bare `pixelverse` invocation runs the relay
//! with the timings the browser client expects. Unparseable values fall back
//! to the default rather than aborting startup.

use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_PORT: u16 = 3001;
pub const DEFAULT_PING_INTERVAL_MS: u64 = 15_000;
pub const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HISTORY_CAPACITY: usize = 10_000;
pub const DEFAULT_WELCOME_REPLAY: usize = 50;
pub const DEFAULT_CANVAS_DATA_REPLAY: usize = 1_000;
pub const DEFAULT_STATS_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_SESSION_QUEUE: usize = 256;

/// Runtime settings for the presence hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubConfig {
    /// TCP port for HTTP and the `/ws` upgrade.
    pub port: u16,
    /// How often every session is probed with a ping.
    pub ping_interval: Duration,
    /// Silence longer than this gets a session evicted.
    pub liveness_timeout: Duration,
    /// Paints kept in the in-memory history ring.
    pub history_capacity: usize,
    /// Paints replayed in `welcome`.
    pub welcome_replay: usize,
    /// Paints returned by `canvas_data`.
    pub canvas_data_replay: usize,
    /// Period of the `canvas_stats` broadcast.
    pub stats_interval: Duration,
    /// Outbound queue depth per session. A full queue drops messages.
    pub session_queue: usize,
}

impl HubConfig {
    /// Build config from `PORT`, `PING_INTERVAL_MS`, `LIVENESS_TIMEOUT_MS`,
    /// `HISTORY_CAPACITY`, `WELCOME_REPLAY`, `CANVAS_DATA_REPLAY`,
    /// `STATS_INTERVAL_MS` and `SESSION_QUEUE`.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            port: env_parse("PORT", DEFAULT_PORT),
            ping_interval: env_millis("PING_INTERVAL_MS", DEFAULT_PING_INTERVAL_MS),
            liveness_timeout: env_millis("LIVENESS_TIMEOUT_MS", DEFAULT_LIVENESS_TIMEOUT_MS),
            history_capacity: env_parse("HISTORY_CAPACITY", DEFAULT_HISTORY_CAPACITY),
            welcome_replay: env_parse("WELCOME_REPLAY", DEFAULT_WELCOME_REPLAY),
            canvas_data_replay: env_parse("CANVAS_DATA_REPLAY", DEFAULT_CANVAS_DATA_REPLAY),
            stats_interval: env_millis("STATS_INTERVAL_MS", DEFAULT_STATS_INTERVAL_MS),
            // mpsc::channel panics on zero capacity.
            session_queue: env_parse("SESSION_QUEUE", DEFAULT_SESSION_QUEUE).max(1),
        }
    }
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            ping_interval: Duration::from_millis(DEFAULT_PING_INTERVAL_MS),
            liveness_timeout: Duration::from_millis(DEFAULT_LIVENESS_TIMEOUT_MS),
            history_capacity: DEFAULT_HISTORY_CAPACITY,
            welcome_replay: DEFAULT_WELCOME_REPLAY,
            canvas_data_replay: DEFAULT_CANVAS_DATA_REPLAY,
            stats_interval: Duration::from_millis(DEFAULT_STATS_INTERVAL_MS),
            session_queue: DEFAULT_SESSION_QUEUE,
        }
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

/// Millisecond setting as a `Duration`. Zero is raised to 1 ms since tokio
/// intervals reject a zero period.
fn env_millis(key: &str, default: u64) -> Duration {
    Duration::from_millis(env_parse(key, default).max(1))
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
