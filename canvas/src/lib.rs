//! Client sync engine for the shared pixel canvas.
//!
//! This crate owns everything a client needs to show a consistent canvas
//! while writes are confirmed by an external ledger: the merged cell store,
//! shape rasterization and batch selection, region loading, the WebSocket
//! link to the presence hub, and the orchestrator that ties them together.
//! The rendering layer only talks to [`sync::SyncEngine`].
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`sync`] | Orchestrator and rendering-facing surface |
//! | [`store`] | Cell store with the version merge rule, pending writes, cursors |
//! | [`region`] | Deduplicated, coalescing region loader |
//! | [`ledger`] | Ledger trait and the in-process [`ledger::MemoryLedger`] |
//! | [`relay`] | Reconnecting WebSocket client for the presence hub |
//! | [`selection`] | Batch selection state machine |
//! | [`raster`] | Rectangle / circle / line / freehand rasterization |
//! | [`grid`] | Coordinates and grid bounds |
//! | [`error`] | Error code trait shared by the error enums |
//! | [`consts`] | Timeouts, capacities and tile sizes |

pub mod consts;
pub mod error;
pub mod grid;
pub mod ledger;
pub mod raster;
pub mod region;
pub mod relay;
pub mod selection;
pub mod store;
pub mod sync;
