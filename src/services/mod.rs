//! Hub services used by the websocket and HTTP routes.
//!
//! ARCHITECTURE
//! ============
//! Service modules own registry and history logic so route handlers stay
//! focused on protocol translation.

pub mod history;
pub mod presence;
pub mod stats;
