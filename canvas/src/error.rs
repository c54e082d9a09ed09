//! Error classification shared by the engine's error enums.

/// Grepable error code plus a retry hint, carried by every engine error.
pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}
