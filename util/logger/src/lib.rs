//! Thin facade over the `log` crate.
//!
//! Every other crate in the workspace logs through `frame_logger::{info, warn,
//! ...}` rather than depending on `log` directly, so the logging backend can
//! be swapped (or muted for tests) in one place: [`frame-logger-service`].

pub use log::{Level, LevelFilter, debug, error, info, log_enabled, trace, warn};

/// Logs `$msg` at `$level` with an explicit `target`, for call sites that
/// want their log lines grouped by subsystem (breaker, router, health, ...)
/// independent of the module path.
#[macro_export]
macro_rules! info_target {
    ($target:expr, $($arg:tt)*) => {
        $crate::info!(target: $target, $($arg)*)
    };
}

#[macro_export]
macro_rules! warn_target {
    ($target:expr, $($arg:tt)*) => {
        $crate::warn!(target: $target, $($arg)*)
    };
}

#[macro_export]
macro_rules! error_target {
    ($target:expr, $($arg:tt)*) => {
        $crate::error!(target: $target, $($arg)*)
    };
}
