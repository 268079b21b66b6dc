//! Monotonic clock used to stamp frames.
//!
//! Timestamps are seconds since the process clock epoch, taken from
//! [`std::time::Instant`] so they never jump with wall-clock changes.

use once_cell::sync::Lazy;
use std::time::Instant;

static EPOCH: Lazy<Instant> = Lazy::new(Instant::now);

/// Seconds elapsed since the process clock epoch.
pub fn now() -> f64 {
    EPOCH.elapsed().as_secs_f64()
}

/// Formats a grab timestamp for the `X-Timestamp` header
/// (seconds with six fractional digits).
pub fn format_ts(ts: f64) -> String {
    format!("{:.6}", ts)
}
