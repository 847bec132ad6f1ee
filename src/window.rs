//! Fixed-window arithmetic.
//!
//! Windows are epoch-aligned: a 60s window always starts on a whole minute of
//! Unix time, regardless of when the first request for a key arrived. Every
//! process sharing a counter store therefore computes the same window for the
//! same instant without talking to the others.
//!
//! Fixed windows allow a caller to burst up to twice the limit across a
//! boundary (`limit` requests at the end of one window, `limit` more at the
//! start of the next). That is the accepted cost of O(1) state per key.

use std::time::Duration;

/// Window width in whole milliseconds, saturating at `u64::MAX`.
pub fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

/// Truncate `now_millis` down to the nearest multiple of `window`.
///
/// A zero-width window cannot be constructed through [`RatePolicy`](crate::RatePolicy);
/// it is treated here as "every millisecond is its own window".
pub fn canonical_window_start(now_millis: u64, window: Duration) -> u64 {
    let width = window_millis(window);
    if width == 0 {
        return now_millis;
    }
    now_millis - now_millis % width
}

/// A record belongs to a stale window if it started before the current one.
pub fn has_rolled_over(record_window_start: u64, canonical_window_start: u64) -> bool {
    record_window_start < canonical_window_start
}

/// Exclusive end of the window beginning at `window_start`; also the record TTL.
pub fn window_end(window_start: u64, window: Duration) -> u64 {
    window_start.saturating_add(window_millis(window))
}

/// Time until `window_end`, rounded up to whole seconds for `Retry-After`.
pub fn retry_after(now_millis: u64, window_end: u64) -> Duration {
    let remaining = window_end.saturating_sub(now_millis);
    Duration::from_secs(remaining.div_ceil(1000))
}
