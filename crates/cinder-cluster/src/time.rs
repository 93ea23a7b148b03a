//! Wall-clock helpers.
//!
//! The state machines never read the clock themselves: callers pass `now`
//! in milliseconds. Timestamps travel on the wire (gossip entries carry
//! seconds), so the process clock has to be unix time rather than a
//! monotonic counter.

use std::time::{SystemTime, UNIX_EPOCH};

/// Sentinel for "never happened" timestamps.
pub const NEVER: u64 = 0;

/// Returns milliseconds since the unix epoch.
#[inline]
pub fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(NEVER)
}

/// Milliseconds elapsed between `since` and `now`, zero if the clock moved
/// backwards.
#[inline]
pub(crate) fn elapsed(now: u64, since: u64) -> u64 {
    now.saturating_sub(since)
}

/// Gossip entries carry timestamps as 32-bit seconds.
#[inline]
pub(crate) fn to_wire_secs(ms: u64) -> u32 {
    u32::try_from(ms / 1000).unwrap_or(u32::MAX)
}
