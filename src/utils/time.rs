//! Timestamp helpers
//!
//! Wall-clock timestamps travel on the wire as epoch milliseconds; local timers
//! use [`Instant`](std::time::Instant).

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall clock in epoch milliseconds
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

/// Estimated offset of the remote clock relative to ours.
///
/// Assumes the reply spent half of the round trip in flight:
/// `offset = server_time + rtt / 2 - received_at`.
pub fn clock_offset(sent_at: i64, server_time: i64, received_at: i64) -> i64 {
    let round_trip = received_at.saturating_sub(sent_at).max(0);
    server_time
        .saturating_add(round_trip / 2)
        .saturating_sub(received_at)
}
