//! Timestamp utilities
//!
//! Sample timestamps travel as whole milliseconds (SQLite column, wire format),
//! so every capture time is normalized to millisecond precision on the way in.

use chrono::{DateTime, TimeZone, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert milliseconds to duration
pub fn millis_to_duration(millis: u64) -> std::time::Duration {
    std::time::Duration::from_millis(millis)
}

/// Milliseconds since the Unix epoch
pub fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

/// Timestamp from milliseconds since the Unix epoch
///
/// Out-of-range values clamp to the epoch rather than failing; SQLite rows are
/// always written through `to_millis`, so this only matters for corrupted data.
pub fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Drop sub-millisecond precision
pub fn truncate_to_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    from_millis(to_millis(ts))
}
