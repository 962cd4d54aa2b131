//! Timestamp arithmetic that saturates instead of failing

use std::time::Duration;

use jiff::{SignedDuration, Timestamp};

/// `ts + duration`, clamped to the representable range
pub fn add(ts: Timestamp, duration: Duration) -> Timestamp {
    SignedDuration::try_from(duration)
        .ok()
        .and_then(|d| ts.checked_add(d).ok())
        .unwrap_or(Timestamp::MAX)
}

/// `ts - duration`, clamped to the representable range
pub fn sub(ts: Timestamp, duration: Duration) -> Timestamp {
    SignedDuration::try_from(duration)
        .ok()
        .and_then(|d| ts.checked_sub(d).ok())
        .unwrap_or(Timestamp::MIN)
}

/// Milliseconds since the Unix epoch, for storage
pub fn to_millis(ts: Timestamp) -> i64 {
    ts.as_millisecond()
}

/// Inverse of [`to_millis`], clamping out-of-range values
pub fn from_millis(ms: i64) -> Timestamp {
    Timestamp::from_millisecond(ms).unwrap_or(if ms < 0 { Timestamp::MIN } else { Timestamp::MAX })
}
