//! Wall-clock helpers. All scheduler timestamps are milliseconds since epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default()
}

/// Add a duration to a millisecond timestamp.
pub fn add_ms(at_ms: u128, duration: Duration) -> u128 {
    at_ms.saturating_add(duration.as_millis())
}
