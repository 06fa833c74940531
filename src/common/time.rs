use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::common::types::Timestamp;

/// Returns the time duration since UNIX_EPOCH in milliseconds.
pub fn current_time_millis() -> Timestamp {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub fn duration_to_millis(d: Duration) -> i64 {
    d.as_millis() as i64
}
