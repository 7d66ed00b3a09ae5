//! Time-related utilities

use crate::types::Timestamp;
use chrono::{TimeZone, Utc};

/// Current wall-clock time
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert seconds since UNIX epoch to a timestamp, `None` if out of range
pub fn from_unix_secs(secs: i64) -> Option<Timestamp> {
    Utc.timestamp_opt(secs, 0).single()
}

/// Convert a std duration into a chrono one, saturating at the chrono maximum
pub fn chrono_duration(d: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
