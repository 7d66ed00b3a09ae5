//! Wire and persisted record types

pub mod health;
pub mod state;
pub mod watch;

/// Wall-clock timestamp carried by health payloads and persisted records
pub type Timestamp = chrono::DateTime<chrono::Utc>;
