//! Persisted alerting records
//!
//! [`CachedState`] is the last observed health snapshot of a condition plus its
//! derived firing flag. [`IncidentIntervals`] is the append-only audit trail of
//! firing episodes. Both are stored per condition id.

use super::Timestamp;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Last observed health of a condition and whether it is firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedState {
    pub healthy: bool,
    pub firing: bool,
    pub timestamp: Timestamp,
}

impl Default for CachedState {
    /// Unhealthy, not firing, observed "now".
    ///
    /// A condition that never reports gets one full unhealthy threshold of
    /// grace from the moment its record is created before it fires.
    fn default() -> Self {
        Self {
            healthy: false,
            firing: false,
            timestamp: Utc::now(),
        }
    }
}

impl CachedState {
    pub fn new(healthy: bool, firing: bool, timestamp: Timestamp) -> Self {
        Self {
            healthy,
            firing,
            timestamp,
        }
    }

    /// Whether `other` differs enough to be worth persisting.
    ///
    /// Timestamps closer together than `tolerance` count as equal.
    pub fn differs_from(&self, other: &CachedState, tolerance: Duration) -> bool {
        if self.healthy != other.healthy || self.firing != other.firing {
            return true;
        }
        let delta = if self.timestamp >= other.timestamp {
            self.timestamp - other.timestamp
        } else {
            other.timestamp - self.timestamp
        };
        let delta = delta.to_std().unwrap_or(Duration::MAX);
        delta >= tolerance
    }

    /// Time elapsed between `timestamp` and `now`, zero if `timestamp` is in the future.
    pub fn elapsed_at(&self, now: Timestamp) -> Duration {
        (now - self.timestamp).to_std().unwrap_or(Duration::ZERO)
    }
}

/// One firing episode. `end` is `None` while the episode is ongoing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentInterval {
    pub start: Timestamp,
    pub end: Option<Timestamp>,
}

impl IncidentInterval {
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }
}

/// Ordered, non-overlapping list of firing episodes for one condition.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncidentIntervals {
    pub items: Vec<IncidentInterval>,
}

impl IncidentIntervals {
    pub fn new() -> Self {
        Self::default()
    }

    /// The currently open interval, if any. Only the last entry can be open.
    pub fn open_interval(&self) -> Option<&IncidentInterval> {
        self.items.last().filter(|i| i.is_open())
    }

    /// Start a new episode at `start`.
    ///
    /// Returns `false` without modifying the list when an episode is already
    /// open, or when `start` precedes the end of the previous episode.
    pub fn open(&mut self, start: Timestamp) -> bool {
        match self.items.last() {
            Some(last) if last.is_open() => false,
            Some(IncidentInterval { end: Some(end), .. }) if start < *end => false,
            _ => {
                self.items.push(IncidentInterval { start, end: None });
                true
            }
        }
    }

    /// Close the open episode at `end`. Returns `false` if nothing was open.
    ///
    /// An `end` earlier than the episode's start is clamped to the start.
    pub fn close(&mut self, end: Timestamp) -> bool {
        match self.items.last_mut() {
            Some(last) if last.is_open() => {
                last.end = Some(end.max(last.start));
                true
            }
            _ => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}
