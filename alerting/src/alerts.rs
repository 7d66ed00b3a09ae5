//! Trigger/resolve hooks and the alert log.
//!
//! Evaluators call an [`AlertNotifier`] whenever a condition is past its
//! unhealthy threshold (trigger) and when a firing condition turns healthy
//! again (resolve). Label and annotation enrichment is the notifier's job;
//! evaluators pass empty maps.
//!
//! [`AlertLog`] is the in-process notifier: every hook call is emitted via
//! `tracing` on a dedicated target and kept in a bounded history ring buffer.

use crate::clock::{Clock, SystemClock};
use crate::error::HookError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use vigil_shared::types::Timestamp;

pub const ALERT_TARGET: &str = "vigil::alerts";

/// Maximum number of hook invocations kept in history.
const MAX_HISTORY: usize = 500;

pub type Labels = HashMap<String, String>;

#[async_trait]
pub trait AlertNotifier: Send + Sync {
    async fn trigger(
        &self,
        condition_id: &str,
        labels: &Labels,
        annotations: &Labels,
    ) -> Result<(), HookError>;

    async fn resolve(
        &self,
        condition_id: &str,
        labels: &Labels,
        annotations: &Labels,
    ) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Triggered,
    Resolved,
}

/// One recorded hook invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub condition_id: String,
    pub kind: AlertKind,
    pub labels: Labels,
    pub annotations: Labels,
    pub at: Timestamp,
}

/// Thread-safe notifier that logs and remembers the most recent hook calls.
pub struct AlertLog {
    history: Mutex<VecDeque<AlertEvent>>,
    clock: Arc<dyn Clock>,
}

impl AlertLog {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp history entries from `clock`; pass the evaluators' clock so the
    /// history lines up with incident intervals.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            history: Mutex::new(VecDeque::new()),
            clock,
        }
    }

    fn record(&self, condition_id: &str, kind: AlertKind, labels: &Labels, annotations: &Labels) {
        let event = AlertEvent {
            condition_id: condition_id.to_string(),
            kind,
            labels: labels.clone(),
            annotations: annotations.clone(),
            at: self.clock.now(),
        };
        let mut history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.push_back(event);
        while history.len() > MAX_HISTORY {
            history.pop_front();
        }
    }

    /// Most recent hook calls, newest first.
    pub fn list_history(&self, limit: usize) -> Vec<AlertEvent> {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history.iter().rev().take(limit).cloned().collect()
    }

    /// Number of recorded calls of `kind` for `condition_id`.
    pub fn count(&self, condition_id: &str, kind: AlertKind) -> usize {
        let history = self.history.lock().unwrap_or_else(|e| e.into_inner());
        history
            .iter()
            .filter(|e| e.condition_id == condition_id && e.kind == kind)
            .count()
    }

    pub fn history_count(&self) -> usize {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for AlertLog {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertNotifier for AlertLog {
    async fn trigger(
        &self,
        condition_id: &str,
        labels: &Labels,
        annotations: &Labels,
    ) -> Result<(), HookError> {
        warn!(
            target: ALERT_TARGET,
            event = "alert_trigger",
            condition_id = %condition_id,
        );
        self.record(condition_id, AlertKind::Triggered, labels, annotations);
        Ok(())
    }

    async fn resolve(
        &self,
        condition_id: &str,
        labels: &Labels,
        annotations: &Labels,
    ) -> Result<(), HookError> {
        info!(
            target: ALERT_TARGET,
            event = "alert_resolve",
            condition_id = %condition_id,
        );
        self.record(condition_id, AlertKind::Resolved, labels, annotations);
        Ok(())
    }
}

/// Log a firing transition (false to true).
pub fn firing_started(condition_id: &str, condition_name: &str, cluster_id: &str) {
    warn!(
        target: ALERT_TARGET,
        event = "firing_started",
        condition_id = %condition_id,
        condition = %condition_name,
        cluster_id = %cluster_id,
    );
}

/// Log a resolve transition (true to false).
pub fn firing_resolved(condition_id: &str, condition_name: &str, cluster_id: &str) {
    info!(
        target: ALERT_TARGET,
        event = "firing_resolved",
        condition_id = %condition_id,
        condition = %condition_name,
        cluster_id = %cluster_id,
    );
}

/// Log the teardown of a condition on cluster deletion.
pub fn condition_removed(condition_id: &str, cluster_id: &str) {
    info!(
        target: ALERT_TARGET,
        event = "condition_removed",
        condition_id = %condition_id,
        cluster_id = %cluster_id,
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_alert_log_records_history() {
        let log = AlertLog::new();
        let empty = Labels::new();
        log.trigger("agent-disconnect-c1", &empty, &empty).await.unwrap();
        log.trigger("agent-disconnect-c1", &empty, &empty).await.unwrap();
        log.resolve("agent-disconnect-c1", &empty, &empty).await.unwrap();

        assert_eq!(log.history_count(), 3);
        assert_eq!(log.count("agent-disconnect-c1", AlertKind::Triggered), 2);
        assert_eq!(log.count("agent-disconnect-c1", AlertKind::Resolved), 1);

        let recent = log.list_history(1);
        assert_eq!(recent[0].kind, AlertKind::Resolved);
    }

    #[tokio::test]
    async fn test_history_is_bounded() {
        let log = AlertLog::new();
        let empty = Labels::new();
        for _ in 0..(MAX_HISTORY + 10) {
            log.trigger("c", &empty, &empty).await.unwrap();
        }
        assert_eq!(log.history_count(), MAX_HISTORY);
    }

    #[tokio::test]
    async fn test_history_uses_injected_clock() {
        let start = vigil_shared::utils::time::from_unix_secs(1_000).unwrap();
        let clock = crate::clock::ManualClock::new(start);
        let log = AlertLog::with_clock(Arc::new(clock.clone()));
        let empty = Labels::new();

        log.trigger("agent-disconnect-c1", &empty, &empty).await.unwrap();
        clock.advance(std::time::Duration::from_secs(30));
        log.resolve("agent-disconnect-c1", &empty, &empty).await.unwrap();

        let history = log.list_history(2);
        assert_eq!(history[0].at, start + chrono::Duration::seconds(30));
        assert_eq!(history[1].at, start);
    }

    #[test]
    fn test_alert_target_is_static() {
        assert_eq!(ALERT_TARGET, "vigil::alerts");
    }
}
