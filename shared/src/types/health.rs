//! Health telemetry published by agents onto the ingress stream

use super::Timestamp;
use serde::{Deserialize, Serialize};

/// Connection status of an agent, as seen by the management plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub connected: bool,

    /// When the agent last changed connection state
    pub timestamp: Timestamp,
}

/// Readiness of the capabilities installed on an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityHealth {
    pub ready: bool,

    /// Human-readable reasons the agent is not ready (empty when ready)
    #[serde(default)]
    pub conditions: Vec<String>,

    /// When readiness was last evaluated to its current value
    pub timestamp: Timestamp,
}

impl AgentStatus {
    /// Health extractor used by the disconnect condition.
    pub fn health(&self) -> (bool, Timestamp) {
        (self.connected, self.timestamp)
    }
}

impl CapabilityHealth {
    /// Health extractor used by the capability-health condition.
    ///
    /// An agent reporting ready with outstanding conditions is treated as unhealthy.
    pub fn health(&self) -> (bool, Timestamp) {
        (self.ready && self.conditions.is_empty(), self.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_capability_health_requires_no_conditions() {
        let now = Utc::now();
        let ok = CapabilityHealth {
            ready: true,
            conditions: vec![],
            timestamp: now,
        };
        assert_eq!(ok.health(), (true, now));

        let degraded = CapabilityHealth {
            ready: true,
            conditions: vec!["metrics: remote write failing".into()],
            timestamp: now,
        };
        assert!(!degraded.health().0);
    }

    #[test]
    fn test_decode_agent_status() {
        let status: AgentStatus =
            serde_json::from_str(r#"{"connected":false,"timestamp":"2024-01-01T00:00:00Z"}"#)
                .unwrap();
        assert!(!status.health().0);
    }
}
