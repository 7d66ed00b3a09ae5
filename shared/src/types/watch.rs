//! Cluster lifecycle notifications emitted by the management plane

use serde::{Deserialize, Serialize};

/// Kind of lifecycle change a watch event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WatchEventType {
    Created,
    Updated,
    Deleted,
}

/// Reference to the cluster a watch event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterRef {
    pub id: String,
}

/// A single lifecycle notification: `{type, cluster: {id}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    pub cluster: ClusterRef,
}

impl WatchEvent {
    pub fn new(event_type: WatchEventType, cluster_id: impl Into<String>) -> Self {
        Self {
            event_type,
            cluster: ClusterRef {
                id: cluster_id.into(),
            },
        }
    }

    pub fn created(cluster_id: impl Into<String>) -> Self {
        Self::new(WatchEventType::Created, cluster_id)
    }

    pub fn updated(cluster_id: impl Into<String>) -> Self {
        Self::new(WatchEventType::Updated, cluster_id)
    }

    pub fn deleted(cluster_id: impl Into<String>) -> Self {
        Self::new(WatchEventType::Deleted, cluster_id)
    }

    pub fn cluster_id(&self) -> &str {
        &self.cluster.id
    }
}
