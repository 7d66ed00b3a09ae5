//! Error types shared across the alerting service

use thiserror::Error;

/// Failures of the condition state and incident stores.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No record exists under this key. Drives first-run bootstrap.
    #[error("key not found: {0}")]
    KeyNotFound(String),

    /// A stored record could not be encoded or decoded.
    #[error("codec error for key {key}: {source}")]
    Codec {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// Any other backend failure (connectivity, quota, poisoned state, ...).
    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StorageError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::KeyNotFound(_))
    }
}

/// Failures of the durable message stream.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("stream not found: {0}")]
    StreamNotFound(String),

    #[error("no stream captures subject {0}")]
    NoStreamForSubject(String),

    #[error("durable consumer not found: {0}")]
    ConsumerNotFound(String),

    /// A consumer with this name exists with a different configuration.
    #[error("durable consumer {0} already exists with a different configuration")]
    ConsumerConflict(String),

    #[error("invalid subject: {0}")]
    InvalidSubject(String),

    /// The backbone is not accepting operations right now; callers may retry.
    #[error("stream backbone unavailable: {0}")]
    Unavailable(String),
}

/// Failure reported by a trigger or resolve hook.
#[derive(Debug, Error)]
#[error("alert hook for condition {condition_id} failed: {reason}")]
pub struct HookError {
    pub condition_id: String,
    pub reason: String,
}

/// Failures while provisioning or tearing down a cluster's conditions.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("condition {0} is not running")]
    ConditionNotFound(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Stream(#[from] StreamError),
}
