//! Condition state and incident stores
//!
//! Both stores are keyed by condition id. Callers serialize writes for one
//! id themselves (the evaluator's state lock), so implementations only need
//! a single `put` to be atomic per key.

pub mod kv;

use crate::error::StorageError;
use async_trait::async_trait;
use vigil_shared::types::Timestamp;
use vigil_shared::{CachedState, IncidentIntervals};

pub use kv::{InMemoryBucket, KeyValueBucket, KvClientSet};

/// Last observed state per condition.
#[async_trait]
pub trait StateStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<CachedState, StorageError>;

    async fn put(&self, id: &str, state: &CachedState) -> Result<(), StorageError>;

    /// Whether `candidate` differs from the persisted state. Missing or
    /// unreadable state always counts as different.
    async fn is_diff(&self, id: &str, candidate: &CachedState) -> bool;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;
}

/// Firing episodes per condition.
#[async_trait]
pub trait IncidentStore: Send + Sync {
    async fn get(&self, id: &str) -> Result<IncidentIntervals, StorageError>;

    async fn put(&self, id: &str, intervals: &IncidentIntervals) -> Result<(), StorageError>;

    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Open a new episode at `start`. A no-op if one is already open.
    async fn open_interval(&self, id: &str, start: Timestamp) -> Result<(), StorageError> {
        let mut intervals = match self.get(id).await {
            Ok(intervals) => intervals,
            Err(StorageError::KeyNotFound(_)) => IncidentIntervals::new(),
            Err(e) => return Err(e),
        };
        if !intervals.open(start) {
            tracing::debug!("Incident for {} already open, not opening another", id);
            return Ok(());
        }
        self.put(id, &intervals).await
    }

    /// Close the open episode at `end`. A no-op if none is open.
    async fn close_interval(&self, id: &str, end: Timestamp) -> Result<(), StorageError> {
        let mut intervals = self.get(id).await?;
        if !intervals.close(end) {
            tracing::debug!("No open incident for {}, nothing to close", id);
            return Ok(());
        }
        self.put(id, &intervals).await
    }
}

/// Handle to both stores, shared by every evaluator in the process.
pub trait StorageClientSet: Send + Sync {
    fn states(&self) -> &dyn StateStore;

    fn incidents(&self) -> &dyn IncidentStore;
}
