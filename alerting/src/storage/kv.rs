//! Key-value backed stores
//!
//! Records are stored as JSON in a [`KeyValueBucket`], one bucket for states
//! and one for incidents. [`InMemoryBucket`] is the process-local bucket used
//! when no external KV engine is wired in.

use super::{IncidentStore, StateStore, StorageClientSet};
use crate::error::StorageError;
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use vigil_shared::{CachedState, IncidentIntervals};

pub const STATES_BUCKET: &str = "alerting-condition-states";
pub const INCIDENTS_BUCKET: &str = "alerting-incident-intervals";

/// Minimal KV contract: per-key atomic get/put/delete.
#[async_trait]
pub trait KeyValueBucket: Send + Sync {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError>;

    /// Store `value`, returning the new revision of the key.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StorageError>;

    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    async fn keys(&self) -> Result<Vec<String>, StorageError>;
}

#[derive(Debug)]
struct Entry {
    value: Vec<u8>,
    revision: u64,
}

/// Process-local bucket. Thread-safe.
#[derive(Debug)]
pub struct InMemoryBucket {
    name: String,
    entries: RwLock<HashMap<String, Entry>>,
    revision: AtomicU64,
}

impl InMemoryBucket {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: RwLock::new(HashMap::new()),
            revision: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total number of successful puts since creation.
    pub fn writes(&self) -> u64 {
        self.revision.load(Ordering::SeqCst)
    }

    /// Current revision of `key`, if present.
    pub fn revision_of(&self, key: &str) -> Option<u64> {
        let entries = self.entries.read().ok()?;
        entries.get(key).map(|e| e.revision)
    }
}

#[async_trait]
impl KeyValueBucket for InMemoryBucket {
    async fn get(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        entries
            .get(key)
            .map(|e| e.value.clone())
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<u64, StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let revision = self.revision.fetch_add(1, Ordering::SeqCst) + 1;
        entries.insert(key.to_string(), Entry { value, revision });
        Ok(revision)
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut entries = self
            .entries
            .write()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        entries
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| StorageError::KeyNotFound(key.to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        let entries = self
            .entries
            .read()
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

fn encode<V: Serialize>(key: &str, value: &V) -> Result<Vec<u8>, StorageError> {
    serde_json::to_vec(value).map_err(|source| StorageError::Codec {
        key: key.to_string(),
        source,
    })
}

fn decode<V: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<V, StorageError> {
    serde_json::from_slice(bytes).map_err(|source| StorageError::Codec {
        key: key.to_string(),
        source,
    })
}

/// [`StateStore`] over a bucket.
pub struct KvStateStore {
    bucket: Arc<dyn KeyValueBucket>,
    tolerance: Duration,
}

impl KvStateStore {
    /// Timestamps closer than `tolerance` are not considered a difference.
    pub fn new(bucket: Arc<dyn KeyValueBucket>, tolerance: Duration) -> Self {
        Self { bucket, tolerance }
    }
}

#[async_trait]
impl StateStore for KvStateStore {
    async fn get(&self, id: &str) -> Result<CachedState, StorageError> {
        let bytes = self.bucket.get(id).await?;
        decode(id, &bytes)
    }

    async fn put(&self, id: &str, state: &CachedState) -> Result<(), StorageError> {
        let bytes = encode(id, state)?;
        self.bucket.put(id, bytes).await.map(|_| ())
    }

    async fn is_diff(&self, id: &str, candidate: &CachedState) -> bool {
        match self.get(id).await {
            Ok(current) => current.differs_from(candidate, self.tolerance),
            Err(_) => true,
        }
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.bucket.delete(id).await
    }
}

/// [`IncidentStore`] over a bucket.
pub struct KvIncidentStore {
    bucket: Arc<dyn KeyValueBucket>,
}

impl KvIncidentStore {
    pub fn new(bucket: Arc<dyn KeyValueBucket>) -> Self {
        Self { bucket }
    }
}

#[async_trait]
impl IncidentStore for KvIncidentStore {
    async fn get(&self, id: &str) -> Result<IncidentIntervals, StorageError> {
        let bytes = self.bucket.get(id).await?;
        decode(id, &bytes)
    }

    async fn put(&self, id: &str, intervals: &IncidentIntervals) -> Result<(), StorageError> {
        let bytes = encode(id, intervals)?;
        self.bucket.put(id, bytes).await.map(|_| ())
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.bucket.delete(id).await
    }
}

/// Both stores over a pair of buckets.
pub struct KvClientSet {
    states: KvStateStore,
    incidents: KvIncidentStore,
}

impl KvClientSet {
    pub fn new(
        states: Arc<dyn KeyValueBucket>,
        incidents: Arc<dyn KeyValueBucket>,
        tolerance: Duration,
    ) -> Self {
        Self {
            states: KvStateStore::new(states, tolerance),
            incidents: KvIncidentStore::new(incidents),
        }
    }

    /// Client set over two fresh [`InMemoryBucket`]s.
    pub fn in_memory(tolerance: Duration) -> Self {
        Self::new(
            Arc::new(InMemoryBucket::new(STATES_BUCKET)),
            Arc::new(InMemoryBucket::new(INCIDENTS_BUCKET)),
            tolerance,
        )
    }
}

impl StorageClientSet for KvClientSet {
    fn states(&self) -> &dyn StateStore {
        &self.states
    }

    fn incidents(&self) -> &dyn IncidentStore {
        &self.incidents
    }
}
