//! Running evaluators, at most one per condition id

use super::{ConditionMetadata, ConditionPhase, RunningCondition};
use crate::metrics;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

/// A started evaluator and the tasks running its loops.
pub struct EvaluatorHandle {
    condition: Arc<dyn RunningCondition>,
    tasks: Vec<JoinHandle<()>>,
}

impl EvaluatorHandle {
    pub fn new(condition: Arc<dyn RunningCondition>, tasks: Vec<JoinHandle<()>>) -> Self {
        Self { condition, tasks }
    }

    pub fn condition(&self) -> &Arc<dyn RunningCondition> {
        &self.condition
    }

    pub fn metadata(&self) -> &ConditionMetadata {
        self.condition.metadata()
    }

    pub fn is_terminated(&self) -> bool {
        self.condition.phase() == ConditionPhase::Terminated
    }

    /// Cancel the evaluator and wait for both loops to exit.
    pub async fn shutdown(self) {
        self.condition.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::warn!(
                    "Evaluator task for {} ended abnormally: {}",
                    self.condition.metadata().id,
                    e
                );
            }
        }
    }
}

#[derive(Default)]
pub struct ConditionRegistry {
    entries: Mutex<HashMap<String, EvaluatorHandle>>,
}

impl ConditionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start and register an evaluator for `id` unless a live one already exists.
    ///
    /// `start` only runs when the slot is free, so two concurrent callers can
    /// never both start an evaluator for the same id. A terminated evaluator
    /// left in the slot is replaced. Returns whether a new evaluator was started.
    pub fn start_if_absent<F>(&self, id: &str, start: F) -> bool
    where
        F: FnOnce() -> EvaluatorHandle,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = entries.get(id) {
            if !existing.is_terminated() {
                return false;
            }
            tracing::info!("Replacing terminated evaluator for {}", id);
            metrics::EVALUATORS_RUNNING.dec();
        }
        entries.insert(id.to_string(), start());
        metrics::EVALUATORS_RUNNING.inc();
        true
    }

    pub fn remove(&self, id: &str) -> Option<EvaluatorHandle> {
        let removed = self
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if removed.is_some() {
            metrics::EVALUATORS_RUNNING.dec();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn RunningCondition>> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|h| Arc::clone(h.condition()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    /// Ids of every registered condition owned by `cluster_id`, sorted.
    pub fn ids_for_cluster(&self, cluster_id: &str) -> Vec<String> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut ids: Vec<String> = entries
            .values()
            .filter(|h| h.metadata().cluster_id == cluster_id)
            .map(|h| h.metadata().id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Snapshot of every registered condition.
    pub fn list(&self) -> Vec<Arc<dyn RunningCondition>> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut conditions: Vec<Arc<dyn RunningCondition>> =
            entries.values().map(|h| Arc::clone(h.condition())).collect();
        conditions.sort_by(|a, b| a.metadata().id.cmp(&b.metadata().id));
        conditions
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel every evaluator and wait for their loops to exit.
    pub async fn shutdown_all(&self) {
        let handles: Vec<EvaluatorHandle> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.drain().map(|(_, h)| h).collect()
        };
        metrics::EVALUATORS_RUNNING.sub(handles.len() as f64);
        for handle in handles {
            handle.shutdown().await;
        }
    }
}
