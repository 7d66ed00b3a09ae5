//! Cluster lifecycle provisioning
//!
//! [`ClusterLifecycle`] reacts to management-plane watch events. When a
//! cluster is created it gets a durable consumer on the shared ingress stream
//! and two default conditions:
//!
//! - `agent-disconnect-<cluster>`: fires when the agent has been disconnected
//!   for longer than `disconnect_threshold`;
//! - `capability-health-<cluster>`: fires when the agent's capabilities have
//!   been unhealthy for longer than `capability_threshold`.
//!
//! Deleting the cluster stops both evaluators and removes their persisted
//! state and incident history.

use crate::alerts::{self, AlertNotifier, Labels};
use crate::clock::Clock;
use crate::condition::{
    ConditionContext, ConditionEvaluator, ConditionHooks, ConditionMetadata, ConditionPhase,
    ConditionRegistry, ConditionState, ConditionStorage,
};
use crate::config::{AlertingConfig, EvaluationConfig, StreamSettings};
use crate::error::{ProvisionError, StorageError, StreamError};
use crate::router::{hook_fn, EventRouter, Hook};
use crate::storage::StorageClientSet;
use crate::stream::{self, StreamBackbone};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vigil_shared::types::Timestamp;
use vigil_shared::{
    AgentStatus, CachedState, CapabilityHealth, IncidentIntervals, WatchEvent, WatchEventType,
};

pub const DISCONNECT_CONDITION: &str = "agent-disconnect";
pub const CAPABILITY_CONDITION: &str = "capability-health";

/// Subject kinds under `<prefix>.<kind>.<cluster>`
pub const STATUS_SUBJECT_KIND: &str = "status";
pub const CAPABILITY_SUBJECT_KIND: &str = "capability";

/// Deterministic id of a default condition for a cluster.
pub fn condition_id(kind: &str, cluster_id: &str) -> String {
    format!("{}-{}", kind, cluster_id)
}

struct ConditionTemplate {
    kind: &'static str,
    name: &'static str,
    subject_kind: &'static str,
}

const DISCONNECT: ConditionTemplate = ConditionTemplate {
    kind: DISCONNECT_CONDITION,
    name: "Agent disconnected",
    subject_kind: STATUS_SUBJECT_KIND,
};

const CAPABILITY: ConditionTemplate = ConditionTemplate {
    kind: CAPABILITY_CONDITION,
    name: "Agent capabilities unhealthy",
    subject_kind: CAPABILITY_SUBJECT_KIND,
};

/// Everything known about one condition, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ConditionStatus {
    pub id: String,
    pub metadata: Option<ConditionMetadata>,
    pub phase: Option<ConditionPhase>,
    pub firing: bool,
    pub state: Option<CachedState>,
    pub incidents: Option<IncidentIntervals>,
}

pub struct ClusterLifecycle {
    stream: Arc<dyn StreamBackbone>,
    clients: Arc<dyn StorageClientSet>,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    registry: ConditionRegistry,
    evaluation: EvaluationConfig,
    settings: StreamSettings,
}

impl ClusterLifecycle {
    /// Ensure the shared ingress stream exists. Fails if it cannot be created.
    pub async fn new(
        stream: Arc<dyn StreamBackbone>,
        clients: Arc<dyn StorageClientSet>,
        notifier: Arc<dyn AlertNotifier>,
        clock: Arc<dyn Clock>,
        config: &AlertingConfig,
    ) -> Result<Self, ProvisionError> {
        let settings = config.stream.clone();
        stream
            .ensure_stream(&stream::ingress_stream(
                &settings.name,
                &settings.subject_prefix,
                settings.max_messages,
            ))
            .await?;
        info!(
            "Ingress stream {} ready on {}.>",
            settings.name, settings.subject_prefix
        );

        Ok(Self {
            stream,
            clients,
            notifier,
            clock,
            registry: ConditionRegistry::new(),
            evaluation: config.evaluation.clone(),
            settings,
        })
    }

    pub fn registry(&self) -> &ConditionRegistry {
        &self.registry
    }

    /// Create the cluster's durable consumer. Idempotent.
    pub async fn ensure_cluster_consumer(&self, cluster_id: &str) -> Result<(), StreamError> {
        let consumer = stream::cluster_consumer(&self.settings.subject_prefix, cluster_id);
        self.stream
            .ensure_durable_consumer(&self.settings.name, &consumer)
            .await?;
        debug!(
            "Durable consumer {} ready for cluster {}",
            consumer.durable_name, cluster_id
        );
        Ok(())
    }

    /// Start the disconnect condition for `cluster_id` under `ctx`.
    /// Returns `false` if it was already running.
    pub fn create_default_disconnect(&self, ctx: CancellationToken, cluster_id: &str) -> bool {
        self.spawn_condition(
            ctx,
            &DISCONNECT,
            cluster_id,
            self.evaluation.disconnect_threshold,
            AgentStatus::health,
        )
    }

    /// Start the capability-health condition for `cluster_id` under `ctx`.
    /// Returns `false` if it was already running.
    pub fn create_default_capability_health(
        &self,
        ctx: CancellationToken,
        cluster_id: &str,
    ) -> bool {
        self.spawn_condition(
            ctx,
            &CAPABILITY,
            cluster_id,
            self.evaluation.capability_threshold,
            CapabilityHealth::health,
        )
    }

    fn spawn_condition<T, F>(
        &self,
        ctx: CancellationToken,
        template: &ConditionTemplate,
        cluster_id: &str,
        threshold: Duration,
        health: F,
    ) -> bool
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(&T) -> (bool, Timestamp) + Send + Sync + 'static,
    {
        let id = condition_id(template.kind, cluster_id);
        let started = self.registry.start_if_absent(&id, || {
            let mut labels = Labels::new();
            labels.insert("cluster_id".to_string(), cluster_id.to_string());
            labels.insert("condition".to_string(), template.kind.to_string());
            let metadata = ConditionMetadata {
                name: template.name.to_string(),
                id: id.clone(),
                cluster_id: cluster_id.to_string(),
                labels,
            };

            let context =
                ConditionContext::new(ctx, self.evaluation.evaluate_interval, threshold)
                    .with_resolve_debounce(self.evaluation.resolve_debounce);
            let prefix = &self.settings.subject_prefix;
            let storage = ConditionStorage::new(
                Arc::clone(&self.stream),
                stream::health_subject(prefix, template.subject_kind, cluster_id),
                stream::cluster_consumer(prefix, cluster_id),
                Arc::clone(&self.clients),
                self.evaluation.inbound_buffer,
            );
            let hooks =
                ConditionHooks::new(health, Arc::clone(&self.notifier), Arc::clone(&self.clock));

            Arc::new(ConditionEvaluator::<T>::new(
                metadata,
                context,
                storage,
                ConditionState::new(),
                hooks,
            ))
            .start()
        });

        if started {
            info!("Started condition {} for cluster {}", id, cluster_id);
        } else {
            debug!("Condition {} already running", id);
        }
        started
    }

    pub async fn on_delete_disconnect(&self, cluster_id: &str) -> Result<(), ProvisionError> {
        self.teardown(DISCONNECT_CONDITION, cluster_id).await
    }

    pub async fn on_delete_capability_health(
        &self,
        cluster_id: &str,
    ) -> Result<(), ProvisionError> {
        self.teardown(CAPABILITY_CONDITION, cluster_id).await
    }

    /// Stop the evaluator (if running) and delete its persisted records.
    ///
    /// Fails with [`ProvisionError::ConditionNotFound`] when there was neither
    /// a running evaluator nor any stored record.
    async fn teardown(&self, kind: &str, cluster_id: &str) -> Result<(), ProvisionError> {
        let id = condition_id(kind, cluster_id);
        let mut found = match self.registry.remove(&id) {
            Some(handle) => {
                handle.shutdown().await;
                true
            }
            None => false,
        };

        let deleted_state = self.clients.states().delete(&id).await;
        let deleted_incidents = self.clients.incidents().delete(&id).await;
        for result in [deleted_state, deleted_incidents] {
            match result {
                Ok(()) => found = true,
                Err(StorageError::KeyNotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }

        if !found {
            return Err(ProvisionError::ConditionNotFound(id));
        }
        alerts::condition_removed(&id, cluster_id);
        Ok(())
    }

    /// Snapshot of a condition's runtime and persisted state, `None` if unknown.
    pub async fn condition_status(
        &self,
        id: &str,
    ) -> Result<Option<ConditionStatus>, StorageError> {
        let running = self.registry.get(id);
        let state = optional(self.clients.states().get(id).await)?;
        let incidents = optional(self.clients.incidents().get(id).await)?;
        if running.is_none() && state.is_none() && incidents.is_none() {
            return Ok(None);
        }

        Ok(Some(ConditionStatus {
            id: id.to_string(),
            metadata: running.as_ref().map(|c| c.metadata().clone()),
            phase: running.as_ref().map(|c| c.phase()),
            firing: running.as_ref().map(|c| c.is_firing()).unwrap_or(false),
            state,
            incidents,
        }))
    }

    /// Stop every evaluator and wait for their loops to exit.
    pub async fn shutdown(&self) {
        let count = self.registry.len();
        self.registry.shutdown_all().await;
        info!("Stopped {} condition evaluators", count);
    }

    /// Router with the lifecycle hooks registered. Hooks run under `parent`.
    ///
    /// Created: durable consumer, disconnect condition, capability condition.
    /// Deleted: disconnect teardown, capability teardown.
    /// Updated events match nothing.
    pub fn router(self: &Arc<Self>, parent: CancellationToken) -> EventRouter<WatchEvent> {
        let mut router = EventRouter::new(parent);
        router.register_event(
            |event: &WatchEvent| event.event_type == WatchEventType::Created,
            vec![
                self.action(|lifecycle, _ctx, cluster| async move {
                    if let Err(e) = lifecycle.ensure_cluster_consumer(&cluster).await {
                        panic!(
                            "failed to create durable consumer for cluster {}: {}",
                            cluster, e
                        );
                    }
                    Ok(())
                }),
                self.action(|lifecycle, ctx, cluster| async move {
                    lifecycle.create_default_disconnect(ctx, &cluster);
                    Ok(())
                }),
                self.action(|lifecycle, ctx, cluster| async move {
                    lifecycle.create_default_capability_health(ctx, &cluster);
                    Ok(())
                }),
            ],
        );
        router.register_event(
            |event: &WatchEvent| event.event_type == WatchEventType::Deleted,
            vec![
                self.action(|lifecycle, _ctx, cluster| async move {
                    lifecycle.on_delete_disconnect(&cluster).await?;
                    Ok(())
                }),
                self.action(|lifecycle, _ctx, cluster| async move {
                    lifecycle.on_delete_capability_health(&cluster).await?;
                    Ok(())
                }),
            ],
        );
        router
    }

    fn action<F, Fut>(self: &Arc<Self>, f: F) -> Hook<WatchEvent>
    where
        F: Fn(Arc<Self>, CancellationToken, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let lifecycle = Arc::clone(self);
        hook_fn(move |ctx: CancellationToken, event: WatchEvent| {
            f(Arc::clone(&lifecycle), ctx, event.cluster.id)
        })
    }
}

fn optional<V>(result: Result<V, StorageError>) -> Result<Option<V>, StorageError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(StorageError::KeyNotFound(_)) => Ok(None),
        Err(e) => Err(e),
    }
}
