//! Per-condition evaluation engine
//!
//! A [`ConditionEvaluator`] owns the lifecycle of one condition and runs two
//! concurrent loops once started:
//!
//! - the **subscriber loop** binds to the cluster's durable consumer (retrying
//!   every tick until the stream exists), decodes each health message, and
//!   records `(healthy, timestamp)` through [`ConditionEvaluator::update_state`];
//! - the **evaluate loop** reads the persisted state every tick, fires once the
//!   condition has been unhealthy for longer than the threshold, and resolves
//!   as soon as it is healthy again (after the optional debounce).
//!
//! Both loops stop when the evaluation token is cancelled. Cancellation is
//! permanent; a replacement evaluator must be constructed.
//!
//! Locks: `state_lock` serializes every persisted state write; `firing` is a
//! reader/writer lock over the in-memory flag only. A message-driven write and
//! a policy-driven firing transition may interleave; the persisted
//! `timestamp` disambiguates.

pub mod registry;

use crate::alerts::{self, AlertNotifier, Labels};
use crate::clock::Clock;
use crate::error::StorageError;
use crate::metrics;
use crate::storage::StorageClientSet;
use crate::stream::{ConsumerConfig, StreamBackbone, StreamMessage};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vigil_shared::types::Timestamp;
use vigil_shared::CachedState;

pub use registry::{ConditionRegistry, EvaluatorHandle};

/// Identity of the condition being evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConditionMetadata {
    pub name: String,
    pub id: String,
    pub cluster_id: String,
    pub labels: Labels,
}

/// Cancellation scope and policy timings.
#[derive(Debug, Clone)]
pub struct ConditionContext {
    parent: CancellationToken,
    evaluation: CancellationToken,
    evaluate_interval: Duration,
    unhealthy_threshold: Duration,
    resolve_debounce: Duration,
}

impl ConditionContext {
    /// The evaluation token is a child of `parent`: cancelling either stops both loops.
    pub fn new(
        parent: CancellationToken,
        evaluate_interval: Duration,
        unhealthy_threshold: Duration,
    ) -> Self {
        let evaluation = parent.child_token();
        Self {
            parent,
            evaluation,
            evaluate_interval,
            unhealthy_threshold,
            resolve_debounce: Duration::ZERO,
        }
    }

    /// Require a condition to stay healthy this long before a firing alert resolves.
    pub fn with_resolve_debounce(mut self, debounce: Duration) -> Self {
        self.resolve_debounce = debounce;
        self
    }

    pub fn evaluation_token(&self) -> &CancellationToken {
        &self.evaluation
    }

    pub fn cancel_evaluation(&self) {
        self.evaluation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.evaluation.is_cancelled()
    }
}

/// Binding to the message source and the stores.
pub struct ConditionStorage {
    stream: Arc<dyn StreamBackbone>,
    subject: String,
    durable_consumer: ConsumerConfig,
    clients: Arc<dyn StorageClientSet>,
    inbound_tx: mpsc::Sender<StreamMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<StreamMessage>>>,
}

impl ConditionStorage {
    pub fn new(
        stream: Arc<dyn StreamBackbone>,
        subject: impl Into<String>,
        durable_consumer: ConsumerConfig,
        clients: Arc<dyn StorageClientSet>,
        inbound_buffer: usize,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(inbound_buffer.max(1));
        Self {
            stream,
            subject: subject.into(),
            durable_consumer,
            clients,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<StreamMessage>> {
        self.inbound_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }
}

/// In-memory firing flag and the write-serialization lock.
#[derive(Debug, Default)]
pub struct ConditionState {
    firing: RwLock<bool>,
    state_lock: tokio::sync::Mutex<()>,
    initialized: AtomicBool,
    healthy: AtomicBool,
}

impl ConditionState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Extracts `(healthy, timestamp)` from a decoded health payload.
pub type HealthFn<T> = Arc<dyn Fn(&T) -> (bool, Timestamp) + Send + Sync>;

pub struct ConditionHooks<T> {
    health: HealthFn<T>,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
}

impl<T> ConditionHooks<T> {
    pub fn new<F>(health: F, notifier: Arc<dyn AlertNotifier>, clock: Arc<dyn Clock>) -> Self
    where
        F: Fn(&T) -> (bool, Timestamp) + Send + Sync + 'static,
    {
        Self {
            health: Arc::new(health),
            notifier,
            clock,
        }
    }
}

/// Observable lifecycle phase of an evaluator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionPhase {
    Initializing,
    HealthyNotFiring,
    UnhealthyNotFiring,
    Firing,
    Terminated,
}

/// Type-erased view of a running evaluator.
pub trait RunningCondition: Send + Sync {
    fn metadata(&self) -> &ConditionMetadata;

    fn is_firing(&self) -> bool;

    fn phase(&self) -> ConditionPhase;

    fn cancel(&self);
}

pub struct ConditionEvaluator<T> {
    metadata: ConditionMetadata,
    context: ConditionContext,
    storage: ConditionStorage,
    state: ConditionState,
    hooks: ConditionHooks<T>,
    _payload: PhantomData<fn() -> T>,
}

impl<T> ConditionEvaluator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        metadata: ConditionMetadata,
        context: ConditionContext,
        storage: ConditionStorage,
        state: ConditionState,
        hooks: ConditionHooks<T>,
    ) -> Self {
        Self {
            metadata,
            context,
            storage,
            state,
            hooks,
            _payload: PhantomData,
        }
    }

    pub fn context(&self) -> &ConditionContext {
        &self.context
    }

    pub fn is_firing(&self) -> bool {
        *self.state.firing.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Set the in-memory firing flag, returning its previous value.
    pub fn set_firing(&self, firing: bool) -> bool {
        let mut guard = self.state.firing.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, firing)
    }

    /// Persist `state` if it differs from the stored one. Returns whether a write happened.
    pub async fn update_state(&self, state: &CachedState) -> Result<bool, StorageError> {
        let _guard = self.state.state_lock.lock().await;
        let states = self.storage.clients.states();
        if !states.is_diff(&self.metadata.id, state).await {
            return Ok(false);
        }
        match states.put(&self.metadata.id, state).await {
            Ok(()) => {
                metrics::STATE_WRITES.with_label_values(&["ok"]).inc();
                Ok(true)
            }
            Err(e) => {
                metrics::STATE_WRITES.with_label_values(&["error"]).inc();
                Err(e)
            }
        }
    }

    /// Bootstrap persisted records and restore the in-memory firing flag.
    ///
    /// Creates an empty incident record and a default state when none exist.
    /// Any other storage failure cancels the evaluation scope.
    pub async fn calculate_initial_state(&self) -> Result<(), StorageError> {
        let result = self.load_initial_state().await;
        match &result {
            Ok(state) => {
                if state.firing {
                    self.set_firing(true);
                    info!(
                        "Condition {} ({}) resumes mid-incident",
                        self.metadata.name, self.metadata.id
                    );
                }
                self.state.healthy.store(state.healthy, Ordering::SeqCst);
                self.state.initialized.store(true, Ordering::SeqCst);
            }
            Err(e) => {
                error!(
                    "Failed to bootstrap condition {} ({}): {}",
                    self.metadata.name, self.metadata.id, e
                );
                self.context.cancel_evaluation();
            }
        }
        result.map(|_| ())
    }

    async fn load_initial_state(&self) -> Result<CachedState, StorageError> {
        let id = &self.metadata.id;
        let incidents = self.storage.clients.incidents();
        match incidents.get(id).await {
            Ok(_) => {}
            Err(StorageError::KeyNotFound(_)) => {
                incidents.put(id, &vigil_shared::IncidentIntervals::new()).await?;
            }
            Err(e) => return Err(e),
        }

        let states = self.storage.clients.states();
        match states.get(id).await {
            Ok(state) => Ok(state),
            Err(StorageError::KeyNotFound(_)) => {
                let state = CachedState {
                    timestamp: self.hooks.clock.now(),
                    ..CachedState::default()
                };
                states.put(id, &state).await?;
                Ok(state)
            }
            Err(e) => Err(e),
        }
    }

    /// Bootstrap, then spawn both loops on independent tasks.
    ///
    /// Neither loop starts until the initial state has been restored; if
    /// bootstrap fails both tasks exit immediately.
    pub fn start(self: Arc<Self>) -> EvaluatorHandle {
        let Some(inbound) = self.storage.take_inbound() else {
            error!("Condition {} was already started", self.metadata.id);
            let condition: Arc<dyn RunningCondition> = self;
            return EvaluatorHandle::new(condition, Vec::new());
        };
        let (ready_tx, ready_rx) = oneshot::channel::<bool>();

        let evaluator = Arc::clone(&self);
        let evaluate = tokio::spawn(async move {
            let ready = evaluator.calculate_initial_state().await.is_ok();
            let _ = ready_tx.send(ready);
            if ready {
                evaluator.evaluate_loop().await;
            }
        });

        let evaluator = Arc::clone(&self);
        let subscriber = tokio::spawn(async move {
            if let Ok(true) = ready_rx.await {
                evaluator.subscriber_loop(inbound).await;
            } else {
                debug!("Condition {} never became ready", evaluator.metadata.id);
            }
        });

        let condition: Arc<dyn RunningCondition> = self;
        EvaluatorHandle::new(condition, vec![evaluate, subscriber])
    }

    /// Message ingestion. Runs until the parent or evaluation scope is cancelled.
    pub async fn subscriber_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<StreamMessage>) {
        let evaluation = self.context.evaluation.clone();
        let parent = self.context.parent.clone();

        let mut ticker = tokio::time::interval(self.context.evaluate_interval);
        let _subscription = loop {
            tokio::select! {
                biased;
                _ = evaluation.cancelled() => return,
                _ = ticker.tick() => {
                    match self
                        .storage
                        .stream
                        .subscribe(
                            &self.storage.subject,
                            &self.storage.durable_consumer,
                            self.storage.inbound_tx.clone(),
                        )
                        .await
                    {
                        Ok(subscription) => break subscription,
                        Err(e) => {
                            metrics::SUBSCRIBE_RETRIES.inc();
                            warn!(
                                "Failed to subscribe condition {} to {}: {}",
                                self.metadata.id, self.storage.subject, e
                            );
                        }
                    }
                }
            }
        };
        drop(ticker);
        debug!(
            "Condition {} subscribed to {} via {}",
            self.metadata.id, self.storage.subject, self.storage.durable_consumer.durable_name
        );

        loop {
            tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = evaluation.cancelled() => break,
                msg = inbound.recv() => match msg {
                    Some(msg) => self.process_message(msg).await,
                    None => break,
                },
            }
        }
        self.context.cancel_evaluation();
    }

    async fn process_message(&self, msg: StreamMessage) {
        match serde_json::from_slice::<T>(&msg.data) {
            Ok(payload) => {
                let (healthy, timestamp) = (self.hooks.health)(&payload);
                self.state.healthy.store(healthy, Ordering::SeqCst);
                let incoming = CachedState::new(healthy, self.is_firing(), timestamp);
                if let Err(e) = self.update_state(&incoming).await {
                    error!("Failed to persist state for {}: {}", self.metadata.id, e);
                }
                metrics::MESSAGES_TOTAL.with_label_values(&["ok"]).inc();
            }
            Err(e) => {
                metrics::MESSAGES_TOTAL
                    .with_label_values(&["decode_error"])
                    .inc();
                error!(
                    "Failed to decode health message #{} on {} for {}: {}",
                    msg.sequence, msg.subject, self.metadata.id, e
                );
            }
        }
        msg.ack();
    }

    /// Policy tick loop. Cancels the evaluation scope when it exits.
    pub async fn evaluate_loop(self: Arc<Self>) {
        let evaluation = self.context.evaluation.clone();
        let parent = self.context.parent.clone();
        let mut ticker = tokio::time::interval(self.context.evaluate_interval);
        // the first tick of an interval completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = parent.cancelled() => break,
                _ = evaluation.cancelled() => break,
                _ = ticker.tick() => {
                    let now = self.hooks.clock.now();
                    self.evaluate_once(now).await;
                }
            }
        }
        self.context.cancel_evaluation();
    }

    /// One policy evaluation against the persisted state at `now`.
    pub async fn evaluate_once(&self, now: Timestamp) {
        let id = &self.metadata.id;
        let last = match self.storage.clients.states().get(id).await {
            Ok(state) => state,
            Err(e) => {
                debug!("Skipping evaluation of {}: {}", id, e);
                return;
            }
        };
        self.state.healthy.store(last.healthy, Ordering::SeqCst);

        if !last.healthy {
            debug!("Condition {} is unhealthy", self.metadata.name);
            if last.elapsed_at(now) > self.context.unhealthy_threshold {
                self.trigger(&last, now).await;
            } else if self.set_firing(false) {
                // unhealthy again with a fresh timestamp, not yet past the threshold
                self.clear_firing(&last, now).await;
            }
        } else if self.is_firing() {
            if last.elapsed_at(now) < self.context.resolve_debounce {
                debug!("Condition {} healthy, resolve debounced", self.metadata.name);
                return;
            }
            if self.set_firing(false) {
                debug!(
                    "Condition {} is now healthy again after having fired",
                    self.metadata.name
                );
                self.clear_firing(&last, now).await;
            }
        }
    }

    async fn trigger(&self, last: &CachedState, now: Timestamp) {
        let id = &self.metadata.id;
        debug!("Triggering alert for condition {}", self.metadata.name);
        if let Err(e) = self
            .hooks
            .notifier
            .trigger(id, &Labels::new(), &Labels::new())
            .await
        {
            metrics::HOOK_FAILURES.with_label_values(&["trigger"]).inc();
            error!("{}", e);
        }

        if self.set_firing(true) {
            return;
        }
        // keep the unhealthy observation time so elapsed keeps growing
        let firing = CachedState::new(last.healthy, true, last.timestamp);
        if let Err(e) = self.update_state(&firing).await {
            error!("Failed to persist firing state for {}: {}", id, e);
        }
        if let Err(e) = self
            .storage
            .clients
            .incidents()
            .open_interval(id, now)
            .await
        {
            error!("Failed to open incident for {}: {}", id, e);
        }
        metrics::ALERTS_TRIGGERED.inc();
        alerts::firing_started(id, &self.metadata.name, &self.metadata.cluster_id);
    }

    /// Persist and record a true-to-false firing transition that already
    /// happened in memory.
    async fn clear_firing(&self, last: &CachedState, now: Timestamp) {
        let id = &self.metadata.id;
        let cleared = CachedState::new(last.healthy, false, last.timestamp);
        if let Err(e) = self.update_state(&cleared).await {
            error!("Failed to persist resolved state for {}: {}", id, e);
        }
        if let Err(e) = self
            .storage
            .clients
            .incidents()
            .close_interval(id, now)
            .await
        {
            error!("Failed to close incident for {}: {}", id, e);
        }
        if let Err(e) = self
            .hooks
            .notifier
            .resolve(id, &Labels::new(), &Labels::new())
            .await
        {
            metrics::HOOK_FAILURES.with_label_values(&["resolve"]).inc();
            error!("{}", e);
        }
        metrics::ALERTS_RESOLVED.inc();
        alerts::firing_resolved(id, &self.metadata.name, &self.metadata.cluster_id);
    }
}

impl<T> RunningCondition for ConditionEvaluator<T>
where
    T: DeserializeOwned + Send + 'static,
{
    fn metadata(&self) -> &ConditionMetadata {
        &self.metadata
    }

    fn is_firing(&self) -> bool {
        ConditionEvaluator::is_firing(self)
    }

    fn phase(&self) -> ConditionPhase {
        if self.context.is_cancelled() {
            ConditionPhase::Terminated
        } else if !self.state.initialized.load(Ordering::SeqCst) {
            ConditionPhase::Initializing
        } else if ConditionEvaluator::is_firing(self) {
            ConditionPhase::Firing
        } else if self.state.healthy.load(Ordering::SeqCst) {
            ConditionPhase::HealthyNotFiring
        } else {
            ConditionPhase::UnhealthyNotFiring
        }
    }

    fn cancel(&self) {
        self.context.cancel_evaluation();
    }
}

#[cfg(test)]
mod tests;
