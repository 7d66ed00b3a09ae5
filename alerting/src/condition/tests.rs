use super::*;
use crate::alerts::{AlertKind, AlertLog};
use crate::clock::{ManualClock, TokioClock};
use crate::error::HookError;
use crate::storage::{IncidentStore, InMemoryBucket, KeyValueBucket, KvClientSet, StateStore};
use crate::stream::{self, AckHandler, InMemoryStream};
use async_trait::async_trait;
use std::sync::atomic::AtomicUsize;
use vigil_shared::utils::time;
use vigil_shared::{AgentStatus, IncidentInterval, IncidentIntervals};

const ID: &str = "agent-disconnect-c1";
const STREAM: &str = "AGENT_HEALTH";
const PREFIX: &str = "agent-health";

fn ts(secs: i64) -> Timestamp {
    time::from_unix_secs(secs).unwrap()
}

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

struct Fixture {
    evaluator: Arc<ConditionEvaluator<AgentStatus>>,
    clock: ManualClock,
    alerts: Arc<AlertLog>,
    states: Arc<InMemoryBucket>,
    clients: Arc<KvClientSet>,
}

impl Fixture {
    fn new(threshold: Duration, debounce: Duration) -> Self {
        let clock = ManualClock::new(ts(1_000));
        let alerts = Arc::new(AlertLog::new());
        let states = Arc::new(InMemoryBucket::new("states"));
        let clients = Arc::new(KvClientSet::new(
            states.clone(),
            Arc::new(InMemoryBucket::new("incidents")),
            secs(1),
        ));
        let evaluator = build(
            clients.clone(),
            alerts.clone(),
            Arc::new(clock.clone()),
            Arc::new(InMemoryStream::new()),
            CancellationToken::new(),
            threshold,
            debounce,
        );
        Self {
            evaluator,
            clock,
            alerts,
            states,
            clients,
        }
    }

    async fn state(&self) -> CachedState {
        self.clients.states().get(ID).await.unwrap()
    }

    async fn incidents(&self) -> IncidentIntervals {
        self.clients.incidents().get(ID).await.unwrap()
    }
}

fn build(
    clients: Arc<dyn StorageClientSet>,
    notifier: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    backbone: Arc<dyn StreamBackbone>,
    parent: CancellationToken,
    threshold: Duration,
    debounce: Duration,
) -> Arc<ConditionEvaluator<AgentStatus>> {
    let metadata = ConditionMetadata {
        name: "Agent disconnected".to_string(),
        id: ID.to_string(),
        cluster_id: "c1".to_string(),
        labels: Labels::new(),
    };
    let context = ConditionContext::new(parent, secs(10), threshold).with_resolve_debounce(debounce);
    let storage = ConditionStorage::new(
        backbone,
        stream::health_subject(PREFIX, "status", "c1"),
        stream::cluster_consumer(PREFIX, "c1"),
        clients,
        16,
    );
    let hooks = ConditionHooks::new(AgentStatus::health, notifier, clock);
    Arc::new(ConditionEvaluator::new(
        metadata,
        context,
        storage,
        ConditionState::new(),
        hooks,
    ))
}

struct BrokenBucket;

#[async_trait]
impl KeyValueBucket for BrokenBucket {
    async fn get(&self, _key: &str) -> Result<Vec<u8>, StorageError> {
        Err(StorageError::Backend("bucket offline".to_string()))
    }

    async fn put(&self, _key: &str, _value: Vec<u8>) -> Result<u64, StorageError> {
        Err(StorageError::Backend("bucket offline".to_string()))
    }

    async fn delete(&self, _key: &str) -> Result<(), StorageError> {
        Err(StorageError::Backend("bucket offline".to_string()))
    }

    async fn keys(&self) -> Result<Vec<String>, StorageError> {
        Err(StorageError::Backend("bucket offline".to_string()))
    }
}

struct RejectingNotifier;

#[async_trait]
impl AlertNotifier for RejectingNotifier {
    async fn trigger(&self, id: &str, _: &Labels, _: &Labels) -> Result<(), HookError> {
        Err(HookError {
            condition_id: id.to_string(),
            reason: "receiver unreachable".to_string(),
        })
    }

    async fn resolve(&self, id: &str, _: &Labels, _: &Labels) -> Result<(), HookError> {
        Err(HookError {
            condition_id: id.to_string(),
            reason: "receiver unreachable".to_string(),
        })
    }
}

#[derive(Default)]
struct CountingAcker(AtomicUsize);

impl AckHandler for CountingAcker {
    fn ack(&self, _sequence: u64) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

fn message(data: Vec<u8>, acker: &Arc<CountingAcker>) -> StreamMessage {
    let acker: Arc<dyn AckHandler> = acker.clone();
    StreamMessage::new("agent-health.status.c1", 1, data, Some(acker))
}

fn status(connected: bool, at: i64) -> Vec<u8> {
    serde_json::to_vec(&AgentStatus {
        connected,
        timestamp: ts(at),
    })
    .unwrap()
}

#[tokio::test]
async fn test_initial_state_creates_defaults() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.clock.advance(secs(5));
    f.evaluator.calculate_initial_state().await.unwrap();

    assert_eq!(f.state().await, CachedState::new(false, false, ts(1_005)));
    assert!(f.incidents().await.is_empty());
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.evaluator.phase(), ConditionPhase::UnhealthyNotFiring);
}

#[tokio::test]
async fn test_initial_state_resumes_firing() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.clients
        .states()
        .put(ID, &CachedState::new(false, true, ts(500)))
        .await
        .unwrap();
    f.clients.incidents().open_interval(ID, ts(600)).await.unwrap();

    f.evaluator.calculate_initial_state().await.unwrap();

    assert!(f.evaluator.is_firing());
    assert_eq!(f.evaluator.phase(), ConditionPhase::Firing);
    // existing records are left alone
    assert_eq!(f.state().await.timestamp, ts(500));
    assert_eq!(f.incidents().await.len(), 1);
}

#[tokio::test]
async fn test_initial_state_failure_cancels_evaluation() {
    let clients = Arc::new(KvClientSet::new(
        Arc::new(BrokenBucket),
        Arc::new(BrokenBucket),
        secs(1),
    ));
    let evaluator = build(
        clients,
        Arc::new(AlertLog::new()),
        Arc::new(ManualClock::new(ts(1_000))),
        Arc::new(InMemoryStream::new()),
        CancellationToken::new(),
        secs(60),
        Duration::ZERO,
    );

    assert!(evaluator.calculate_initial_state().await.is_err());
    assert!(evaluator.context().is_cancelled());
    assert_eq!(evaluator.phase(), ConditionPhase::Terminated);
}

#[tokio::test]
async fn test_fires_only_strictly_past_threshold() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.calculate_initial_state().await.unwrap();

    f.evaluator.evaluate_once(ts(1_030)).await;
    f.evaluator.evaluate_once(ts(1_060)).await;
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.alerts.count(ID, AlertKind::Triggered), 0);
    assert!(f.incidents().await.is_empty());

    f.evaluator.evaluate_once(ts(1_061)).await;
    assert!(f.evaluator.is_firing());
    assert_eq!(f.alerts.count(ID, AlertKind::Triggered), 1);
    assert_eq!(f.state().await, CachedState::new(false, true, ts(1_000)));
    assert_eq!(
        f.incidents().await.items,
        vec![IncidentInterval {
            start: ts(1_061),
            end: None
        }]
    );

    // still unhealthy: the hook runs again but no second incident opens
    f.evaluator.evaluate_once(ts(1_071)).await;
    assert_eq!(f.alerts.count(ID, AlertKind::Triggered), 2);
    assert_eq!(f.incidents().await.len(), 1);
}

#[tokio::test]
async fn test_resolves_as_soon_as_healthy() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.calculate_initial_state().await.unwrap();
    f.evaluator.evaluate_once(ts(1_061)).await;
    assert!(f.evaluator.is_firing());

    let acker = Arc::new(CountingAcker::default());
    f.evaluator.process_message(message(status(true, 1_080), &acker)).await;
    assert_eq!(f.state().await, CachedState::new(true, true, ts(1_080)));

    f.evaluator.evaluate_once(ts(1_081)).await;
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.evaluator.phase(), ConditionPhase::HealthyNotFiring);
    assert_eq!(f.alerts.count(ID, AlertKind::Resolved), 1);
    assert!(!f.state().await.firing);
    assert_eq!(
        f.incidents().await.items,
        vec![IncidentInterval {
            start: ts(1_061),
            end: Some(ts(1_081))
        }]
    );

    // nothing left to resolve
    f.evaluator.evaluate_once(ts(1_091)).await;
    assert_eq!(f.alerts.count(ID, AlertKind::Resolved), 1);
}

#[tokio::test]
async fn test_resolve_waits_for_debounce() {
    let f = Fixture::new(secs(60), secs(30));
    f.evaluator.calculate_initial_state().await.unwrap();
    f.evaluator.evaluate_once(ts(1_061)).await;

    f.evaluator
        .update_state(&CachedState::new(true, true, ts(1_100)))
        .await
        .unwrap();
    f.evaluator.evaluate_once(ts(1_110)).await;
    assert!(f.evaluator.is_firing());
    assert_eq!(f.alerts.count(ID, AlertKind::Resolved), 0);

    f.evaluator.evaluate_once(ts(1_131)).await;
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.alerts.count(ID, AlertKind::Resolved), 1);
}

#[tokio::test]
async fn test_fresh_unhealthy_report_closes_incident_before_refiring() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.calculate_initial_state().await.unwrap();
    f.evaluator.evaluate_once(ts(1_061)).await;

    // agent flapped: a new disconnect with a fresh timestamp
    f.evaluator
        .update_state(&CachedState::new(false, true, ts(1_100)))
        .await
        .unwrap();
    f.evaluator.evaluate_once(ts(1_105)).await;
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.alerts.count(ID, AlertKind::Resolved), 1);

    f.evaluator.evaluate_once(ts(1_161)).await;
    assert!(f.evaluator.is_firing());

    let incidents = f.incidents().await;
    assert_eq!(incidents.len(), 2);
    assert_eq!(incidents.items[0].end, Some(ts(1_105)));
    assert_eq!(incidents.items[1].start, ts(1_161));
    assert!(incidents.items[1].is_open());
}

#[tokio::test]
async fn test_hook_failure_does_not_block_transitions() {
    let clients = Arc::new(KvClientSet::in_memory(secs(1)));
    let evaluator = build(
        clients.clone(),
        Arc::new(RejectingNotifier),
        Arc::new(ManualClock::new(ts(1_000))),
        Arc::new(InMemoryStream::new()),
        CancellationToken::new(),
        secs(60),
        Duration::ZERO,
    );
    evaluator.calculate_initial_state().await.unwrap();

    evaluator.evaluate_once(ts(1_061)).await;
    assert!(evaluator.is_firing());
    assert!(clients.states().get(ID).await.unwrap().firing);
    assert_eq!(clients.incidents().get(ID).await.unwrap().len(), 1);

    evaluator
        .update_state(&CachedState::new(true, true, ts(1_070)))
        .await
        .unwrap();
    evaluator.evaluate_once(ts(1_071)).await;
    assert!(!evaluator.is_firing());
    let incidents = clients.incidents().get(ID).await.unwrap();
    assert!(incidents.open_interval().is_none());
}

#[tokio::test]
async fn test_missing_state_skips_evaluation() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.evaluate_once(ts(5_000)).await;
    assert!(!f.evaluator.is_firing());
    assert_eq!(f.alerts.history_count(), 0);
}

#[tokio::test]
async fn test_update_state_suppresses_duplicate_writes() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    let state = CachedState::new(true, false, ts(2_000));

    assert!(f.evaluator.update_state(&state).await.unwrap());
    let writes = f.states.writes();
    assert!(!f.evaluator.update_state(&state).await.unwrap());

    // within tolerance
    let jittered = CachedState::new(true, false, ts(2_000) + chrono::Duration::milliseconds(400));
    assert!(!f.evaluator.update_state(&jittered).await.unwrap());
    assert_eq!(f.states.writes(), writes);

    assert!(f
        .evaluator
        .update_state(&CachedState::new(false, false, ts(2_000)))
        .await
        .unwrap());
    assert_eq!(f.states.writes(), writes + 1);
}

#[tokio::test]
async fn test_malformed_message_is_acked_and_ignored() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.calculate_initial_state().await.unwrap();
    f.evaluator.set_firing(true);
    let writes = f.states.writes();

    let acker = Arc::new(CountingAcker::default());
    f.evaluator
        .process_message(message(b"{not json".to_vec(), &acker))
        .await;

    assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    assert_eq!(f.states.writes(), writes);
    assert!(f.evaluator.is_firing());
}

#[tokio::test]
async fn test_message_records_current_firing_flag() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    f.evaluator.calculate_initial_state().await.unwrap();
    f.evaluator.set_firing(true);

    let acker = Arc::new(CountingAcker::default());
    f.evaluator.process_message(message(status(false, 1_200), &acker)).await;

    assert_eq!(acker.0.load(Ordering::SeqCst), 1);
    assert_eq!(f.state().await, CachedState::new(false, true, ts(1_200)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_firing_flag_under_concurrent_access() {
    let f = Fixture::new(secs(60), Duration::ZERO);
    let evaluator = f.evaluator.clone();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let evaluator = evaluator.clone();
            tokio::spawn(async move {
                for _ in 0..1_000 {
                    let _ = evaluator.is_firing();
                    tokio::task::yield_now().await;
                }
            })
        })
        .collect();

    let writer = {
        let evaluator = evaluator.clone();
        tokio::spawn(async move {
            for i in 0..1_000 {
                evaluator.set_firing(i % 2 == 0);
                tokio::task::yield_now().await;
            }
            evaluator.set_firing(true);
        })
    };

    for reader in readers {
        reader.await.unwrap();
    }
    writer.await.unwrap();
    assert!(evaluator.is_firing());
    assert!(evaluator.set_firing(false));
    assert!(!evaluator.is_firing());
}

#[tokio::test(start_paused = true)]
async fn test_loops_fire_and_resolve_from_stream() {
    let backbone = InMemoryStream::new();
    backbone
        .ensure_stream(&stream::ingress_stream(STREAM, PREFIX, 100))
        .await
        .unwrap();
    backbone
        .ensure_durable_consumer(STREAM, &stream::cluster_consumer(PREFIX, "c1"))
        .await
        .unwrap();

    let clock = TokioClock::starting_at(ts(1_000));
    let alerts = Arc::new(AlertLog::new());
    let clients = Arc::new(KvClientSet::in_memory(secs(1)));
    let parent = CancellationToken::new();
    let evaluator = build(
        clients.clone(),
        alerts.clone(),
        Arc::new(clock),
        Arc::new(backbone.clone()),
        parent.clone(),
        secs(60),
        Duration::ZERO,
    );

    backbone
        .publish("agent-health.status.c1", status(false, 1_000))
        .await
        .unwrap();
    let handle = evaluator.clone().start();

    tokio::time::sleep(secs(75)).await;
    assert!(evaluator.is_firing());
    assert_eq!(alerts.count(ID, AlertKind::Triggered), 1);
    assert_eq!(backbone.pending(STREAM, "agent-health-c1"), 0);

    let now = clock.now().timestamp();
    backbone
        .publish("agent-health.status.c1", status(true, now))
        .await
        .unwrap();
    tokio::time::sleep(secs(15)).await;
    assert!(!evaluator.is_firing());
    assert_eq!(alerts.count(ID, AlertKind::Resolved), 1);

    let incidents = clients.incidents().get(ID).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(incidents.open_interval().is_none());

    parent.cancel();
    handle.shutdown().await;
    assert_eq!(evaluator.phase(), ConditionPhase::Terminated);
    assert_eq!(backbone.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_subscriber_retries_until_consumer_exists() {
    let backbone = InMemoryStream::new();
    backbone
        .ensure_stream(&stream::ingress_stream(STREAM, PREFIX, 100))
        .await
        .unwrap();

    let evaluator = build(
        Arc::new(KvClientSet::in_memory(secs(1))),
        Arc::new(AlertLog::new()),
        Arc::new(TokioClock::starting_at(ts(1_000))),
        Arc::new(backbone.clone()),
        CancellationToken::new(),
        secs(600),
        Duration::ZERO,
    );
    let handle = evaluator.clone().start();

    tokio::time::sleep(secs(25)).await;
    assert_eq!(backbone.subscription_count(), 0);
    assert_ne!(evaluator.phase(), ConditionPhase::Terminated);

    // a second start must not disturb the running loops
    evaluator.clone().start();
    assert_ne!(evaluator.phase(), ConditionPhase::Terminated);

    backbone
        .ensure_durable_consumer(STREAM, &stream::cluster_consumer(PREFIX, "c1"))
        .await
        .unwrap();
    tokio::time::sleep(secs(10)).await;
    assert_eq!(backbone.subscription_count(), 1);

    handle.shutdown().await;
    assert_eq!(evaluator.phase(), ConditionPhase::Terminated);
    assert_eq!(backbone.subscription_count(), 0);
}
