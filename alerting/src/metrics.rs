//! Prometheus metrics for the alerting service

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Encoder, Gauge,
    TextEncoder,
};

// ── Evaluator metrics ────────────────────────────────────────────────────────

pub static EVALUATORS_RUNNING: Lazy<Gauge> = Lazy::new(|| {
    register_gauge!(
        "vigil_condition_evaluators",
        "Condition evaluators currently registered"
    )
    .unwrap()
});

pub static MESSAGES_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_health_messages_total",
        "Health messages consumed by evaluators",
        &["status"]
    )
    .unwrap()
});

pub static SUBSCRIBE_RETRIES: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_subscribe_retries_total",
        "Failed subscription attempts retried on the next tick"
    )
    .unwrap()
});

pub static STATE_WRITES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_state_writes_total",
        "Cached state write attempts",
        &["status"]
    )
    .unwrap()
});

// ── Alert metrics ────────────────────────────────────────────────────────────

pub static ALERTS_TRIGGERED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_alerts_triggered_total",
        "Firing transitions (false to true)"
    )
    .unwrap()
});

pub static ALERTS_RESOLVED: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "vigil_alerts_resolved_total",
        "Resolve transitions (true to false)"
    )
    .unwrap()
});

pub static HOOK_FAILURES: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_alert_hook_failures_total",
        "Trigger/resolve hook invocations that returned an error",
        &["hook"]
    )
    .unwrap()
});

// ── Router metrics ───────────────────────────────────────────────────────────

pub static ROUTER_ACTIONS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "vigil_router_actions_total",
        "Lifecycle router actions executed",
        &["status"]
    )
    .unwrap()
});

/// Render all registered metrics to Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
