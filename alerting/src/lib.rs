//! Alerting service library
//!
//! Evaluates per-condition health against policy windows and provisions the
//! evaluators and durable stream consumers for each monitored cluster.

pub mod alerts;
pub mod clock;
pub mod condition;
pub mod config;
pub mod error;
pub mod ingest;
pub mod metrics;
pub mod provisioner;
pub mod router;
pub mod server;
pub mod storage;
pub mod stream;
