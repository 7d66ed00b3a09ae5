//! Durable message stream contract
//!
//! Health telemetry arrives on a shared ingress stream. Each cluster gets one
//! named durable consumer whose filter covers that cluster's subjects; the
//! consumer remembers which messages were acknowledged so that a subscriber
//! binding to it again (e.g. after a restart) is redelivered everything it
//! had not acknowledged yet.

pub mod memory;

use crate::error::StreamError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use memory::InMemoryStream;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamConfig {
    pub name: String,

    /// Subject filters captured by this stream
    pub subjects: Vec<String>,

    /// Retained messages before the oldest are discarded
    pub max_messages: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliverPolicy {
    /// Replay everything retained that was not yet acknowledged
    All,
    /// Only messages published after the subscription was opened
    New,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerConfig {
    pub durable_name: String,
    pub filter_subject: String,
    pub deliver_policy: DeliverPolicy,
}

/// Receives acknowledgements for delivered messages.
pub trait AckHandler: Send + Sync {
    fn ack(&self, sequence: u64);
}

/// A message delivered to a subscriber.
#[derive(Clone)]
pub struct StreamMessage {
    pub subject: String,
    pub sequence: u64,
    pub data: Vec<u8>,
    acker: Option<Arc<dyn AckHandler>>,
}

impl StreamMessage {
    pub fn new(
        subject: impl Into<String>,
        sequence: u64,
        data: Vec<u8>,
        acker: Option<Arc<dyn AckHandler>>,
    ) -> Self {
        Self {
            subject: subject.into(),
            sequence,
            data,
            acker,
        }
    }

    /// Acknowledge the message so its consumer does not redeliver it.
    pub fn ack(&self) {
        if let Some(acker) = &self.acker {
            acker.ack(self.sequence);
        }
    }
}

impl fmt::Debug for StreamMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMessage")
            .field("subject", &self.subject)
            .field("sequence", &self.sequence)
            .field("len", &self.data.len())
            .finish()
    }
}

/// An active channel-backed subscription. Dropping it unsubscribes.
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(unsubscribe) = self.unsubscribe.take() {
            unsubscribe();
        }
    }
}

#[async_trait]
pub trait StreamBackbone: Send + Sync {
    /// Create the stream, or update it in place if it already exists.
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), StreamError>;

    /// Create a durable consumer on `stream`. Idempotent for an identical config.
    async fn ensure_durable_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<(), StreamError>;

    /// Publish onto whichever stream captures `subject`, returning its sequence.
    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<u64, StreamError>;

    /// Bind to `consumer` and push its messages on `subject` into `sink`.
    async fn subscribe(
        &self,
        subject: &str,
        consumer: &ConsumerConfig,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<Subscription, StreamError>;
}

/// Durable consumer name for a cluster. Deterministic so re-provisioning is idempotent.
pub fn cluster_consumer_name(cluster_id: &str) -> String {
    format!("agent-health-{}", cluster_id)
}

/// Durable consumer config covering every health subject of a cluster.
pub fn cluster_consumer(subject_prefix: &str, cluster_id: &str) -> ConsumerConfig {
    ConsumerConfig {
        durable_name: cluster_consumer_name(cluster_id),
        filter_subject: format!("{}.*.{}", subject_prefix, cluster_id),
        deliver_policy: DeliverPolicy::All,
    }
}

/// Ingress stream capturing `<prefix>.>`.
pub fn ingress_stream(name: &str, subject_prefix: &str, max_messages: usize) -> StreamConfig {
    StreamConfig {
        name: name.to_string(),
        subjects: vec![format!("{}.>", subject_prefix)],
        max_messages,
    }
}

/// Subject carrying one kind of health message for one cluster.
pub fn health_subject(subject_prefix: &str, kind: &str, cluster_id: &str) -> String {
    format!("{}.{}.{}", subject_prefix, kind, cluster_id)
}
