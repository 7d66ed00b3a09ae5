//! In-process durable stream
//!
//! Streams retain up to `max_messages` messages. Durable consumers track
//! acknowledged sequences; binding a subscription replays every retained,
//! unacknowledged message on its subject before live delivery continues.
//! Each subscription is fed by its own delivery task so publishers never
//! block on a slow subscriber.

use super::{
    AckHandler, ConsumerConfig, DeliverPolicy, StreamBackbone, StreamConfig, StreamMessage,
    Subscription,
};
use crate::error::StreamError;
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::mpsc;
use vigil_shared::utils::subject::{is_valid_subject, subject_matches};

#[derive(Debug)]
struct StoredMessage {
    sequence: u64,
    subject: String,
    data: Vec<u8>,
}

#[derive(Debug)]
struct ConsumerState {
    config: ConsumerConfig,
    acked: Mutex<BTreeSet<u64>>,
}

impl ConsumerState {
    fn is_acked(&self, sequence: u64) -> bool {
        self.acked
            .lock()
            .map(|acked| acked.contains(&sequence))
            .unwrap_or(false)
    }
}

impl AckHandler for ConsumerState {
    fn ack(&self, sequence: u64) {
        if let Ok(mut acked) = self.acked.lock() {
            acked.insert(sequence);
        }
    }
}

struct ActiveSubscription {
    subject: String,
    consumer: Arc<ConsumerState>,
    queue: mpsc::UnboundedSender<StreamMessage>,
}

struct StreamState {
    config: StreamConfig,
    messages: VecDeque<StoredMessage>,
    last_sequence: u64,
    consumers: HashMap<String, Arc<ConsumerState>>,
    subscriptions: HashMap<u64, ActiveSubscription>,
}

impl StreamState {
    fn captures(&self, subject: &str) -> bool {
        self.config
            .subjects
            .iter()
            .any(|pattern| subject_matches(pattern, subject))
    }

    /// Drop messages beyond the retention cap, forgetting their acks.
    fn enforce_retention(&mut self) {
        while self.messages.len() > self.config.max_messages {
            if let Some(evicted) = self.messages.pop_front() {
                for consumer in self.consumers.values() {
                    if let Ok(mut acked) = consumer.acked.lock() {
                        acked.remove(&evicted.sequence);
                    }
                }
            }
        }
    }
}

#[derive(Default)]
struct Inner {
    streams: HashMap<String, StreamState>,
    next_subscription: u64,
}

/// Process-local [`StreamBackbone`]. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct InMemoryStream {
    inner: Arc<Mutex<Inner>>,
    available: Arc<AtomicBool>,
}

impl Default for InMemoryStream {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStream {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Simulate the backbone going away (or coming back). While unavailable
    /// every operation fails with [`StreamError::Unavailable`].
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<(), StreamError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StreamError::Unavailable("stream backbone offline".to_string()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Inner>, StreamError> {
        self.inner
            .lock()
            .map_err(|e| StreamError::Unavailable(e.to_string()))
    }

    /// Durable consumer names on `stream`, sorted.
    pub fn consumer_names(&self, stream: &str) -> Vec<String> {
        let Ok(inner) = self.inner.lock() else {
            return Vec::new();
        };
        let mut names: Vec<String> = inner
            .streams
            .get(stream)
            .map(|s| s.consumers.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Retained messages matching `durable`'s filter that it has not acknowledged.
    pub fn pending(&self, stream: &str, durable: &str) -> usize {
        let Ok(inner) = self.inner.lock() else {
            return 0;
        };
        let Some(state) = inner.streams.get(stream) else {
            return 0;
        };
        let Some(consumer) = state.consumers.get(durable) else {
            return 0;
        };
        state
            .messages
            .iter()
            .filter(|m| subject_matches(&consumer.config.filter_subject, &m.subject))
            .filter(|m| !consumer.is_acked(m.sequence))
            .count()
    }

    /// Number of live subscriptions across all streams.
    pub fn subscription_count(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.streams.values().map(|s| s.subscriptions.len()).sum())
            .unwrap_or(0)
    }
}

fn unsubscribe(inner: Weak<Mutex<Inner>>, stream: String, id: u64) {
    if let Some(inner) = inner.upgrade() {
        if let Ok(mut inner) = inner.lock() {
            if let Some(state) = inner.streams.get_mut(&stream) {
                state.subscriptions.remove(&id);
            }
        }
    }
}

#[async_trait]
impl StreamBackbone for InMemoryStream {
    async fn ensure_stream(&self, config: &StreamConfig) -> Result<(), StreamError> {
        self.check_available()?;
        if let Some(bad) = config.subjects.iter().find(|s| !is_valid_subject(s)) {
            return Err(StreamError::InvalidSubject(bad.clone()));
        }

        let mut inner = self.lock()?;
        match inner.streams.get_mut(&config.name) {
            Some(existing) => {
                existing.config = config.clone();
                existing.enforce_retention();
            }
            None => {
                inner.streams.insert(
                    config.name.clone(),
                    StreamState {
                        config: config.clone(),
                        messages: VecDeque::new(),
                        last_sequence: 0,
                        consumers: HashMap::new(),
                        subscriptions: HashMap::new(),
                    },
                );
                tracing::info!("Created stream {} for {:?}", config.name, config.subjects);
            }
        }
        Ok(())
    }

    async fn ensure_durable_consumer(
        &self,
        stream: &str,
        config: &ConsumerConfig,
    ) -> Result<(), StreamError> {
        self.check_available()?;
        if !is_valid_subject(&config.filter_subject) {
            return Err(StreamError::InvalidSubject(config.filter_subject.clone()));
        }

        let mut inner = self.lock()?;
        let state = inner
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::StreamNotFound(stream.to_string()))?;

        match state.consumers.get(&config.durable_name) {
            Some(existing) if existing.config == *config => Ok(()),
            Some(_) => Err(StreamError::ConsumerConflict(config.durable_name.clone())),
            None => {
                state.consumers.insert(
                    config.durable_name.clone(),
                    Arc::new(ConsumerState {
                        config: config.clone(),
                        acked: Mutex::new(BTreeSet::new()),
                    }),
                );
                Ok(())
            }
        }
    }

    async fn publish(&self, subject: &str, data: Vec<u8>) -> Result<u64, StreamError> {
        self.check_available()?;
        if !is_valid_subject(subject) || subject.contains(['*', '>']) {
            return Err(StreamError::InvalidSubject(subject.to_string()));
        }

        let mut inner = self.lock()?;
        let state = inner
            .streams
            .values_mut()
            .find(|s| s.captures(subject))
            .ok_or_else(|| StreamError::NoStreamForSubject(subject.to_string()))?;

        state.last_sequence += 1;
        let sequence = state.last_sequence;

        for sub in state.subscriptions.values() {
            if sub.subject == subject
                && subject_matches(&sub.consumer.config.filter_subject, subject)
            {
                let acker: Arc<dyn AckHandler> = sub.consumer.clone();
                // A closed queue means the delivery task is gone; the message
                // stays unacknowledged and is replayed on the next bind.
                let _ = sub.queue.send(StreamMessage::new(
                    subject,
                    sequence,
                    data.clone(),
                    Some(acker),
                ));
            }
        }

        state.messages.push_back(StoredMessage {
            sequence,
            subject: subject.to_string(),
            data,
        });
        state.enforce_retention();
        Ok(sequence)
    }

    async fn subscribe(
        &self,
        subject: &str,
        consumer: &ConsumerConfig,
        sink: mpsc::Sender<StreamMessage>,
    ) -> Result<Subscription, StreamError> {
        self.check_available()?;

        let mut inner = self.lock()?;
        let id = inner.next_subscription;
        inner.next_subscription += 1;

        let (stream_name, state) = inner
            .streams
            .iter_mut()
            .find(|(_, s)| s.consumers.contains_key(&consumer.durable_name))
            .ok_or_else(|| StreamError::ConsumerNotFound(consumer.durable_name.clone()))?;
        let stream_name = stream_name.clone();

        let durable = state
            .consumers
            .get(&consumer.durable_name)
            .cloned()
            .ok_or_else(|| StreamError::ConsumerNotFound(consumer.durable_name.clone()))?;
        if !subject_matches(&durable.config.filter_subject, subject) {
            return Err(StreamError::InvalidSubject(format!(
                "{} is outside consumer filter {}",
                subject, durable.config.filter_subject
            )));
        }

        let (queue, mut rx) = mpsc::unbounded_channel::<StreamMessage>();
        if durable.config.deliver_policy == DeliverPolicy::All {
            for msg in state
                .messages
                .iter()
                .filter(|m| m.subject == subject && !durable.is_acked(m.sequence))
            {
                let acker: Arc<dyn AckHandler> = durable.clone();
                let _ = queue.send(StreamMessage::new(
                    msg.subject.clone(),
                    msg.sequence,
                    msg.data.clone(),
                    Some(acker),
                ));
            }
        }

        state.subscriptions.insert(
            id,
            ActiveSubscription {
                subject: subject.to_string(),
                consumer: durable,
                queue,
            },
        );
        drop(inner);

        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let weak = Arc::downgrade(&self.inner);
        Ok(Subscription::new(move || unsubscribe(weak, stream_name, id)))
    }
}
