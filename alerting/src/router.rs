//! Predicate-dispatched event hooks
//!
//! An [`EventRouter`] holds an ordered list of `(predicate, hooks)` pairs.
//! Dispatching an event runs, in registration order, the hooks of every pair
//! whose predicate matches. Hooks are best-effort: a failing hook is logged
//! and the remaining hooks still run.
//!
//! [`EventRouter::handle_event`] queues events onto a single dispatcher task,
//! so events are handled one at a time in the order they were handed in.

use crate::metrics;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A side effect run for a matched event.
#[async_trait]
pub trait EventHook<E>: Send + Sync {
    async fn execute(&self, ctx: CancellationToken, event: E) -> anyhow::Result<()>;
}

#[async_trait]
impl<E, F, Fut> EventHook<E> for F
where
    E: Send + 'static,
    F: Fn(CancellationToken, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn execute(&self, ctx: CancellationToken, event: E) -> anyhow::Result<()> {
        (self)(ctx, event).await
    }
}

pub type Predicate<E> = Box<dyn Fn(&E) -> bool + Send + Sync>;

pub type Hook<E> = Arc<dyn EventHook<E>>;

/// Wrap an async closure as a [`Hook`].
pub fn hook_fn<E, F, Fut>(f: F) -> Hook<E>
where
    E: Send + 'static,
    F: Fn(CancellationToken, E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(f)
}

struct Registration<E> {
    predicate: Predicate<E>,
    hooks: Vec<Hook<E>>,
}

/// Result of one hook run during a dispatch.
#[derive(Debug)]
pub struct HookOutcome {
    /// Index of the matched registration
    pub registration: usize,
    /// Index of the hook within its registration
    pub hook: usize,
    pub result: anyhow::Result<()>,
}

type Queued<E> = (E, oneshot::Sender<Vec<HookOutcome>>);

pub struct EventRouter<E> {
    parent: CancellationToken,
    cases: Vec<Registration<E>>,
    queue: mpsc::UnboundedSender<Queued<E>>,
    /// Receiving end, taken by the dispatcher on the first `handle_event`
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Queued<E>>>>,
}

impl<E> EventRouter<E>
where
    E: Clone + Send + Sync + std::fmt::Debug + 'static,
{
    /// Hooks receive `parent` as their execution scope.
    pub fn new(parent: CancellationToken) -> Self {
        let (queue, inbox) = mpsc::unbounded_channel();
        Self {
            parent,
            cases: Vec::new(),
            queue,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Append `hooks` to run, in order, for events matching `predicate`.
    pub fn register_event<P>(&mut self, predicate: P, hooks: Vec<Hook<E>>)
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.cases.push(Registration {
            predicate: Box::new(predicate),
            hooks,
        });
    }

    pub fn registrations(&self) -> usize {
        self.cases.len()
    }

    /// Run every matching hook in registration order and report each outcome.
    pub async fn dispatch(&self, event: E) -> Vec<HookOutcome> {
        let mut outcomes = Vec::new();
        if self.parent.is_cancelled() {
            tracing::debug!("Router shut down, dropping {:?}", event);
            return outcomes;
        }

        for (registration, case) in self.cases.iter().enumerate() {
            if !(case.predicate)(&event) {
                continue;
            }
            for (hook, action) in case.hooks.iter().enumerate() {
                let result = action.execute(self.parent.clone(), event.clone()).await;
                match &result {
                    Ok(()) => {
                        metrics::ROUTER_ACTIONS.with_label_values(&["ok"]).inc();
                    }
                    Err(e) => {
                        metrics::ROUTER_ACTIONS.with_label_values(&["error"]).inc();
                        tracing::warn!(
                            "Hook {}/{} failed for {:?}: {:#}",
                            registration,
                            hook,
                            event,
                            e
                        );
                    }
                }
                outcomes.push(HookOutcome {
                    registration,
                    hook,
                    result,
                });
            }
        }
        outcomes
    }

    /// Fire-and-forget dispatch on the background dispatcher.
    ///
    /// Events are dispatched in the order they are handed in, each one after
    /// the previous event's hooks have finished. The returned handle may be
    /// awaited for the outcomes or dropped.
    pub fn handle_event(self: &Arc<Self>, event: E) -> JoinHandle<Vec<HookOutcome>> {
        self.start_dispatcher();
        let (done, outcomes) = oneshot::channel();
        if let Err(mpsc::error::SendError((event, _))) = self.queue.send((event, done)) {
            tracing::warn!("Event dispatcher stopped, dropping {:?}", event);
        }
        tokio::spawn(async move { outcomes.await.unwrap_or_default() })
    }

    fn start_dispatcher(self: &Arc<Self>) {
        let inbox = self
            .inbox
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(mut inbox) = inbox else {
            return;
        };

        // holding only a weak reference lets the router drop, which closes the queue
        let router = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some((event, done)) = inbox.recv().await {
                let Some(router) = router.upgrade() else {
                    break;
                };
                let outcomes = router.dispatch(event).await;
                let _ = done.send(outcomes);
            }
            tracing::debug!("Event dispatcher exiting");
        });
    }
}
