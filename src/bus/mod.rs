//! Asynchronous publish/subscribe event bus.
//!
//! Each topic gets its own dispatcher task fed by an unbounded queue. A
//! dispatcher delivers one event at a time to every matching subscriber in
//! priority/insertion order, so a subscriber observes events of one topic in
//! publish order and never concurrently. Distinct topics deliver in parallel.
//!
//! Handler failures and panics are isolated: they are logged and re-published
//! on [`topics::HANDLER_ERROR`] without affecting the publisher or the other
//! subscribers of the same event.

mod event;
mod subscription;

pub use event::{topics, Event};
pub use subscription::{
    handler_fn, EventHandler, FnHandler, HandlerError, SubscriptionHandle, SubscriptionOptions,
    TopicPattern,
};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use subscription::Subscriber;

use crate::telemetry;

#[derive(Error, Debug, Clone)]
pub enum BusError {
    #[error("Invalid topic pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Event bus is shut down")]
    Closed,

    #[error("Timed out after {0:?} waiting for event")]
    Timeout(Duration),
}

struct Envelope {
    event: Arc<Event>,
    ack: Option<oneshot::Sender<()>>,
}

struct BusInner {
    /// Sorted by priority (desc) then insertion sequence (asc).
    subscribers: RwLock<Vec<Arc<Subscriber>>>,
    dispatchers: DashMap<String, mpsc::UnboundedSender<Envelope>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

/// Process-wide event bus. Cheap to clone; all clones share subscribers.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(BusInner {
                subscribers: RwLock::new(Vec::new()),
                dispatchers: DashMap::new(),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                cancel: CancellationToken::new(),
            }),
        }
    }

    /// Subscribe a handler to a topic or glob pattern.
    pub fn subscribe(
        &self,
        pattern: &str,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        self.subscribe_with(pattern, SubscriptionOptions::default(), handler)
    }

    pub fn subscribe_with(
        &self,
        pattern: &str,
        options: SubscriptionOptions,
        handler: Arc<dyn EventHandler>,
    ) -> Result<SubscriptionHandle, BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        let pattern = TopicPattern::parse(pattern)?;
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let subscriber = Arc::new(Subscriber::new(id, pattern, options, handler));

        let mut subs = self.inner.subscribers.write();
        let pos = subs
            .iter()
            .position(|s| s.options.priority < options.priority)
            .unwrap_or(subs.len());
        subs.insert(pos, subscriber);

        tracing::debug!(subscription_id = id, priority = options.priority, "Subscribed");
        Ok(SubscriptionHandle(id))
    }

    /// Remove a subscription. Safe to call from inside the handler itself.
    ///
    /// An event already being delivered still reaches the removed handler.
    ///
    /// Returns false if the handle was already removed.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> bool {
        self.inner.remove(handle.0)
    }

    /// Publish without waiting for delivery.
    pub fn publish(&self, topic: &str, payload: Value) -> Uuid {
        self.publish_event(Event::new(topic, payload))
    }

    /// Publish a pre-built event (e.g. one carrying a correlation id).
    pub fn publish_event(&self, event: Event) -> Uuid {
        let id = event.id;
        self.route(Envelope { event: Arc::new(event), ack: None });
        id
    }

    /// Publish and wait until every matching subscriber has run.
    ///
    /// Must not be called from a handler of the same topic: the dispatcher
    /// would wait on itself.
    pub async fn publish_and_wait(&self, event: Event) -> Result<(), BusError> {
        let (tx, rx) = oneshot::channel();
        if !self.route(Envelope { event: Arc::new(event), ack: Some(tx) }) {
            return Err(BusError::Closed);
        }
        rx.await.map_err(|_| BusError::Closed)
    }

    /// Wait for the next event matching `pattern` that satisfies `predicate`.
    pub async fn wait_for<P>(
        &self,
        pattern: &str,
        predicate: P,
        timeout: Duration,
    ) -> Result<Arc<Event>, BusError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let waiter = self.waiter(pattern, predicate)?;
        waiter.wait(timeout).await
    }

    /// Register interest in an event now and await it later.
    ///
    /// Subscribing before publishing the triggering request avoids missing a
    /// fast response.
    pub fn waiter<P>(&self, pattern: &str, predicate: P) -> Result<EventWaiter, BusError>
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        let (tx, rx) = oneshot::channel::<Arc<Event>>();
        let slot = Arc::new(Mutex::new(Some(tx)));
        let predicate = Arc::new(predicate);
        let handle = self.subscribe(
            pattern,
            handler_fn(move |event: Arc<Event>| {
                let slot = slot.clone();
                let predicate = predicate.clone();
                async move {
                    if (predicate.as_ref())(&*event) {
                        if let Some(tx) = slot.lock().take() {
                            let _ = tx.send(event);
                        }
                    }
                    Ok(())
                }
            }),
        )?;
        Ok(EventWaiter { bus: self.clone(), handle, rx })
    }

    /// Stop all dispatchers. Undelivered events are dropped.
    pub fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.cancel.cancel();
        self.inner.dispatchers.clear();
        let dropped = {
            let mut subs = self.inner.subscribers.write();
            let n = subs.len();
            subs.clear();
            n
        };
        tracing::info!(subscriptions = dropped, "Event bus shut down");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Number of topics with a live dispatcher.
    pub fn topic_count(&self) -> usize {
        self.inner.dispatchers.len()
    }

    fn route(&self, envelope: Envelope) -> bool {
        if self.is_closed() {
            tracing::debug!(topic = %envelope.event.topic, "Dropping event on closed bus");
            return false;
        }
        telemetry::record_event_published(&envelope.event.topic);

        let topic = envelope.event.topic.clone();
        let envelope = match self.inner.dispatchers.get(&topic) {
            Some(tx) => match tx.send(envelope) {
                Ok(()) => return true,
                Err(mpsc::error::SendError(env)) => env,
            },
            None => envelope,
        };

        // First event on this topic, or its dispatcher exited: start a new one.
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::error!(topic = %topic, "No async runtime; event dropped");
            return false;
        };
        let sender = self
            .inner
            .dispatchers
            .entry(topic.clone())
            .and_modify(|tx| {
                if tx.is_closed() {
                    *tx = spawn_dispatcher(&runtime, Arc::downgrade(&self.inner), topic.clone());
                }
            })
            .or_insert_with(|| spawn_dispatcher(&runtime, Arc::downgrade(&self.inner), topic.clone()))
            .clone();
        sender.send(envelope).is_ok()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl BusInner {
    fn remove(&self, id: u64) -> bool {
        let mut subs = self.subscribers.write();
        match subs.iter().position(|s| s.id == id) {
            Some(pos) => {
                subs.remove(pos);
                true
            }
            None => false,
        }
    }

    fn snapshot(&self, topic: &str) -> Vec<Arc<Subscriber>> {
        self.subscribers
            .read()
            .iter()
            .filter(|s| s.pattern.matches(topic))
            .cloned()
            .collect()
    }
}

fn spawn_dispatcher(
    runtime: &tokio::runtime::Handle,
    inner: Weak<BusInner>,
    topic: String,
) -> mpsc::UnboundedSender<Envelope> {
    let (tx, rx) = mpsc::unbounded_channel();
    let cancel = match inner.upgrade() {
        Some(inner) => inner.cancel.clone(),
        None => CancellationToken::new(),
    };
    runtime.spawn(run_dispatcher(inner, topic, rx, cancel));
    tx
}

async fn run_dispatcher(
    inner: Weak<BusInner>,
    topic: String,
    mut rx: mpsc::UnboundedReceiver<Envelope>,
    cancel: CancellationToken,
) {
    tracing::trace!(topic = %topic, "Dispatcher started");
    loop {
        let envelope = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = rx.recv() => match next {
                Some(envelope) => envelope,
                None => break,
            },
        };
        let Some(inner) = inner.upgrade() else { break };
        deliver(&inner, envelope).await;
    }
    tracing::trace!(topic = %topic, "Dispatcher stopped");
}

async fn deliver(inner: &Arc<BusInner>, envelope: Envelope) {
    let Envelope { event, ack } = envelope;

    // Every subscriber in the snapshot receives this event, even if an
    // earlier handler unsubscribed it; removal applies from the next event.
    for sub in inner.snapshot(&event.topic) {
        // A `once` subscription is consumed by whichever delivery removes it.
        if sub.options.once && !inner.remove(sub.id) {
            continue;
        }

        let outcome = AssertUnwindSafe(sub.handler.handle(event.clone()))
            .catch_unwind()
            .await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(panic) => Some(HandlerError::Panicked(panic_message(panic.as_ref()))),
        };
        if let Some(error) = failure {
            report_failure(inner, &event, sub.id, &error);
        }
    }

    if let Some(ack) = ack {
        let _ = ack.send(());
    }
}

fn report_failure(inner: &Arc<BusInner>, event: &Event, subscription_id: u64, error: &HandlerError) {
    telemetry::record_handler_failure(&event.topic);
    tracing::warn!(
        topic = %event.topic,
        event_id = %event.id,
        subscription_id,
        error = %error,
        "Event handler failed"
    );

    if event.topic == topics::HANDLER_ERROR {
        return;
    }
    let bus = EventBus { inner: inner.clone() };
    let mut report = Event::new(
        topics::HANDLER_ERROR,
        json!({
            "topic": event.topic,
            "event_id": event.id.to_string(),
            "subscription_id": subscription_id,
            "error": error.to_string(),
        }),
    );
    report.correlation_id = event.correlation_id;
    bus.publish_event(report);
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Pending one-shot subscription created by [`EventBus::waiter`].
///
/// Dropping the waiter removes its subscription.
pub struct EventWaiter {
    bus: EventBus,
    handle: SubscriptionHandle,
    rx: oneshot::Receiver<Arc<Event>>,
}

impl EventWaiter {
    pub async fn wait(mut self, timeout: Duration) -> Result<Arc<Event>, BusError> {
        let rx = &mut self.rx;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(event)) => Ok(event),
            Ok(Err(_)) => Err(BusError::Closed),
            Err(_) => Err(BusError::Timeout(timeout)),
        }
    }
}

impl Drop for EventWaiter {
    fn drop(&mut self) {
        self.bus.unsubscribe(self.handle);
    }
}
