//! In-process publish/subscribe for flag lifecycle events.
//!
//! The bus only wakes consumers up. Flag state lives in the store; an event
//! that reaches nobody is simply dropped.
//!
//! Publishing enqueues onto an unbounded channel and never blocks. A single
//! dispatcher task drains that channel in FIFO order and hands each event to
//! every subscriber whose topic set contains the event's topic. Each
//! subscriber owns a delivery queue and task, so a slow handler only delays
//! its own subscriber while per-subscriber ordering is preserved.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{BusError, Result};

/// Default capacity of the `watch()` broadcast tap.
pub const DEFAULT_WATCH_CAPACITY: usize = 256;

/// A single published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusEvent {
    pub topic: String,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub published_at: DateTime<Utc>,
}

impl BusEvent {
    /// The `flag_id` carried in the payload, if it parses.
    pub fn flag_id(&self) -> Option<Uuid> {
        self.payload
            .get("flag_id")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }
}

/// Callback invoked for each event on a subscribed topic.
///
/// Errors and panics are caught and logged by the bus; they never reach the
/// publisher or other subscribers.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &BusEvent) -> Result<()>;
}

/// Adapter turning an async closure into an [`EventHandler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(BusEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send,
{
    async fn handle(&self, event: &BusEvent) -> Result<()> {
        (self.0)(event.clone()).await
    }
}

/// Wrap an async closure as a shareable handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(BusEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct Subscription {
    topics: HashSet<String>,
    tx: mpsc::UnboundedSender<BusEvent>,
}

type SubscriberMap = Arc<RwLock<HashMap<String, Subscription>>>;

/// Topic-based event bus.
pub struct EventBus {
    queue: mpsc::UnboundedSender<BusEvent>,
    subscribers: SubscriberMap,
    watch_tx: broadcast::Sender<BusEvent>,
    shutdown: CancellationToken,
}

impl EventBus {
    /// Create the bus and spawn its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(watch_capacity: usize) -> Arc<Self> {
        let (queue, rx) = mpsc::unbounded_channel();
        let (watch_tx, _) = broadcast::channel(watch_capacity.max(1));
        let subscribers: SubscriberMap = Arc::new(RwLock::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        tokio::spawn(run_dispatcher(
            rx,
            subscribers.clone(),
            watch_tx.clone(),
            shutdown.clone(),
        ));

        Arc::new(Self {
            queue,
            subscribers,
            watch_tx,
            shutdown,
        })
    }

    /// Register `handler` for `topics` under `subscriber_id`.
    ///
    /// One subscription per id: subscribing again replaces the previous
    /// topic set and handler. Events already queued for the old handler are
    /// still delivered to it.
    pub async fn subscribe<I, T>(
        &self,
        subscriber_id: impl Into<String>,
        topics: I,
        handler: Arc<dyn EventHandler>,
    ) -> std::result::Result<(), BusError>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let subscriber_id = subscriber_id.into();
        let topics: HashSet<String> = topics.into_iter().map(Into::into).collect();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(run_delivery(
            subscriber_id.clone(),
            rx,
            handler,
            self.shutdown.clone(),
        ));

        debug!(
            subscriber = %subscriber_id,
            topics = ?topics,
            "Subscriber registered"
        );

        let replaced = self
            .subscribers
            .write()
            .await
            .insert(subscriber_id.clone(), Subscription { topics, tx })
            .is_some();

        if replaced {
            debug!(subscriber = %subscriber_id, "Replaced existing subscription");
        }
        Ok(())
    }

    /// Remove a subscription. Returns `false` if the id was unknown.
    pub async fn unsubscribe(&self, subscriber_id: &str) -> bool {
        let removed = self.subscribers.write().await.remove(subscriber_id).is_some();
        if removed {
            debug!(subscriber = %subscriber_id, "Subscriber removed");
        }
        removed
    }

    /// Enqueue an event. Never blocks and never waits for handlers.
    pub fn publish(
        &self,
        topic: impl Into<String>,
        payload: serde_json::Value,
        session_id: Option<&str>,
    ) -> std::result::Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::Closed);
        }

        let event = BusEvent {
            topic: topic.into(),
            payload,
            session_id: session_id.map(str::to_string),
            published_at: Utc::now(),
        };

        self.queue.send(event).map_err(|_| BusError::Closed)
    }

    /// Receive a copy of every dispatched event, regardless of topic.
    pub fn watch(&self) -> broadcast::Receiver<BusEvent> {
        self.watch_tx.subscribe()
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Stop the dispatcher and every delivery task. Queued events are dropped.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        self.subscribers.write().await.clear();
        info!("Event bus shut down");
    }
}

async fn run_dispatcher(
    mut rx: mpsc::UnboundedReceiver<BusEvent>,
    subscribers: SubscriberMap,
    watch_tx: broadcast::Sender<BusEvent>,
    shutdown: CancellationToken,
) {
    debug!("Event bus dispatcher started");

    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        // Ok if nobody is watching
        let _ = watch_tx.send(event.clone());

        let subscribers = subscribers.read().await;
        let mut delivered = 0usize;
        for (id, sub) in subscribers.iter() {
            if !sub.topics.contains(&event.topic) {
                continue;
            }
            if sub.tx.send(event.clone()).is_err() {
                debug!(subscriber = %id, topic = %event.topic, "Delivery task gone, skipping");
                continue;
            }
            delivered += 1;
        }

        if delivered == 0 {
            debug!(topic = %event.topic, "No subscribers for event");
        }
    }

    debug!("Event bus dispatcher stopped");
}

async fn run_delivery(
    subscriber_id: String,
    mut rx: mpsc::UnboundedReceiver<BusEvent>,
    handler: Arc<dyn EventHandler>,
    shutdown: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = shutdown.cancelled() => break,
            next = rx.recv() => match next {
                Some(event) => event,
                None => break,
            },
        };

        let outcome = AssertUnwindSafe(handler.handle(&event))
            .catch_unwind()
            .await;

        let failure = match outcome {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e.to_string(),
            Err(panic) => panic_message(panic.as_ref()),
        };

        let err = BusError::CallbackFailed {
            subscriber: subscriber_id.clone(),
            topic: event.topic.clone(),
            reason: failure,
        };
        warn!(error = %err, "Event handler failed");
    }

    debug!(subscriber = %subscriber_id, "Delivery task stopped");
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}
