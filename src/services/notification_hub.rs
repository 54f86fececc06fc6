//! Notification hub for observer callbacks.
//!
//! Every engine publishes [`CallNotification`]s here. A single dispatcher
//! task drains the queue in order and delivers each notification to the
//! registered observers and to broadcast subscribers, so no consumer ever
//! receives two callbacks concurrently.
//!
//! Observers are held as `Weak` references: registering never extends an
//! observer's lifetime, `remove_observer` drops it explicitly, and entries
//! whose owner is gone are pruned on the next dispatch.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::JoinHandle;

use crate::domain::ports::{CallNotification, CallStateObserver};

/// Handle identifying one registered observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObserverId(u64);

impl std::fmt::Display for ObserverId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "observer-{}", self.0)
    }
}

type ObserverMap = HashMap<ObserverId, Weak<dyn CallStateObserver>>;

/// Configuration for the notification hub.
#[derive(Debug, Clone)]
pub struct NotificationHubConfig {
    /// Capacity of the broadcast channel for stream subscribers.
    pub channel_capacity: usize,
}

impl Default for NotificationHubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Single-context delivery of engine notifications.
pub struct NotificationHub {
    queue: mpsc::UnboundedSender<CallNotification>,
    stream: broadcast::Sender<CallNotification>,
    observers: Arc<RwLock<ObserverMap>>,
    next_observer: AtomicU64,
    published: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl NotificationHub {
    /// Create the hub and spawn its dispatcher task.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: NotificationHubConfig) -> Arc<Self> {
        let (queue, mut rx) = mpsc::unbounded_channel::<CallNotification>();
        let (stream, _) = broadcast::channel(config.channel_capacity);
        let observers: Arc<RwLock<ObserverMap>> = Arc::new(RwLock::new(HashMap::new()));

        let dispatch_observers = Arc::clone(&observers);
        let dispatch_stream = stream.clone();
        let dispatcher = tokio::spawn(async move {
            while let Some(notification) = rx.recv().await {
                let live = {
                    let mut map = dispatch_observers.write().await;
                    map.retain(|_, weak| weak.strong_count() > 0);
                    map.values().filter_map(Weak::upgrade).collect::<Vec<_>>()
                };

                for observer in &live {
                    notification.deliver_to(observer.as_ref());
                }

                tracing::trace!(
                    kind = notification.kind(),
                    observers = live.len(),
                    "notification dispatched"
                );

                // No subscribers is fine
                let _ = dispatch_stream.send(notification);
            }
            tracing::debug!("notification dispatcher stopped");
        });

        Arc::new(Self {
            queue,
            stream,
            observers,
            next_observer: AtomicU64::new(1),
            published: AtomicU64::new(0),
            dispatcher,
        })
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Arc<Self> {
        Self::start(NotificationHubConfig::default())
    }

    /// Queue a notification for delivery.
    pub fn publish(&self, notification: CallNotification) {
        self.published.fetch_add(1, Ordering::SeqCst);
        if self.queue.send(notification).is_err() {
            tracing::warn!("notification dispatcher is gone, dropping notification");
        }
    }

    /// Register an observer without taking ownership of it.
    pub async fn add_observer<O>(&self, observer: &Arc<O>) -> ObserverId
    where
        O: CallStateObserver + 'static,
    {
        let id = ObserverId(self.next_observer.fetch_add(1, Ordering::SeqCst));
        let strong: Arc<dyn CallStateObserver> = observer.clone();
        let weak: Weak<dyn CallStateObserver> = Arc::downgrade(&strong);
        self.observers.write().await.insert(id, weak);
        tracing::debug!(observer = %id, "observer registered");
        id
    }

    /// Unregister an observer. Removing an unknown id is a no-op.
    pub async fn remove_observer(&self, id: ObserverId) -> bool {
        let removed = self.observers.write().await.remove(&id).is_some();
        if removed {
            tracing::debug!(observer = %id, "observer removed");
        }
        removed
    }

    /// Number of registered observers that are still alive.
    pub async fn observer_count(&self) -> usize {
        self.observers
            .read()
            .await
            .values()
            .filter(|weak| weak.strong_count() > 0)
            .count()
    }

    /// Subscribe to the notification stream.
    pub fn subscribe(&self) -> broadcast::Receiver<CallNotification> {
        self.stream.subscribe()
    }

    /// Total notifications published so far.
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Drop for NotificationHub {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}
