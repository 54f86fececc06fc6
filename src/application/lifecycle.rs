use tokio::sync::broadcast;

use crate::domain::models::LifecycleSignal;

/// Broadcasts app lifecycle signals to every subscribed engine.
#[derive(Debug, Clone)]
pub struct LifecycleNotifier {
    tx: broadcast::Sender<LifecycleSignal>,
}

impl LifecycleNotifier {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Send a signal. Returns how many subscribers received it.
    pub fn notify(&self, signal: LifecycleSignal) -> usize {
        tracing::info!(signal = signal.as_str(), "Lifecycle signal");
        self.tx.send(signal).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleSignal> {
        self.tx.subscribe()
    }
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new(32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_signal_reaches_every_subscriber() {
        let notifier = LifecycleNotifier::default();
        assert_eq!(notifier.notify(LifecycleSignal::MemoryPressure), 0);

        let mut first = notifier.subscribe();
        let mut second = notifier.subscribe();
        assert_eq!(notifier.notify(LifecycleSignal::DidEnterBackground), 2);
        assert_eq!(first.recv().await.unwrap(), LifecycleSignal::DidEnterBackground);
        assert_eq!(second.recv().await.unwrap(), LifecycleSignal::DidEnterBackground);
    }
}
