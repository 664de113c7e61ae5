//! Set of connected observers and best-effort fan-out to them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nod_common::BrokerEvent;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, warn};

pub type ObserverId = u64;

/// Serialized event, shared by every observer queue it is pushed into.
pub type Payload = Arc<str>;

pub const DEFAULT_OBSERVER_BUFFER: usize = 64;

struct RegistryInner {
    next_id: AtomicU64,
    buffer: usize,
    channels: Mutex<HashMap<ObserverId, mpsc::Sender<Payload>>>,
}

/// Observers receive events through a bounded queue each. A full queue drops
/// the event for that observer only; a closed queue removes the observer.
/// Nothing is retained for observers that join later.
#[derive(Clone)]
pub struct ObserverRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for ObserverRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_OBSERVER_BUFFER)
    }
}

impl ObserverRegistry {
    pub fn new(buffer: usize) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                next_id: AtomicU64::new(1),
                buffer: buffer.max(1),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub async fn register(&self) -> (ObserverId, mpsc::Receiver<Payload>) {
        let (sender, receiver) = mpsc::channel(self.inner.buffer);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let mut channels = self.inner.channels.lock().await;
        channels.insert(id, sender);
        debug!(observer_id = id, observers = channels.len(), "Observer registered");
        (id, receiver)
    }

    pub async fn unregister(&self, id: ObserverId) -> bool {
        let mut channels = self.inner.channels.lock().await;
        let removed = channels.remove(&id).is_some();
        if removed {
            debug!(observer_id = id, observers = channels.len(), "Observer removed");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.inner.channels.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Serializes `event` once and queues it for every registered observer.
    /// Returns how many observers accepted it.
    pub async fn broadcast(&self, event: &BrokerEvent) -> usize {
        match serde_json::to_string(event) {
            Ok(text) => self.broadcast_payload(Payload::from(text)).await,
            Err(err) => {
                error!("Failed to serialize observer event: {}", err);
                0
            }
        }
    }

    pub async fn broadcast_payload(&self, payload: Payload) -> usize {
        let mut channels = self.inner.channels.lock().await;
        let mut delivered = 0;
        let mut closed = Vec::new();

        for (id, sender) in channels.iter() {
            match sender.try_send(Arc::clone(&payload)) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(observer_id = *id, "Observer queue full; event dropped for it");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }

        for id in closed {
            channels.remove(&id);
            debug!(observer_id = id, "Dropped observer with closed channel");
        }

        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credits(total: f64, delta: f64) -> BrokerEvent {
        BrokerEvent::Credits { total, delta }
    }

    #[tokio::test]
    async fn every_registered_observer_gets_identical_payload() {
        let registry = ObserverRegistry::default();
        let (_, mut a) = registry.register().await;
        let (_, mut b) = registry.register().await;

        assert_eq!(registry.broadcast(&credits(1.2, 1.2)).await, 2);

        let from_a = a.recv().await.unwrap();
        let from_b = b.recv().await.unwrap();
        assert_eq!(from_a, from_b);
        assert!(Arc::ptr_eq(&from_a, &from_b));
        assert_eq!(&*from_a, r#"{"type":"credits","total":1.2,"delta":1.2}"#);
    }

    #[tokio::test]
    async fn late_observers_miss_earlier_events() {
        let registry = ObserverRegistry::default();
        let (_, mut early) = registry.register().await;
        registry.broadcast(&credits(1.0, 1.0)).await;

        let (_, mut late) = registry.register().await;
        registry.broadcast(&credits(3.0, 2.0)).await;

        assert!(early.recv().await.unwrap().contains("\"total\":1.0"));
        assert!(early.recv().await.unwrap().contains("\"total\":3.0"));
        assert!(late.recv().await.unwrap().contains("\"total\":3.0"));
        assert!(late.try_recv().is_err());
    }

    #[tokio::test]
    async fn closed_observers_are_dropped() {
        let registry = ObserverRegistry::default();
        let (_, alive) = registry.register().await;
        let (_, gone) = registry.register().await;
        drop(gone);

        assert_eq!(registry.broadcast(&credits(1.0, 1.0)).await, 1);
        assert_eq!(registry.len().await, 1);
        drop(alive);
    }

    #[tokio::test]
    async fn full_queue_skips_only_that_observer() {
        let registry = ObserverRegistry::new(1);
        let (_, mut slow) = registry.register().await;
        let (_, mut fast) = registry.register().await;

        assert_eq!(registry.broadcast(&credits(1.0, 1.0)).await, 2);
        fast.recv().await.unwrap();

        // slow has not drained its single slot
        assert_eq!(registry.broadcast(&credits(2.0, 1.0)).await, 1);
        assert_eq!(registry.len().await, 2);
        assert!(fast.recv().await.unwrap().contains("\"total\":2.0"));
        assert!(slow.recv().await.unwrap().contains("\"total\":1.0"));
        assert!(slow.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_stops_delivery() {
        let registry = ObserverRegistry::default();
        let (id, mut receiver) = registry.register().await;
        assert!(registry.unregister(id).await);
        assert!(!registry.unregister(id).await);
        assert_eq!(registry.broadcast(&credits(1.0, 1.0)).await, 0);
        assert!(receiver.recv().await.is_none());
        assert!(registry.is_empty().await);
    }
}
