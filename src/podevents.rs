//! In-process pod-event pub/sub.
//!
//! The watch task publishes every pod create/update/delete here; the pod
//! patcher subscribes while waiting for the informer cache to reflect a
//! patch. Sends are non-blocking: a subscriber with a full buffer misses the
//! event and re-arms on its own timeout, which keeps the watch task from
//! ever stalling.

use k8s_openapi::api::core::v1::Pod;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

const SUBSCRIBER_BUFFER: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodEventType {
    Create,
    Update,
    Delete,
}

#[derive(Clone)]
pub struct PodEvent {
    pub event_type: PodEventType,
    pub pod: Arc<Pod>,
}

/// Opaque handle for unsubscribing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

struct Subscription {
    id: SubscriptionId,
    namespace: String,
    name: String,
    event_types: Vec<PodEventType>,
    tx: mpsc::Sender<PodEvent>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    subscriptions: Vec<Subscription>,
}

/// Fan-out publisher of pod events keyed by (namespace, name).
#[derive(Default)]
pub struct PodEventPublisher {
    inner: Mutex<Inner>,
}

impl PodEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter and returns a buffered receiver for matching events.
    pub fn subscribe(
        &self,
        namespace: &str,
        name: &str,
        event_types: &[PodEventType],
    ) -> (SubscriptionId, mpsc::Receiver<PodEvent>) {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);
        let mut inner = self.inner.lock().expect("publisher lock poisoned");
        inner.next_id += 1;
        let id = SubscriptionId(inner.next_id);
        inner.subscriptions.push(Subscription {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            event_types: event_types.to_vec(),
            tx,
        });
        (id, rx)
    }

    /// Removes a subscription and closes its channel. Idempotent.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut inner = self.inner.lock().expect("publisher lock poisoned");
        // Dropping the sender closes the subscriber's channel.
        inner.subscriptions.retain(|s| s.id != id);
    }

    /// Fans an event out to every matching subscriber without blocking.
    pub fn publish(&self, event: PodEvent) {
        let namespace = event
            .pod
            .metadata
            .namespace
            .as_deref()
            .unwrap_or_default()
            .to_string();
        let name = event
            .pod
            .metadata
            .name
            .as_deref()
            .unwrap_or_default()
            .to_string();

        // Snapshot the matching senders under the lock; send outside it.
        let targets: Vec<mpsc::Sender<PodEvent>> = {
            let inner = self.inner.lock().expect("publisher lock poisoned");
            inner
                .subscriptions
                .iter()
                .filter(|s| {
                    s.namespace == namespace
                        && s.name == name
                        && s.event_types.contains(&event.event_type)
                })
                .map(|s| s.tx.clone())
                .collect()
        };

        for tx in targets {
            if tx.try_send(event.clone()).is_err() {
                // Buffer full or receiver gone; the subscriber re-arms on timeout.
                debug!(
                    namespace = %namespace,
                    name = %name,
                    "dropped pod event for slow subscriber"
                );
            }
        }
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().unwrap().subscriptions.len()
    }
}
