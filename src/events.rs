//! Kubernetes event emission.
//!
//! The engine talks to a trait so tests can capture events without a
//! cluster. Publishing is best-effort: a failed event write is logged and
//! never fails a reconcile.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource, ResourceExt};
use tracing::warn;

pub const REASON_SCALING: &str = "Scaling";
pub const REASON_VALIDATION: &str = "Validation";

const CONTROLLER_NAME: &str = "startup-scaler";

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str);
}

/// Publishes events through the Kubernetes events API.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: CONTROLLER_NAME.to_string(),
            instance: std::env::var("HOSTNAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(&self, pod: &Pod, event_type: EventType, reason: &str, message: &str) {
        let event = Event {
            type_: event_type,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: reason.to_string(),
            secondary: None,
        };
        let reference = pod.object_ref(&());
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(
                pod = %pod.name_any(),
                reason = reason,
                "failed to publish event: {}",
                e
            );
        }
    }
}

/// Discards all events. Used in tests and dry runs.
#[derive(Default)]
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(&self, _pod: &Pod, _event_type: EventType, _reason: &str, _message: &str) {}
}
