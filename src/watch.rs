//! Pod watch stream feeding the in-process event publisher.
//!
//! Runs alongside the controller so the patcher's cache-coherence waits can
//! observe the same pod updates the controller reconciles on.

use crate::annotations;
use crate::error::Result;
use crate::podevents::{PodEvent, PodEventPublisher, PodEventType};
use crate::settings::Settings;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use std::sync::Arc;
use tracing::{info, warn};

/// Watches opted-in pods and fans their lifecycle events out to
/// subscribers. Watch errors are logged; the watcher restarts itself.
pub async fn run(
    client: Client,
    settings: &Settings,
    publisher: Arc<PodEventPublisher>,
) -> Result<()> {
    let pods: Api<Pod> = if settings.namespace.is_empty() {
        Api::all(client)
    } else {
        Api::namespaced(client, &settings.namespace)
    };
    let config =
        watcher::Config::default().labels(&format!("{}=true", annotations::ENABLED_LABEL));

    info!("Starting pod watch");

    let mut stream = watcher(pods, config).boxed();
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(pod_event) = map_event(event) {
                    publisher.publish(pod_event);
                }
            }
            Err(e) => warn!("Pod watch error: {}", e),
        }
    }
    Ok(())
}

fn map_event(event: watcher::Event<Pod>) -> Option<PodEvent> {
    let (event_type, pod) = match event {
        watcher::Event::InitApply(pod) => (PodEventType::Create, pod),
        watcher::Event::Apply(pod) => (PodEventType::Update, pod),
        watcher::Event::Delete(pod) => (PodEventType::Delete, pod),
        watcher::Event::Init | watcher::Event::InitDone => return None,
    };
    Some(PodEvent {
        event_type,
        pod: Arc::new(pod),
    })
}
