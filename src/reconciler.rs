//! Pod Controller
//!
//! Watches opted-in pods and drives each one through the scaling lifecycle:
//! parse and validate the per-pod configuration, classify the observed
//! state, then hand off to the action engine. The controller work queue
//! serializes reconciliations per pod key, so no pod is ever handled by two
//! workers at once.

use crate::annotations;
use crate::engine::ActionEngine;
use crate::error::{Error, Result};
use crate::events::{EventPublisher, REASON_VALIDATION};
use crate::metrics;
use crate::patcher::Patcher;
use crate::pods;
use crate::podstate;
use crate::scale::ScalingConfigs;
use crate::settings::Settings;
use crate::status::{annotation_mutation, StatusAnnotation, StatusScale};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::events::EventType;
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Context for the pod controller
pub struct PodController {
    client: Client,
    engine: ActionEngine,
    patcher: Arc<dyn Patcher>,
    events: Arc<dyn EventPublisher>,
    settings: Settings,
}

impl PodController {
    pub fn new(
        client: Client,
        patcher: Arc<dyn Patcher>,
        events: Arc<dyn EventPublisher>,
        settings: Settings,
    ) -> Self {
        let engine = ActionEngine::new(patcher.clone(), events.clone(), settings.clone());
        Self {
            client,
            engine,
            patcher,
            events,
            settings,
        }
    }

    /// Run the pod controller until shutdown.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let pods: Api<Pod> = if self.settings.namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), &self.settings.namespace)
        };
        let config = Config::default().labels(&format!("{}=true", annotations::ENABLED_LABEL));

        info!("Starting pod controller");

        Controller::new(pods, config)
            .shutdown_on_signal()
            .run(
                |pod, ctx| async move { ctx.reconcile(pod).await },
                |pod, error, _ctx| {
                    error!(pod = %pod.name_any(), "Reconciliation error: {}", error);
                    Action::requeue(ERROR_REQUEUE)
                },
                Arc::clone(&self),
            )
            .for_each(|result| async move {
                match result {
                    Ok((obj, _action)) => {
                        debug!("Reconciled pod: {}", obj.name);
                    }
                    Err(e) => {
                        error!("Reconciliation failed: {}", e);
                    }
                }
            })
            .await;

        Ok(())
    }

    async fn reconcile(&self, pod: Arc<Pod>) -> std::result::Result<Action, Error> {
        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        debug!("Reconciling pod {}/{}", namespace, name);

        if pod.metadata.deletion_timestamp.is_some() {
            return Ok(Action::await_change());
        }

        // The watch is label-filtered, but the label value itself must still
        // parse as a boolean.
        match annotations::is_enabled(&pod) {
            Ok(true) => {}
            Ok(false) => return Ok(Action::await_change()),
            Err(e) => return self.fail_validation(&pod, None, e).await,
        }

        let mut configs = ScalingConfigs::new(&self.settings);
        if let Err(e) = configs
            .store_all(&pod)
            .and_then(|_| configs.validate_collection())
        {
            return self.fail_validation(&pod, Some(&configs), e).await;
        }

        let container_name = match configs.target_container_name(&pod) {
            Ok(name) => name,
            Err(e) => return self.fail_validation(&pod, Some(&configs), e).await,
        };
        let container = match pods::get_container(&pod, &container_name) {
            Ok(container) => container.clone(),
            Err(e) => return self.fail_validation(&pod, Some(&configs), e).await,
        };
        if let Err(e) = configs.validate_all(&container) {
            return self.fail_validation(&pod, Some(&configs), e).await;
        }

        let state = match podstate::classify(&pod, &container, &configs) {
            Ok(state) => state,
            Err(e) => return self.fail_controller(&pod, e).await,
        };
        if let Err(e) = self.engine.run(&pod, &container, &configs, &state).await {
            return self.fail_controller(&pod, e).await;
        }

        Ok(Action::await_change())
    }

    /// Configuration and validation failures are terminal for the pod until
    /// the user edits its annotations: record, emit, stop.
    async fn fail_validation(
        &self,
        pod: &Pod,
        configs: Option<&ScalingConfigs>,
        err: Error,
    ) -> std::result::Result<Action, Error> {
        metrics::RECONCILE_FAILURE_TOTAL
            .with_label_values(&[err.failure_kind()])
            .inc();

        let detail = match &err {
            Error::Configuration(m)
            | Error::Validation(m)
            | Error::ContainerNotPresent(m) => m.clone(),
            other => other.to_string(),
        };
        let message = format!("Validation error: {}", detail);
        info!(pod = %pod.name_any(), "{}", message);

        let mut scale = StatusAnnotation::read(pod)
            .map(|s| s.scale)
            .unwrap_or_default();
        scale.enabled_for_resources = configs
            .map(|c| {
                c.enabled()
                    .into_iter()
                    .map(|r| r.resource_name().to_string())
                    .collect()
            })
            .unwrap_or_default();

        let transition = StatusAnnotation::read(pod)
            .map(|s| s.status != message)
            .unwrap_or(true);
        let mutation = annotation_mutation(StatusAnnotation::new(message.clone(), scale));
        self.patcher.patch(pod, &[mutation], false, None).await?;

        if transition {
            self.events
                .publish(pod, EventType::Warning, REASON_VALIDATION, &message)
                .await;
        }
        Ok(Action::await_change())
    }

    /// Non-validation failures: record best-effort and let the error policy
    /// requeue with backoff.
    async fn fail_controller(
        &self,
        pod: &Pod,
        err: Error,
    ) -> std::result::Result<Action, Error> {
        metrics::RECONCILE_FAILURE_TOTAL
            .with_label_values(&[err.failure_kind()])
            .inc();

        let message = format!("Controller error: {}", err);
        let scale = StatusAnnotation::read(pod)
            .map(|s| s.scale)
            .unwrap_or_else(StatusScale::default);
        let mutation = annotation_mutation(StatusAnnotation::new(message, scale));
        if let Err(write_err) = self.patcher.patch(pod, &[mutation], false, None).await {
            debug!(
                pod = %pod.name_any(),
                "failed to record controller error: {}",
                write_err
            );
        }
        Err(err)
    }
}
