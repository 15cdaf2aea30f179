//! The reconciliation action engine.
//!
//! Receives a pod, its target container, the parsed scaling configuration
//! and the classified state, and selects exactly one action from an ordered
//! decision table. Resource changes go through the resize subresource with
//! wait predicates; every status write patches the pod itself with no
//! predicate. Events are emitted only when the status message changes, so
//! repeated reconciliations of a settled pod are quiet.

use crate::error::Result;
use crate::events::{EventPublisher, REASON_SCALING, REASON_VALIDATION};
use crate::metrics;
use crate::patcher::Patcher;
use crate::podstate::{AppliedResources, PodState, QosClass, ResizeState, StatusResources};
use crate::scale::update::mutations_for;
use crate::scale::{ScaleDirection, ScalingConfigs};
use crate::settings::Settings;
use crate::status::{annotation_mutation, now_rfc3339, StatusAnnotation, StatusScale};
use k8s_openapi::api::core::v1::{Container, Pod};
use kube::runtime::events::EventType;
use std::sync::Arc;
use tracing::info;

const MESSAGE_QOS_NOT_GUARANTEED: &str = "Validation error: pod QoS class must be Guaranteed";
const MESSAGE_WAITING_STATUS_RESOURCES: &str = "Waiting for container status resources";
const MESSAGE_UNKNOWN_RESOURCES: &str = "Unknown resources applied";
const UNKNOWN_OVERRIDE_SUFFIX: &str = " (unknown resources applied)";

pub struct ActionEngine {
    patcher: Arc<dyn Patcher>,
    events: Arc<dyn EventPublisher>,
    settings: Settings,
}

impl ActionEngine {
    pub fn new(
        patcher: Arc<dyn Patcher>,
        events: Arc<dyn EventPublisher>,
        settings: Settings,
    ) -> Self {
        Self {
            patcher,
            events,
            settings,
        }
    }

    /// Selects and performs exactly one action for the pod.
    pub async fn run(
        &self,
        pod: &Pod,
        container: &Container,
        configs: &ScalingConfigs,
        state: &PodState,
    ) -> Result<()> {
        let scale = carried_scale(pod, configs);
        let direction = if state.started.unwrap_or(false) && state.ready.unwrap_or(false) {
            ScaleDirection::PostStartup
        } else {
            ScaleDirection::Startup
        };

        if matches!(state.qos, QosClass::Burstable | QosClass::BestEffort) {
            return self
                .write_status(
                    pod,
                    "validation_failed",
                    MESSAGE_QOS_NOT_GUARANTEED,
                    scale,
                    Some((EventType::Warning, REASON_VALIDATION)),
                )
                .await;
        }

        match &state.resize {
            ResizeState::Infeasible(message) => {
                let mut scale = scale;
                let message =
                    format!("{} scale failed - infeasible ({})", direction.title(), message);
                if !is_current_status(pod, &message) {
                    scale.last_failed = now_rfc3339();
                }
                return self
                    .write_status(
                        pod,
                        "scale_infeasible",
                        &message,
                        scale,
                        Some((EventType::Warning, REASON_SCALING)),
                    )
                    .await;
            }
            ResizeState::Error(message) => {
                let mut scale = scale;
                let message = format!("{} scale failed - error ({})", direction.title(), message);
                if !is_current_status(pod, &message) {
                    scale.last_failed = now_rfc3339();
                }
                return self
                    .write_status(
                        pod,
                        "scale_error",
                        &message,
                        scale,
                        Some((EventType::Warning, REASON_SCALING)),
                    )
                    .await;
            }
            ResizeState::Deferred(message) => {
                // Deferred is transient: re-evaluated on the next pod event,
                // and it does not mark the scale as failed.
                return self
                    .write_status(
                        pod,
                        "scale_deferred",
                        &format!("{} scale deferred ({})", direction.title(), message),
                        scale,
                        None,
                    )
                    .await;
            }
            _ => {}
        }

        if matches!(
            state.status_resources,
            StatusResources::NotPresent | StatusResources::Zero
        ) {
            return self
                .write_status(
                    pod,
                    "waiting_status_resources",
                    MESSAGE_WAITING_STATUS_RESOURCES,
                    scale,
                    None,
                )
                .await;
        }

        let unknown_override = state.resources == AppliedResources::Unknown;
        if unknown_override && !self.settings.scale_when_unknown_resources {
            return self
                .write_status(pod, "unknown_resources", MESSAGE_UNKNOWN_RESOURCES, scale, None)
                .await;
        }

        let applied = match direction {
            ScaleDirection::Startup => AppliedResources::Startup,
            ScaleDirection::PostStartup => AppliedResources::PostStartup,
        };
        if state.resources != applied {
            self.command(pod, container, configs, direction, scale, unknown_override)
                .await
        } else if state.status_resources == StatusResources::PresentMatching {
            let mut scale = scale;
            let message = format!("{} resources enacted", direction.title());
            if !is_current_status(pod, &message) {
                scale.last_enacted = now_rfc3339();
            }
            self.write_status(
                pod,
                match direction {
                    ScaleDirection::Startup => "startup_enacted",
                    ScaleDirection::PostStartup => "post_startup_enacted",
                },
                &message,
                scale,
                Some((EventType::Normal, REASON_SCALING)),
            )
            .await
        } else {
            self.write_status(
                pod,
                match direction {
                    ScaleDirection::Startup => "startup_wait",
                    ScaleDirection::PostStartup => "post_startup_wait",
                },
                &format!(
                    "Waiting for {} resources enactment",
                    direction.title().to_lowercase()
                ),
                scale,
                None,
            )
            .await
        }
    }

    /// Commands the triplet for `direction` through the resize subresource,
    /// then records the command in the status annotation.
    async fn command(
        &self,
        pod: &Pod,
        container: &Container,
        configs: &ScalingConfigs,
        direction: ScaleDirection,
        mut scale: StatusScale,
        unknown_override: bool,
    ) -> Result<()> {
        let mutations = mutations_for(configs, direction, &container.name);
        let observed = self
            .patcher
            .patch(pod, &mutations, true, Some(self.settings.cache_sync_timeout))
            .await?;

        scale.last_commanded = now_rfc3339();
        let mut message = format!("{} resources commanded", direction.title());
        if unknown_override {
            message.push_str(UNKNOWN_OVERRIDE_SUFFIX);
        }
        info!(
            pod = %pod.metadata.name.as_deref().unwrap_or_default(),
            direction = %direction,
            "commanded resize"
        );
        self.write_status(
            &observed,
            match direction {
                ScaleDirection::Startup => "startup_commanded",
                ScaleDirection::PostStartup => "post_startup_commanded",
            },
            &message,
            scale,
            Some((EventType::Normal, REASON_SCALING)),
        )
        .await
    }

    /// Patches the status annotation onto the pod and emits the paired event
    /// when the message actually changed.
    async fn write_status(
        &self,
        pod: &Pod,
        action: &str,
        message: &str,
        scale: StatusScale,
        event: Option<(EventType, &str)>,
    ) -> Result<()> {
        metrics::ENGINE_ACTION_TOTAL.with_label_values(&[action]).inc();

        let transition = !is_current_status(pod, message);
        let mutation = annotation_mutation(StatusAnnotation::new(message, scale));
        self.patcher.patch(pod, &[mutation], false, None).await?;

        if transition {
            if let Some((event_type, reason)) = event {
                self.events.publish(pod, event_type, reason, message).await;
            }
        }
        Ok(())
    }
}

/// The scale bookkeeping to carry forward, refreshed with the currently
/// enabled resource names.
fn carried_scale(pod: &Pod, configs: &ScalingConfigs) -> StatusScale {
    let mut scale = StatusAnnotation::read(pod)
        .map(|s| s.scale)
        .unwrap_or_default();
    scale.enabled_for_resources = configs
        .enabled()
        .into_iter()
        .map(|r| r.resource_name().to_string())
        .collect();
    scale
}

fn is_current_status(pod: &Pod, message: &str) -> bool {
    StatusAnnotation::read(pod)
        .map(|s| s.status == message)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::EventPublisher;
    use crate::pods;
    use crate::podstate;
    use crate::scale::update::PodMutation;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Applies mutations in-memory and records every call.
    #[derive(Default)]
    struct StubPatcher {
        calls: Mutex<Vec<PatchCall>>,
    }

    struct PatchCall {
        use_resize_subresource: bool,
        patched: bool,
        pod_after: Pod,
    }

    #[async_trait]
    impl Patcher for StubPatcher {
        async fn patch(
            &self,
            pod: &Pod,
            mutations: &[PodMutation],
            use_resize_subresource: bool,
            _wait_timeout: Option<Duration>,
        ) -> Result<Pod> {
            let mut mutated = pod.clone();
            let mut should_patch = false;
            for mutation in mutations {
                should_patch |= mutation(&mut mutated)?.should_patch;
            }
            self.calls.lock().unwrap().push(PatchCall {
                use_resize_subresource,
                patched: should_patch,
                pod_after: mutated.clone(),
            });
            Ok(mutated)
        }
    }

    impl StubPatcher {
        fn resize_calls(&self) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|c| c.use_resize_subresource)
                .count()
        }

        fn last_pod(&self) -> Pod {
            self.calls.lock().unwrap().last().unwrap().pod_after.clone()
        }

        fn last_status(&self) -> StatusAnnotation {
            StatusAnnotation::read(&self.last_pod()).unwrap()
        }

        fn any_status_patched(&self) -> bool {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .any(|c| !c.use_resize_subresource && c.patched)
        }
    }

    #[derive(Default)]
    struct CapturingEvents {
        events: Mutex<Vec<(String, String, String)>>,
    }

    #[async_trait]
    impl EventPublisher for CapturingEvents {
        async fn publish(&self, _pod: &Pod, event_type: EventType, reason: &str, message: &str) {
            self.events.lock().unwrap().push((
                format!("{:?}", event_type),
                reason.to_string(),
                message.to_string(),
            ));
        }
    }

    struct Harness {
        patcher: Arc<StubPatcher>,
        events: Arc<CapturingEvents>,
        engine: ActionEngine,
    }

    fn harness(settings: Settings) -> Harness {
        let patcher = Arc::new(StubPatcher::default());
        let events = Arc::new(CapturingEvents::default());
        let engine = ActionEngine::new(patcher.clone(), events.clone(), settings);
        Harness {
            patcher,
            events,
            engine,
        }
    }

    fn pod_fixture(
        spec_cpu: &str,
        current_cpu: &str,
        started: bool,
        ready: bool,
        qos: &str,
        conditions: &str,
    ) -> Pod {
        let json = format!(
            r#"{{
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {{
                    "name": "test",
                    "namespace": "default",
                    "labels": {{"startup-scaler.io/enabled": "true"}},
                    "annotations": {{
                        "startup-scaler.io/target-container-name": "app",
                        "startup-scaler.io/cpu-startup": "200m",
                        "startup-scaler.io/cpu-post-startup-requests": "50m",
                        "startup-scaler.io/cpu-post-startup-limits": "50m"
                    }}
                }},
                "spec": {{
                    "containers": [{{
                        "name": "app",
                        "startupProbe": {{"httpGet": {{"path": "/health", "port": 8080}}}},
                        "resizePolicy": [{{"resourceName": "cpu", "restartPolicy": "NotRequired"}}],
                        "resources": {{
                            "requests": {{"cpu": "{spec}"}},
                            "limits": {{"cpu": "{spec}"}}
                        }}
                    }}]
                }},
                "status": {{
                    "qosClass": "{qos}",
                    "conditions": {conditions},
                    "containerStatuses": [{{
                        "name": "app",
                        "image": "app:1",
                        "imageID": "",
                        "ready": {ready},
                        "started": {started},
                        "restartCount": 0,
                        "resources": {{
                            "requests": {{"cpu": "{cur}"}},
                            "limits": {{"cpu": "{cur}"}}
                        }}
                    }}]
                }}
            }}"#,
            spec = spec_cpu,
            cur = current_cpu,
            started = started,
            ready = ready,
            qos = qos,
            conditions = conditions,
        );
        serde_json::from_str(&json).unwrap()
    }

    async fn run(h: &Harness, pod: &Pod) {
        let mut configs = ScalingConfigs::new(&h.engine.settings);
        configs.store_all(pod).unwrap();
        let container = pods::get_container(pod, "app").unwrap().clone();
        configs.validate_all(&container).unwrap();
        let state = podstate::classify(pod, &container, &configs).unwrap();
        h.engine.run(pod, &container, &configs, &state).await.unwrap();
    }

    #[tokio::test]
    async fn test_startup_commanded_while_starting() {
        let h = harness(Settings::default());
        // Post-startup resources in spec, container not yet started.
        let pod = pod_fixture("50m", "50m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 1);
        let status = h.patcher.last_status();
        assert_eq!(status.status, "Startup resources commanded");
        assert!(!status.scale.last_commanded.is_empty());
        assert!(status.scale.last_enacted.is_empty());
        assert_eq!(status.scale.enabled_for_resources, vec!["cpu".to_string()]);

        let events = h.events.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "Normal");
        assert_eq!(events[0].1, "Scaling");
        assert_eq!(events[0].2, "Startup resources commanded");
    }

    #[tokio::test]
    async fn test_startup_enacted_after_resize_completes() {
        let h = harness(Settings::default());
        let pod = pod_fixture("200m", "200m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 0);
        let status = h.patcher.last_status();
        assert_eq!(status.status, "Startup resources enacted");
        assert!(!status.scale.last_enacted.is_empty());
        assert_eq!(h.events.events.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_waiting_for_startup_enactment() {
        let h = harness(Settings::default());
        // Spec already at startup, status still at the old value.
        let pod = pod_fixture("200m", "50m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 0);
        assert_eq!(
            h.patcher.last_status().status,
            "Waiting for startup resources enactment"
        );
        assert!(h.events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_post_startup_commanded_once_ready() {
        let h = harness(Settings::default());
        let pod = pod_fixture("200m", "200m", true, true, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 1);
        assert_eq!(
            h.patcher.last_status().status,
            "Post-startup resources commanded"
        );
    }

    #[tokio::test]
    async fn test_post_startup_enacted() {
        let h = harness(Settings::default());
        let pod = pod_fixture("50m", "50m", true, true, "Guaranteed", "[]");
        run(&h, &pod).await;

        let status = h.patcher.last_status();
        assert_eq!(status.status, "Post-startup resources enacted");
        assert!(!status.scale.last_enacted.is_empty());
    }

    #[tokio::test]
    async fn test_qos_validation_failure() {
        let h = harness(Settings::default());
        let pod = pod_fixture("50m", "50m", false, false, "Burstable", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 0);
        assert_eq!(
            h.patcher.last_status().status,
            "Validation error: pod QoS class must be Guaranteed"
        );
        let events = h.events.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "Warning");
        assert_eq!(events[0].1, "Validation");
    }

    #[tokio::test]
    async fn test_infeasible_resize_marks_failed() {
        let h = harness(Settings::default());
        let pod = pod_fixture(
            "200m",
            "50m",
            false,
            false,
            "Guaranteed",
            r#"[{"type": "PodResizePending", "status": "True",
                 "reason": "Infeasible", "message": "exceeds node capacity"}]"#,
        );
        run(&h, &pod).await;

        let status = h.patcher.last_status();
        assert_eq!(
            status.status,
            "Startup scale failed - infeasible (exceeds node capacity)"
        );
        assert!(!status.scale.last_failed.is_empty());
        assert!(status.scale.last_enacted.is_empty());
        let events = h.events.events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "Warning");
        assert_eq!(events[0].1, "Scaling");
    }

    #[tokio::test]
    async fn test_deferred_resize_leaves_failed_clear() {
        let h = harness(Settings::default());
        let pod = pod_fixture(
            "200m",
            "50m",
            false,
            false,
            "Guaranteed",
            r#"[{"type": "PodResizePending", "status": "True",
                 "reason": "Deferred", "message": "node busy"}]"#,
        );
        run(&h, &pod).await;

        let status = h.patcher.last_status();
        assert_eq!(status.status, "Startup scale deferred (node busy)");
        assert!(status.scale.last_failed.is_empty());
        assert!(h.events.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resize_error_during_post_startup() {
        let h = harness(Settings::default());
        let pod = pod_fixture(
            "50m",
            "200m",
            true,
            true,
            "Guaranteed",
            r#"[{"type": "PodResizeInProgress", "status": "False",
                 "reason": "Error", "message": "cgroup write failed"}]"#,
        );
        run(&h, &pod).await;

        let status = h.patcher.last_status();
        assert_eq!(
            status.status,
            "Post-startup scale failed - error (cgroup write failed)"
        );
        assert!(!status.scale.last_failed.is_empty());
    }

    #[tokio::test]
    async fn test_waiting_for_status_resources() {
        let h = harness(Settings::default());
        let mut pod = pod_fixture("200m", "200m", false, false, "Guaranteed", "[]");
        pod.status
            .as_mut()
            .unwrap()
            .container_statuses
            .as_mut()
            .unwrap()[0]
            .resources = None;
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 0);
        assert_eq!(
            h.patcher.last_status().status,
            "Waiting for container status resources"
        );
    }

    #[tokio::test]
    async fn test_unknown_resources_without_flag() {
        let h = harness(Settings::default());
        let pod = pod_fixture("175m", "175m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 0);
        assert_eq!(h.patcher.last_status().status, "Unknown resources applied");
    }

    #[tokio::test]
    async fn test_unknown_resources_with_flag_commands_startup() {
        let settings = Settings {
            scale_when_unknown_resources: true,
            ..Settings::default()
        };
        let h = harness(settings);
        let pod = pod_fixture("175m", "175m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;

        assert_eq!(h.patcher.resize_calls(), 1);
        assert_eq!(
            h.patcher.last_status().status,
            "Startup resources commanded (unknown resources applied)"
        );
    }

    #[tokio::test]
    async fn test_no_event_when_status_unchanged() {
        let h = harness(Settings::default());
        let pod = pod_fixture("200m", "200m", false, false, "Guaranteed", "[]");
        run(&h, &pod).await;
        assert_eq!(h.events.events.lock().unwrap().len(), 1);

        // Second reconcile observes the pod already carrying the status.
        let settled = h.patcher.last_pod();
        run(&h, &settled).await;
        assert_eq!(h.events.events.lock().unwrap().len(), 1);
        // And the settled status write is a no-op patch.
        assert!(!h.patcher.calls.lock().unwrap().last().unwrap().patched);
    }

    #[tokio::test]
    async fn test_restart_commands_startup_again() {
        let h = harness(Settings::default());
        // Post-startup enacted, then the container restarts: started flips
        // back to false while the spec still carries post-startup values.
        let pod = pod_fixture("50m", "50m", true, true, "Guaranteed", "[]");
        run(&h, &pod).await;
        assert_eq!(h.patcher.last_status().status, "Post-startup resources enacted");

        let mut restarted = h.patcher.last_pod();
        restarted
            .status
            .as_mut()
            .unwrap()
            .container_statuses
            .as_mut()
            .unwrap()[0]
            .started = Some(false);
        restarted
            .status
            .as_mut()
            .unwrap()
            .container_statuses
            .as_mut()
            .unwrap()[0]
            .ready = false;
        run(&h, &restarted).await;

        assert_eq!(h.patcher.resize_calls(), 1);
        let status = h.patcher.last_status();
        assert_eq!(status.status, "Startup resources commanded");
        // Bookkeeping from the previous cycle survives.
        assert!(!status.scale.last_enacted.is_empty());
        assert!(h.patcher.any_status_patched());
    }
}
