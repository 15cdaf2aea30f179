//! Composite classification of a target container's observed state.
//!
//! The classifier reduces a pod, its target container, and the per-resource
//! scaling configuration into one record the action engine can branch on
//! without touching the API objects again.

use crate::error::{Error, Result};
use crate::pods;
use crate::scale::{ResourceStates, ScalingConfigs};
use k8s_openapi::api::core::v1::{Container, Pod, PodCondition};

const CONDITION_RESIZE_IN_PROGRESS: &str = "PodResizeInProgress";
const CONDITION_RESIZE_PENDING: &str = "PodResizePending";
const REASON_ERROR: &str = "Error";
const REASON_DEFERRED: &str = "Deferred";
const REASON_INFEASIBLE: &str = "Infeasible";

/// Which configured triplet the container spec currently carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedResources {
    Startup,
    PostStartup,
    Unknown,
}

/// How the currently-enacted (status) resources relate to the spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusResources {
    PresentMatching,
    PresentNotMatching,
    Zero,
    NotPresent,
    Unknown,
}

/// The pod's resize progress as reported through status conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResizeState {
    NotStartedOrCompleted,
    InProgress,
    Deferred(String),
    Infeasible(String),
    Error(String),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosClass {
    Guaranteed,
    Burstable,
    BestEffort,
    NotPresent,
}

/// Everything the action engine branches on.
#[derive(Debug, Clone)]
pub struct PodState {
    pub startup_probe_exists: bool,
    pub readiness_probe_exists: bool,
    /// `None` until the kubelet reports a container status.
    pub started: Option<bool>,
    pub ready: Option<bool>,
    pub resources: AppliedResources,
    pub status_resources: StatusResources,
    pub resize: ResizeState,
    pub qos: QosClass,
}

/// Classifies the pod's observed state for the target container.
pub fn classify(pod: &Pod, container: &Container, configs: &ScalingConfigs) -> Result<PodState> {
    let states = ResourceStates::new(configs);

    let (started, ready) = match pods::container_status(pod, container) {
        Ok(status) => (Some(status.started.unwrap_or(false)), Some(status.ready)),
        Err(Error::StatusNotPresent(_)) => (None, None),
        Err(e) => return Err(e),
    };

    Ok(PodState {
        startup_probe_exists: pods::has_startup_probe(container),
        readiness_probe_exists: pods::has_readiness_probe(container),
        started,
        ready,
        resources: classify_resources(&states, container)?,
        status_resources: classify_status_resources(&states, pod, container)?,
        resize: classify_resize(pod),
        qos: classify_qos(pod),
    })
}

fn classify_resources(states: &ResourceStates, container: &Container) -> Result<AppliedResources> {
    if states.is_startup_applied_all(container)? {
        Ok(AppliedResources::Startup)
    } else if states.is_post_startup_applied_all(container)? {
        Ok(AppliedResources::PostStartup)
    } else {
        Ok(AppliedResources::Unknown)
    }
}

fn classify_status_resources(
    states: &ResourceStates,
    pod: &Pod,
    container: &Container,
) -> Result<StatusResources> {
    match states.is_any_current_zero_all(pod, container) {
        Ok(true) => return Ok(StatusResources::Zero),
        Ok(false) => {}
        Err(Error::StatusNotPresent(_)) | Err(Error::ResourcesNotPresent(_)) => {
            return Ok(StatusResources::NotPresent)
        }
        Err(e) => return Err(e),
    }
    if !states.has_current(pod, container)? {
        return Ok(StatusResources::NotPresent);
    }
    if states.does_requests_current_match_spec_all(pod, container)?
        && states.does_limits_current_match_spec_all(pod, container)?
    {
        Ok(StatusResources::PresentMatching)
    } else {
        Ok(StatusResources::PresentNotMatching)
    }
}

fn classify_resize(pod: &Pod) -> ResizeState {
    let conditions = pod
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_deref())
        .unwrap_or_default();

    if let Some(condition) = find_condition(conditions, CONDITION_RESIZE_IN_PROGRESS) {
        return match (condition.status.as_str(), condition.reason.as_deref()) {
            ("True", _) => ResizeState::InProgress,
            ("False", None) => ResizeState::NotStartedOrCompleted,
            ("False", Some(REASON_ERROR)) => ResizeState::Error(condition_message(condition)),
            _ => ResizeState::Unknown,
        };
    }
    if let Some(condition) = find_condition(conditions, CONDITION_RESIZE_PENDING) {
        return match condition.reason.as_deref() {
            Some(REASON_DEFERRED) => ResizeState::Deferred(condition_message(condition)),
            Some(REASON_INFEASIBLE) => ResizeState::Infeasible(condition_message(condition)),
            _ => ResizeState::Unknown,
        };
    }
    ResizeState::NotStartedOrCompleted
}

fn classify_qos(pod: &Pod) -> QosClass {
    match pods::qos_class(pod) {
        Some("Guaranteed") => QosClass::Guaranteed,
        Some("Burstable") => QosClass::Burstable,
        Some("BestEffort") => QosClass::BestEffort,
        _ => QosClass::NotPresent,
    }
}

fn find_condition<'a>(conditions: &'a [PodCondition], type_: &str) -> Option<&'a PodCondition> {
    conditions.iter().find(|c| c.type_ == type_)
}

fn condition_message(condition: &PodCondition) -> String {
    condition.message.clone().unwrap_or_default()
}
