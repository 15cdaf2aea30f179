//! Read-only accessors over pod and container shapes.
//!
//! Pure functions: each takes a pod (and optionally a container) and returns
//! a typed view plus a classified error. Nothing in this module mutates or
//! performs I/O.

use crate::error::{Error, Result};
use crate::scale::ScaledResource;
use k8s_openapi::api::core::v1::{Container, ContainerState, ContainerStatus, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;

/// Finds a container by name in the pod spec.
pub fn get_container<'a>(pod: &'a Pod, name: &str) -> Result<&'a Container> {
    pod.spec
        .as_ref()
        .map(|spec| spec.containers.as_slice())
        .unwrap_or_default()
        .iter()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::ContainerNotPresent(format!("container '{}' not in pod spec", name)))
}

pub fn has_startup_probe(container: &Container) -> bool {
    container.startup_probe.is_some()
}

pub fn has_readiness_probe(container: &Container) -> bool {
    container.readiness_probe.is_some()
}

/// The container's status entry, or `StatusNotPresent` before the kubelet
/// first reports it.
pub fn container_status<'a>(pod: &'a Pod, container: &Container) -> Result<&'a ContainerStatus> {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|cs| cs.name == container.name))
        .ok_or_else(|| {
            Error::StatusNotPresent(format!("no status for container '{}'", container.name))
        })
}

/// Running/waiting/terminated view of the container.
pub fn container_state<'a>(pod: &'a Pod, container: &Container) -> Result<&'a ContainerState> {
    container_status(pod, container)?
        .state
        .as_ref()
        .ok_or_else(|| {
            Error::StatusNotPresent(format!("no state for container '{}'", container.name))
        })
}

/// Whether the container's startup probe has succeeded. An absent flag
/// reads as `false`.
pub fn is_started(pod: &Pod, container: &Container) -> Result<bool> {
    Ok(container_status(pod, container)?.started.unwrap_or(false))
}

/// Whether the container passes its readiness probe.
pub fn is_ready(pod: &Pod, container: &Container) -> Result<bool> {
    Ok(container_status(pod, container)?.ready)
}

/// The spec-declared request for a resource; `None` when unspecified.
pub fn spec_requests<'a>(
    container: &'a Container,
    resource: ScaledResource,
) -> Option<&'a K8sQuantity> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.requests.as_ref())
        .and_then(|reqs| reqs.get(resource.resource_name()))
}

/// The spec-declared limit for a resource; `None` when unspecified.
pub fn spec_limits<'a>(
    container: &'a Container,
    resource: ScaledResource,
) -> Option<&'a K8sQuantity> {
    container
        .resources
        .as_ref()
        .and_then(|r| r.limits.as_ref())
        .and_then(|lims| lims.get(resource.resource_name()))
}

/// The container's restart policy for resizing this resource, or `None`
/// when no policy is declared.
pub fn resize_policy<'a>(container: &'a Container, resource: ScaledResource) -> Option<&'a str> {
    container
        .resize_policy
        .as_ref()
        .and_then(|policies| {
            policies
                .iter()
                .find(|p| p.resource_name == resource.resource_name())
        })
        .map(|p| p.restart_policy.as_str())
}

/// The currently-enacted request from the container status.
///
/// `ResourcesNotPresent` when the status has no resource view yet;
/// `Ok(None)` when the view exists but carries no entry for this resource.
pub fn current_requests<'a>(
    pod: &'a Pod,
    container: &Container,
    resource: ScaledResource,
) -> Result<Option<&'a K8sQuantity>> {
    let status = container_status(pod, container)?;
    let resources = status.resources.as_ref().ok_or_else(|| {
        Error::ResourcesNotPresent(format!(
            "no status resources for container '{}'",
            container.name
        ))
    })?;
    Ok(resources
        .requests
        .as_ref()
        .and_then(|reqs| reqs.get(resource.resource_name())))
}

/// The currently-enacted limit from the container status.
pub fn current_limits<'a>(
    pod: &'a Pod,
    container: &Container,
    resource: ScaledResource,
) -> Result<Option<&'a K8sQuantity>> {
    let status = container_status(pod, container)?;
    let resources = status.resources.as_ref().ok_or_else(|| {
        Error::ResourcesNotPresent(format!(
            "no status resources for container '{}'",
            container.name
        ))
    })?;
    Ok(resources
        .limits
        .as_ref()
        .and_then(|lims| lims.get(resource.resource_name())))
}

/// The pod's QoS class as reported in status, if populated.
pub fn qos_class(pod: &Pod) -> Option<&str> {
    pod.status
        .as_ref()
        .and_then(|s| s.qos_class.as_deref())
}
