//! Pod-mutation closures that move a container between resource triplets.
//!
//! Mutations are pure with respect to the pod they receive: the patcher
//! re-applies them to a freshly read pod after a 409 conflict, so they must
//! never capture pod state, only the desired target values.

use crate::error::{Error, Result};
use crate::quantity::ResourceQuantity;
use crate::scale::{ScaleDirection, ScaledResource, ScalingConfigs, ScalingResources};
use k8s_openapi::api::core::v1::{Container, Pod, ResourceRequirements};
use std::sync::Arc;

/// Decides when the informer cache reflects an intended change.
pub type WaitPredicate = Arc<dyn Fn(&Pod) -> bool + Send + Sync>;

/// A single mutation applied by the patcher to a deep-copied pod.
pub type PodMutation = Arc<dyn Fn(&mut Pod) -> Result<MutationOutcome> + Send + Sync>;

/// What a mutation observed and requires.
pub struct MutationOutcome {
    /// Whether the mutation changed anything that needs patching.
    pub should_patch: bool,
    /// Condition the patcher waits for after a successful patch.
    pub wait_predicate: Option<WaitPredicate>,
}

/// Builds a mutation that sets one resource of the named container to the
/// startup or post-startup triplet.
pub fn resource_mutation(
    resource: ScaledResource,
    direction: ScaleDirection,
    container_name: String,
    scaling: ScalingResources,
) -> PodMutation {
    let (requests, limits) = desired(direction, &scaling);
    Arc::new(move |pod: &mut Pod| {
        let container = target_container(pod, &container_name)?;

        let already_applied = spec_matches(container, resource, &requests, &limits);
        if !already_applied {
            apply(container, resource, &requests, &limits);
        }

        let predicate = wait_predicate(resource, container_name.clone(), requests.clone(), limits.clone());
        Ok(MutationOutcome {
            should_patch: !already_applied,
            wait_predicate: Some(predicate),
        })
    })
}

/// One mutation per enabled resource, for a single combined patch.
pub fn mutations_for(
    configs: &ScalingConfigs,
    direction: ScaleDirection,
    container_name: &str,
) -> Vec<PodMutation> {
    configs
        .enabled()
        .into_iter()
        .map(|resource| {
            resource_mutation(
                resource,
                direction,
                container_name.to_string(),
                configs.get(resource).resources().clone(),
            )
        })
        .collect()
}

fn desired(
    direction: ScaleDirection,
    scaling: &ScalingResources,
) -> (ResourceQuantity, ResourceQuantity) {
    match direction {
        ScaleDirection::Startup => (scaling.startup.clone(), scaling.startup.clone()),
        ScaleDirection::PostStartup => (
            scaling.post_startup_requests.clone(),
            scaling.post_startup_limits.clone(),
        ),
    }
}

fn target_container<'a>(pod: &'a mut Pod, name: &str) -> Result<&'a mut Container> {
    pod.spec
        .as_mut()
        .map(|spec| spec.containers.as_mut_slice())
        .unwrap_or_default()
        .iter_mut()
        .find(|c| c.name == name)
        .ok_or_else(|| Error::ContainerNotPresent(format!("container '{}' not in pod spec", name)))
}

fn spec_matches(
    container: &Container,
    resource: ScaledResource,
    requests: &ResourceQuantity,
    limits: &ResourceQuantity,
) -> bool {
    let current = |map: Option<&std::collections::BTreeMap<
        String,
        k8s_openapi::apimachinery::pkg::api::resource::Quantity,
    >>| {
        map.and_then(|m| m.get(resource.resource_name()))
            .and_then(|q| ResourceQuantity::from_k8s(q).ok())
    };
    let resources = container.resources.as_ref();
    current(resources.and_then(|r| r.requests.as_ref())).as_ref() == Some(requests)
        && current(resources.and_then(|r| r.limits.as_ref())).as_ref() == Some(limits)
}

fn apply(
    container: &mut Container,
    resource: ScaledResource,
    requests: &ResourceQuantity,
    limits: &ResourceQuantity,
) {
    let resources = container
        .resources
        .get_or_insert_with(ResourceRequirements::default);
    resources
        .requests
        .get_or_insert_with(Default::default)
        .insert(resource.resource_name().to_string(), requests.to_k8s());
    resources
        .limits
        .get_or_insert_with(Default::default)
        .insert(resource.resource_name().to_string(), limits.to_k8s());
}

fn wait_predicate(
    resource: ScaledResource,
    container_name: String,
    requests: ResourceQuantity,
    limits: ResourceQuantity,
) -> WaitPredicate {
    Arc::new(move |pod: &Pod| {
        let Some(container) = pod
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .find(|c| c.name == container_name)
        else {
            return false;
        };
        spec_matches(container, resource, &requests, &limits)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn scaling() -> ScalingResources {
        ScalingResources {
            startup: ResourceQuantity::parse("200m").unwrap(),
            post_startup_requests: ResourceQuantity::parse("50m").unwrap(),
            post_startup_limits: ResourceQuantity::parse("50m").unwrap(),
        }
    }

    fn pod_with_cpu(cpu: &str) -> Pod {
        let json = format!(
            r#"{{
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": {{"name": "test", "namespace": "default"}},
                "spec": {{
                    "containers": [{{
                        "name": "app",
                        "resources": {{
                            "requests": {{"cpu": "{cpu}"}},
                            "limits": {{"cpu": "{cpu}"}}
                        }}
                    }}]
                }}
            }}"#,
            cpu = cpu,
        );
        serde_json::from_str(&json).unwrap()
    }

    fn cpu_of(pod: &Pod) -> (String, String) {
        let resources = pod.spec.as_ref().unwrap().containers[0]
            .resources
            .as_ref()
            .unwrap();
        (
            resources.requests.as_ref().unwrap()["cpu"].0.clone(),
            resources.limits.as_ref().unwrap()["cpu"].0.clone(),
        )
    }

    #[test]
    fn test_startup_mutation_applies_triplet() {
        let mutation = resource_mutation(
            ScaledResource::Cpu,
            ScaleDirection::Startup,
            "app".to_string(),
            scaling(),
        );
        let mut pod = pod_with_cpu("50m");
        let outcome = mutation(&mut pod).unwrap();
        assert!(outcome.should_patch);
        assert_eq!(cpu_of(&pod), ("200m".to_string(), "200m".to_string()));

        let predicate = outcome.wait_predicate.unwrap();
        assert!(predicate(&pod));
        assert!(!predicate(&pod_with_cpu("50m")));
    }

    #[test]
    fn test_post_startup_mutation_applies_triplet() {
        let mutation = resource_mutation(
            ScaledResource::Cpu,
            ScaleDirection::PostStartup,
            "app".to_string(),
            scaling(),
        );
        let mut pod = pod_with_cpu("200m");
        let outcome = mutation(&mut pod).unwrap();
        assert!(outcome.should_patch);
        assert_eq!(cpu_of(&pod), ("50m".to_string(), "50m".to_string()));
    }

    #[test]
    fn test_mutation_is_noop_when_already_applied() {
        let mutation = resource_mutation(
            ScaledResource::Cpu,
            ScaleDirection::Startup,
            "app".to_string(),
            scaling(),
        );
        let mut pod = pod_with_cpu("200m");
        let outcome = mutation(&mut pod).unwrap();
        assert!(!outcome.should_patch);
        assert_eq!(cpu_of(&pod), ("200m".to_string(), "200m".to_string()));
    }

    #[test]
    fn test_mutation_is_pure_under_reapplication() {
        // The conflict loop applies mutations to a fresh pod; applying twice
        // must produce the same outcome both times.
        let mutation = resource_mutation(
            ScaledResource::Cpu,
            ScaleDirection::Startup,
            "app".to_string(),
            scaling(),
        );
        for _ in 0..2 {
            let mut pod = pod_with_cpu("50m");
            let outcome = mutation(&mut pod).unwrap();
            assert!(outcome.should_patch);
            assert_eq!(cpu_of(&pod), ("200m".to_string(), "200m".to_string()));
        }
    }

    #[test]
    fn test_mutation_missing_container_fails() {
        let mutation = resource_mutation(
            ScaledResource::Cpu,
            ScaleDirection::Startup,
            "ghost".to_string(),
            scaling(),
        );
        let mut pod = pod_with_cpu("50m");
        assert!(matches!(
            mutation(&mut pod),
            Err(Error::ContainerNotPresent(_))
        ));
    }

    #[test]
    fn test_mutations_for_enabled_resources() {
        let pod_json = r#"{
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": "test",
                "namespace": "default",
                "annotations": {
                    "startup-scaler.io/target-container-name": "app",
                    "startup-scaler.io/cpu-startup": "200m",
                    "startup-scaler.io/cpu-post-startup-requests": "50m",
                    "startup-scaler.io/cpu-post-startup-limits": "50m",
                    "startup-scaler.io/memory-startup": "256Mi",
                    "startup-scaler.io/memory-post-startup-requests": "128Mi",
                    "startup-scaler.io/memory-post-startup-limits": "128Mi"
                }
            },
            "spec": {"containers": [{"name": "app"}]}
        }"#;
        let pod: Pod = serde_json::from_str(pod_json).unwrap();
        let mut configs = ScalingConfigs::new(&Settings::default());
        configs.store_all(&pod).unwrap();

        let mutations = mutations_for(&configs, ScaleDirection::Startup, "app");
        assert_eq!(mutations.len(), 2);

        let mut pod = pod;
        for mutation in &mutations {
            assert!(mutation(&mut pod).unwrap().should_patch);
        }
        let resources = pod.spec.as_ref().unwrap().containers[0]
            .resources
            .as_ref()
            .unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"].0, "200m");
        assert_eq!(resources.limits.as_ref().unwrap()["memory"].0, "256Mi");
    }
}
