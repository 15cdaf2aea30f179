//! Annotation-driven scaling configuration.
//!
//! One [`ResourceScalingConfig`] exists per supported resource and per
//! reconciliation. Lifecycle is staged: `store_from_annotations` first,
//! then `validate`. Calling `is_enabled` or `resources` before storing is a
//! programmer error and panics.

use crate::annotations;
use crate::error::{Error, Result};
use crate::pods;
use crate::quantity::ResourceQuantity;
use crate::scale::ScaledResource;
use crate::settings::Settings;
use k8s_openapi::api::core::v1::{Container, Pod};
use std::fmt;

/// The parsed startup / post-startup triplet for one resource.
#[derive(Debug, Clone, PartialEq)]
pub struct ScalingResources {
    pub startup: ResourceQuantity,
    pub post_startup_requests: ResourceQuantity,
    pub post_startup_limits: ResourceQuantity,
}

/// Per-resource scaling configuration for a single reconciliation.
#[derive(Debug, Clone)]
pub struct ResourceScalingConfig {
    resource: ScaledResource,
    controller_enabled: bool,
    stored: bool,
    user_enabled: bool,
    resources: Option<ScalingResources>,
}

impl ResourceScalingConfig {
    pub fn new(resource: ScaledResource, controller_enabled: bool) -> Self {
        Self {
            resource,
            controller_enabled,
            stored: false,
            user_enabled: false,
            resources: None,
        }
    }

    pub fn resource(&self) -> ScaledResource {
        self.resource
    }

    /// Populates the configuration from pod annotations.
    ///
    /// Disabled controller-side, or no per-resource annotation present, both
    /// store as enabled=false. When any of the three annotations is present,
    /// all three must be present and parse as quantities.
    pub fn store_from_annotations(&mut self, pod: &Pod) -> Result<()> {
        if !self.controller_enabled {
            self.stored = true;
            return Ok(());
        }

        let keys = [
            self.resource.startup_annotation(),
            self.resource.post_startup_requests_annotation(),
            self.resource.post_startup_limits_annotation(),
        ];
        let values: Vec<Option<String>> = keys
            .iter()
            .map(|key| annotations::annotation_string(pod, key))
            .collect();

        if values.iter().all(|v| v.is_none()) {
            // User did not opt this resource in.
            self.stored = true;
            return Ok(());
        }

        let mut parsed = Vec::with_capacity(3);
        for (key, value) in keys.iter().zip(&values) {
            let raw = value.as_ref().ok_or_else(|| {
                Error::Configuration(format!(
                    "{} annotations are partially present: '{}' is missing",
                    self.resource, key
                ))
            })?;
            let quantity = ResourceQuantity::parse(raw).map_err(|e| {
                Error::Configuration(format!("annotation '{}': {}", key, e))
            })?;
            parsed.push(quantity);
        }

        let mut parsed = parsed.into_iter();
        self.resources = Some(ScalingResources {
            startup: parsed.next().unwrap(),
            post_startup_requests: parsed.next().unwrap(),
            post_startup_limits: parsed.next().unwrap(),
        });
        self.user_enabled = true;
        self.stored = true;
        Ok(())
    }

    /// Conjunction of controller-side and user-side enablement.
    ///
    /// # Panics
    ///
    /// Panics when called before [`Self::store_from_annotations`]; that is a
    /// bug in the caller, not a runtime condition.
    pub fn is_enabled(&self) -> bool {
        assert!(
            self.stored,
            "is_enabled called before store_from_annotations for {}",
            self.resource
        );
        self.controller_enabled && self.user_enabled
    }

    /// The parsed triplet.
    ///
    /// # Panics
    ///
    /// Panics when the resource is not enabled.
    pub fn resources(&self) -> &ScalingResources {
        assert!(self.is_enabled(), "resources read for disabled {}", self.resource);
        self.resources
            .as_ref()
            .expect("enabled configuration always stores a triplet")
    }

    /// Enforces the per-resource invariants against the target container.
    /// No-op when the resource is not enabled.
    pub fn validate(&self, container: &Container) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        let scaling = self.resources();

        if scaling.post_startup_requests != scaling.post_startup_limits {
            return Err(Error::Validation(format!(
                "{} post-startup requests ({}) must equal post-startup limits ({})",
                self.resource, scaling.post_startup_requests, scaling.post_startup_limits
            )));
        }
        if scaling.post_startup_requests > scaling.startup {
            return Err(Error::Validation(format!(
                "{} post-startup requests ({}) is greater than startup value ({})",
                self.resource, scaling.post_startup_requests, scaling.startup
            )));
        }

        let requests = pods::spec_requests(container, self.resource)
            .map(ResourceQuantity::from_k8s)
            .transpose()?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "target container must specify {} requests",
                    self.resource
                ))
            })?;
        if requests.is_zero() {
            return Err(Error::Validation(format!(
                "target container {} requests must not be zero",
                self.resource
            )));
        }
        let limits = pods::spec_limits(container, self.resource)
            .map(ResourceQuantity::from_k8s)
            .transpose()?
            .ok_or_else(|| {
                Error::Validation(format!(
                    "target container must specify {} limits",
                    self.resource
                ))
            })?;
        if requests != limits {
            return Err(Error::Validation(format!(
                "target container {} requests ({}) must equal limits ({})",
                self.resource, requests, limits
            )));
        }

        match pods::resize_policy(container, self.resource) {
            Some("NotRequired") | None => Ok(()),
            Some(other) => Err(Error::Validation(format!(
                "target container {} resize policy must be NotRequired (got {})",
                self.resource, other
            ))),
        }
    }
}

impl fmt::Display for ResourceScalingConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.stored {
            return write!(f, "{}: not stored", self.resource);
        }
        match (&self.resources, self.is_enabled()) {
            (Some(r), true) => write!(
                f,
                "{}: startup={}, post-startup-requests={}, post-startup-limits={}",
                self.resource, r.startup, r.post_startup_requests, r.post_startup_limits
            ),
            _ => write!(f, "{}: disabled", self.resource),
        }
    }
}

/// All per-resource configurations for one reconciliation.
#[derive(Debug, Clone)]
pub struct ScalingConfigs {
    cpu: ResourceScalingConfig,
    memory: ResourceScalingConfig,
}

impl ScalingConfigs {
    pub fn new(settings: &Settings) -> Self {
        Self {
            cpu: ResourceScalingConfig::new(ScaledResource::Cpu, settings.cpu_scaling),
            memory: ResourceScalingConfig::new(ScaledResource::Memory, settings.memory_scaling),
        }
    }

    /// Reads the reserved target-container-name annotation.
    pub fn target_container_name(&self, pod: &Pod) -> Result<String> {
        annotations::annotation_string(pod, annotations::TARGET_CONTAINER_NAME).ok_or_else(|| {
            Error::Configuration(format!(
                "annotation '{}' is required",
                annotations::TARGET_CONTAINER_NAME
            ))
        })
    }

    pub fn store_all(&mut self, pod: &Pod) -> Result<()> {
        self.cpu.store_from_annotations(pod)?;
        self.memory.store_from_annotations(pod)?;
        Ok(())
    }

    pub fn validate_all(&self, container: &Container) -> Result<()> {
        self.cpu.validate(container)?;
        self.memory.validate(container)?;
        Ok(())
    }

    /// A pod with the opt-in label must enable at least one resource.
    pub fn validate_collection(&self) -> Result<()> {
        if self.all().iter().any(|c| c.is_enabled()) {
            Ok(())
        } else {
            Err(Error::Configuration(
                "no resource annotations present; at least one resource must be configured"
                    .to_string(),
            ))
        }
    }

    pub fn get(&self, resource: ScaledResource) -> &ResourceScalingConfig {
        match resource {
            ScaledResource::Cpu => &self.cpu,
            ScaledResource::Memory => &self.memory,
        }
    }

    pub fn all(&self) -> [&ResourceScalingConfig; 2] {
        [&self.cpu, &self.memory]
    }

    /// The resources enabled for this pod, in declaration order.
    pub fn enabled(&self) -> Vec<ScaledResource> {
        self.all()
            .into_iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.resource())
            .collect()
    }
}
