//! Observed per-resource scaling state.
//!
//! Thin view over the configuration and the pod/container accessors.
//! Per-resource predicates return `None` for disabled resources so the
//! aggregate folds only consider resources the user opted in.

use crate::error::{Error, Result};
use crate::pods;
use crate::quantity::ResourceQuantity;
use crate::scale::{ScaledResource, ScalingConfigs};
use k8s_openapi::api::core::v1::{Container, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity as K8sQuantity;

/// Predicates over the currently observed state of each enabled resource.
pub struct ResourceStates<'a> {
    configs: &'a ScalingConfigs,
}

impl<'a> ResourceStates<'a> {
    pub fn new(configs: &'a ScalingConfigs) -> Self {
        Self { configs }
    }

    /// Does the container spec carry the startup triplet for this resource?
    pub fn is_startup_applied(
        &self,
        container: &Container,
        resource: ScaledResource,
    ) -> Result<Option<bool>> {
        let config = self.configs.get(resource);
        if !config.is_enabled() {
            return Ok(None);
        }
        let scaling = config.resources();
        let requests = parse_opt(pods::spec_requests(container, resource))?;
        let limits = parse_opt(pods::spec_limits(container, resource))?;
        Ok(Some(
            requests.as_ref() == Some(&scaling.startup) && limits.as_ref() == Some(&scaling.startup),
        ))
    }

    /// Does the container spec carry the post-startup triplet for this resource?
    pub fn is_post_startup_applied(
        &self,
        container: &Container,
        resource: ScaledResource,
    ) -> Result<Option<bool>> {
        let config = self.configs.get(resource);
        if !config.is_enabled() {
            return Ok(None);
        }
        let scaling = config.resources();
        let requests = parse_opt(pods::spec_requests(container, resource))?;
        let limits = parse_opt(pods::spec_limits(container, resource))?;
        Ok(Some(
            requests.as_ref() == Some(&scaling.post_startup_requests)
                && limits.as_ref() == Some(&scaling.post_startup_limits),
        ))
    }

    /// Is any currently-enacted quantity zero for this resource?
    pub fn is_any_current_zero(
        &self,
        pod: &Pod,
        container: &Container,
        resource: ScaledResource,
    ) -> Result<Option<bool>> {
        if !self.configs.get(resource).is_enabled() {
            return Ok(None);
        }
        let requests = parse_opt(pods::current_requests(pod, container, resource)?)?;
        let limits = parse_opt(pods::current_limits(pod, container, resource)?)?;
        Ok(Some(
            requests.map(|q| q.is_zero()).unwrap_or(false)
                || limits.map(|q| q.is_zero()).unwrap_or(false),
        ))
    }

    /// Do the currently-enacted requests match the spec requests?
    /// A missing status entry reads as a non-match.
    pub fn does_requests_current_match_spec(
        &self,
        pod: &Pod,
        container: &Container,
        resource: ScaledResource,
    ) -> Result<Option<bool>> {
        if !self.configs.get(resource).is_enabled() {
            return Ok(None);
        }
        let current = parse_opt(pods::current_requests(pod, container, resource)?)?;
        let spec = parse_opt(pods::spec_requests(container, resource))?;
        Ok(Some(current == spec && current.is_some()))
    }

    /// Do the currently-enacted limits match the spec limits?
    pub fn does_limits_current_match_spec(
        &self,
        pod: &Pod,
        container: &Container,
        resource: ScaledResource,
    ) -> Result<Option<bool>> {
        if !self.configs.get(resource).is_enabled() {
            return Ok(None);
        }
        let current = parse_opt(pods::current_limits(pod, container, resource)?)?;
        let spec = parse_opt(pods::spec_limits(container, resource))?;
        Ok(Some(current == spec && current.is_some()))
    }

    /// Whether every enabled resource has a current (status) entry for both
    /// requests and limits.
    pub fn has_current(&self, pod: &Pod, container: &Container) -> Result<bool> {
        for resource in self.enabled() {
            if pods::current_requests(pod, container, resource)?.is_none()
                || pods::current_limits(pod, container, resource)?.is_none()
            {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True when the startup triplet is applied for every enabled resource.
    pub fn is_startup_applied_all(&self, container: &Container) -> Result<bool> {
        self.fold_all(|resource| self.is_startup_applied(container, resource))
    }

    /// True when the post-startup triplet is applied for every enabled resource.
    pub fn is_post_startup_applied_all(&self, container: &Container) -> Result<bool> {
        self.fold_all(|resource| self.is_post_startup_applied(container, resource))
    }

    /// True as soon as any enabled resource reports a zero current quantity.
    pub fn is_any_current_zero_all(&self, pod: &Pod, container: &Container) -> Result<bool> {
        for resource in self.enabled() {
            if let Some(true) = self.is_any_current_zero(pod, container, resource)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// True when current requests match spec requests for every enabled resource.
    pub fn does_requests_current_match_spec_all(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Result<bool> {
        self.fold_all(|resource| self.does_requests_current_match_spec(pod, container, resource))
    }

    /// True when current limits match spec limits for every enabled resource.
    pub fn does_limits_current_match_spec_all(
        &self,
        pod: &Pod,
        container: &Container,
    ) -> Result<bool> {
        self.fold_all(|resource| self.does_limits_current_match_spec(pod, container, resource))
    }

    fn enabled(&self) -> impl Iterator<Item = ScaledResource> + '_ {
        ScaledResource::ALL
            .into_iter()
            .filter(|r| self.configs.get(*r).is_enabled())
    }

    fn fold_all<F>(&self, mut predicate: F) -> Result<bool>
    where
        F: FnMut(ScaledResource) -> Result<Option<bool>>,
    {
        let mut any = false;
        for resource in ScaledResource::ALL {
            match predicate(resource)? {
                Some(true) => any = true,
                Some(false) => return Ok(false),
                None => {}
            }
        }
        Ok(any)
    }
}

fn parse_opt(q: Option<&K8sQuantity>) -> Result<Option<ResourceQuantity>> {
    q.map(ResourceQuantity::from_k8s)
        .transpose()
        .map_err(|e| Error::Configuration(format!("container quantity: {}", e)))
}
