//! Per-resource scaling configuration, state and spec updates.

pub mod config;
pub mod state;
pub mod update;

pub use config::{ResourceScalingConfig, ScalingConfigs, ScalingResources};
pub use state::ResourceStates;
pub use update::{MutationOutcome, PodMutation, WaitPredicate};

use std::fmt;

/// A resource the controller knows how to scale.
///
/// Closed set: annotation keys, metric labels and spec lookups all derive
/// from this enum, so an unknown resource token cannot occur at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScaledResource {
    Cpu,
    Memory,
}

impl ScaledResource {
    pub const ALL: [ScaledResource; 2] = [ScaledResource::Cpu, ScaledResource::Memory];

    /// The Kubernetes resource name used in requests/limits maps.
    pub fn resource_name(&self) -> &'static str {
        match self {
            ScaledResource::Cpu => "cpu",
            ScaledResource::Memory => "memory",
        }
    }

    /// Annotation naming the startup quantity.
    pub fn startup_annotation(&self) -> &'static str {
        match self {
            ScaledResource::Cpu => "startup-scaler.io/cpu-startup",
            ScaledResource::Memory => "startup-scaler.io/memory-startup",
        }
    }

    /// Annotation naming the post-startup request quantity.
    pub fn post_startup_requests_annotation(&self) -> &'static str {
        match self {
            ScaledResource::Cpu => "startup-scaler.io/cpu-post-startup-requests",
            ScaledResource::Memory => "startup-scaler.io/memory-post-startup-requests",
        }
    }

    /// Annotation naming the post-startup limit quantity.
    pub fn post_startup_limits_annotation(&self) -> &'static str {
        match self {
            ScaledResource::Cpu => "startup-scaler.io/cpu-post-startup-limits",
            ScaledResource::Memory => "startup-scaler.io/memory-post-startup-limits",
        }
    }
}

impl fmt::Display for ScaledResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.resource_name())
    }
}

/// Which triplet a scaling action targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDirection {
    Startup,
    PostStartup,
}

impl ScaleDirection {
    /// Sentence-initial form used in status messages and events.
    pub fn title(&self) -> &'static str {
        match self {
            ScaleDirection::Startup => "Startup",
            ScaleDirection::PostStartup => "Post-startup",
        }
    }
}

impl fmt::Display for ScaleDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleDirection::Startup => f.write_str("startup"),
            ScaleDirection::PostStartup => f.write_str("post-startup"),
        }
    }
}
