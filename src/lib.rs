//! Startup Scaler
//!
//! A Kubernetes controller that in-place resizes a designated container's
//! CPU and memory between a larger "startup" triplet and a steady-state
//! "post-startup" triplet, following the container through its lifecycle.
//!
//! ## Example
//!
//! ```yaml
//! apiVersion: v1
//! kind: Pod
//! metadata:
//!   name: my-app
//!   labels:
//!     startup-scaler.io/enabled: "true"
//!   annotations:
//!     startup-scaler.io/target-container-name: app
//!     startup-scaler.io/cpu-startup: 500m
//!     startup-scaler.io/cpu-post-startup-requests: 100m
//!     startup-scaler.io/cpu-post-startup-limits: 100m
//! ```

pub mod annotations;
pub mod engine;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod metrics;
pub mod patcher;
pub mod podevents;
pub mod pods;
pub mod podstate;
pub mod quantity;
pub mod reconciler;
pub mod scale;
pub mod settings;
pub mod status;
pub mod watch;

pub use engine::ActionEngine;
pub use error::{Error, Result};
pub use events::{EventPublisher, KubeEventPublisher, NoopEventPublisher};
pub use patcher::{Patcher, PodPatcher};
pub use podevents::PodEventPublisher;
pub use reconciler::PodController;
pub use settings::Settings;
