//! Reserved label and annotation keys, and typed metadata reads.
//!
//! All keys live under the controller's namespace `startup-scaler.io`. A pod
//! opts in with the enabled label; its scaling behaviour is configured
//! entirely through annotations.

use crate::error::{Error, Result};
use k8s_openapi::api::core::v1::Pod;

/// Namespace prefix for every key the controller owns.
pub const DOMAIN: &str = "startup-scaler.io";

/// Opt-in label; only pods labelled `startup-scaler.io/enabled=true` are watched.
pub const ENABLED_LABEL: &str = "startup-scaler.io/enabled";

/// Names the container whose resources are scaled.
pub const TARGET_CONTAINER_NAME: &str = "startup-scaler.io/target-container-name";

/// Structured status annotation written by the controller.
pub const STATUS: &str = "startup-scaler.io/status";

/// Requested interpretation of a metadata value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueAs {
    AsString,
    AsBool,
}

/// A metadata value read with a declared type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedValue {
    String(String),
    Bool(bool),
}

/// Reads a pod annotation as the requested type.
///
/// Returns `Ok(None)` when the annotation is absent and an error when it is
/// present but does not parse as the requested type.
pub fn annotation_value(pod: &Pod, key: &str, as_: ValueAs) -> Result<Option<TypedValue>> {
    let raw = pod
        .metadata
        .annotations
        .as_ref()
        .and_then(|anns| anns.get(key));
    typed(raw, key, as_)
}

/// Reads a pod label as the requested type.
pub fn label_value(pod: &Pod, key: &str, as_: ValueAs) -> Result<Option<TypedValue>> {
    let raw = pod.metadata.labels.as_ref().and_then(|ls| ls.get(key));
    typed(raw, key, as_)
}

fn typed(raw: Option<&String>, key: &str, as_: ValueAs) -> Result<Option<TypedValue>> {
    let Some(raw) = raw else {
        return Ok(None);
    };
    match as_ {
        ValueAs::AsString => Ok(Some(TypedValue::String(raw.clone()))),
        ValueAs::AsBool => match raw.as_str() {
            "true" => Ok(Some(TypedValue::Bool(true))),
            "false" => Ok(Some(TypedValue::Bool(false))),
            other => Err(Error::Configuration(format!(
                "'{}' value '{}' is not a boolean",
                key, other
            ))),
        },
    }
}

/// Convenience wrapper for string annotations.
pub fn annotation_string(pod: &Pod, key: &str) -> Option<String> {
    match annotation_value(pod, key, ValueAs::AsString) {
        Ok(Some(TypedValue::String(s))) => Some(s),
        _ => None,
    }
}

/// Whether the pod carries the opt-in label with value `true`.
pub fn is_enabled(pod: &Pod) -> Result<bool> {
    match label_value(pod, ENABLED_LABEL, ValueAs::AsBool)? {
        Some(TypedValue::Bool(b)) => Ok(b),
        _ => Ok(false),
    }
}
