//! The controller-owned status annotation.
//!
//! The controller publishes its view of each pod as JSON under
//! `startup-scaler.io/status`. Writes are idempotent: the annotation
//! mutation compares field-by-field ignoring the timestamp, so a status that
//! has not changed never causes a patch.

use crate::annotations;
use crate::error::{Error, Result};
use crate::scale::update::{MutationOutcome, PodMutation};
use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::core::v1::Pod;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Scale bookkeeping carried inside the status annotation. Timestamps are
/// RFC 3339, or empty when the event has not happened.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusScale {
    pub enabled_for_resources: Vec<String>,
    pub last_commanded: String,
    pub last_enacted: String,
    pub last_failed: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusAnnotation {
    pub status: String,
    pub last_updated: String,
    pub scale: StatusScale,
}

impl StatusAnnotation {
    /// A new status stamped with the current time.
    pub fn new(status: impl Into<String>, scale: StatusScale) -> Self {
        Self {
            status: status.into(),
            last_updated: now_rfc3339(),
            scale,
        }
    }

    /// Parses the status annotation from a pod. Absent or unparseable
    /// annotations read as `None`; the controller then writes a fresh one.
    pub fn read(pod: &Pod) -> Option<Self> {
        let raw = pod
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(annotations::STATUS))?;
        serde_json::from_str(raw).ok()
    }

    /// Field-by-field equality ignoring `lastUpdated`.
    pub fn equal_ignoring_timestamp(&self, other: &Self) -> bool {
        self.status == other.status && self.scale == other.scale
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(Error::from)
    }
}

/// The current time in the format stored in the annotation.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// A mutation writing the status annotation, skipping the patch when the
/// pod already carries an equal status. Never requests a wait predicate;
/// status writes go against the pod itself, not the resize subresource.
pub fn annotation_mutation(status: StatusAnnotation) -> PodMutation {
    Arc::new(move |pod: &mut Pod| {
        let unchanged = StatusAnnotation::read(pod)
            .map(|existing| existing.equal_ignoring_timestamp(&status))
            .unwrap_or(false);
        if unchanged {
            return Ok(MutationOutcome {
                should_patch: false,
                wait_predicate: None,
            });
        }
        pod.metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(annotations::STATUS.to_string(), status.to_json()?);
        Ok(MutationOutcome {
            should_patch: true,
            wait_predicate: None,
        })
    })
}
