//! Conflict-aware pod patching with informer-cache coherence waiting.
//!
//! The patcher applies mutation closures to a deep copy of a pod, computes
//! an RFC 7386 merge patch and submits it against the pod or its `resize`
//! subresource. Conflicts re-read the live pod and re-apply the mutations;
//! other recoverable API errors retry with bounded backoff. When a mutation
//! supplies a wait predicate, the patcher subscribes to pod update events
//! before patching and blocks until the informer cache reflects the change
//! or a timeout elapses.

use crate::error::{Error, Result};
use crate::metrics;
use crate::podevents::{PodEvent, PodEventPublisher, PodEventType, SubscriptionId};
use crate::scale::update::{PodMutation, WaitPredicate};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Default wait for the informer cache to reflect a patch.
pub const DEFAULT_CACHE_SYNC_TIMEOUT: Duration = Duration::from_secs(5);

const MAX_TRANSIENT_RETRIES: u32 = 3;
const MAX_CONFLICT_RETRIES: u32 = 5;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(250);

/// Applies mutation closures to a pod and persists the result.
#[async_trait]
pub trait Patcher: Send + Sync {
    async fn patch(
        &self,
        pod: &Pod,
        mutations: &[PodMutation],
        use_resize_subresource: bool,
        wait_timeout: Option<Duration>,
    ) -> Result<Pod>;
}

/// Applies mutation closures and patches pods.
pub struct PodPatcher {
    client: Client,
    publisher: Arc<PodEventPublisher>,
}

/// Mutations applied to a deep copy, ready to patch.
struct Prepared {
    mutated: Pod,
    should_patch: bool,
    predicates: Vec<WaitPredicate>,
}

impl std::fmt::Debug for Prepared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Prepared")
            .field("mutated", &self.mutated)
            .field("should_patch", &self.should_patch)
            .field("predicates", &format_args!("[{} predicates]", self.predicates.len()))
            .finish()
    }
}

impl PodPatcher {
    pub fn new(client: Client, publisher: Arc<PodEventPublisher>) -> Self {
        Self { client, publisher }
    }
}

#[async_trait]
impl Patcher for PodPatcher {
    /// Applies `mutations` to a copy of `pod` and patches the result.
    ///
    /// Returns the original pod unchanged when no mutation signals a needed
    /// patch. When any mutation supplies a wait predicate, the returned pod
    /// is the informer-observed pod satisfying every predicate, or the
    /// pre-patch mutated pod on timeout.
    async fn patch(
        &self,
        pod: &Pod,
        mutations: &[PodMutation],
        use_resize_subresource: bool,
        wait_timeout: Option<Duration>,
    ) -> Result<Pod> {
        let prepared = prepare(pod, mutations)?;
        if !prepared.should_patch {
            return Ok(pod.clone());
        }

        let name = pod.name_any();
        let namespace = pod.namespace().unwrap_or_else(|| "default".to_string());
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);

        // Subscribe before patching so the confirming update cannot be missed.
        let subscription = if prepared.predicates.is_empty() {
            None
        } else {
            let (id, rx) =
                self.publisher
                    .subscribe(&namespace, &name, &[PodEventType::Update]);
            Some((SubscriptionGuard::new(&self.publisher, id), rx))
        };

        let mutated = self
            .apply_with_retry(&api, pod, prepared, mutations, use_resize_subresource, &name)
            .await?;

        let (mutated, predicates) = mutated;
        match subscription {
            None => Ok(mutated),
            Some((_guard, rx)) => {
                let timeout = wait_timeout.unwrap_or(DEFAULT_CACHE_SYNC_TIMEOUT);
                Ok(wait_for_cache_sync(rx, &predicates, timeout, mutated).await)
            }
        }
    }
}

impl PodPatcher {
    /// Submits the merge patch, handling conflicts and transient errors.
    async fn apply_with_retry(
        &self,
        api: &Api<Pod>,
        pod: &Pod,
        prepared: Prepared,
        mutations: &[PodMutation],
        use_resize_subresource: bool,
        name: &str,
    ) -> Result<(Pod, Vec<WaitPredicate>)> {
        let mut base = pod.clone();
        let mut mutated = prepared.mutated;
        let predicates = prepared.predicates;
        let mut transient_retries = 0u32;
        let mut conflict_retries = 0u32;

        loop {
            let patch = merge_patch(
                &serde_json::to_value(&base)?,
                &serde_json::to_value(&mutated)?,
            );
            let params = PatchParams::default();
            let result = if use_resize_subresource {
                api.patch_subresource("resize", name, &params, &Patch::Merge(&patch))
                    .await
            } else {
                api.patch(name, &params, &Patch::Merge(&patch)).await
            };

            match result {
                Ok(_) => return Ok((mutated, predicates)),
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    conflict_retries += 1;
                    metrics::KUBE_API_RETRY_TOTAL
                        .with_label_values(&["conflict"])
                        .inc();
                    if conflict_retries > MAX_CONFLICT_RETRIES {
                        return Err(Error::KubeApi(format!(
                            "patch of pod '{}' conflicted {} times",
                            name, conflict_retries
                        )));
                    }
                    debug!(pod = %name, "patch conflicted, re-reading and re-applying");
                    let fresh = match api.get(name).await {
                        Ok(fresh) => fresh,
                        Err(kube::Error::Api(ae)) if ae.code == 404 => {
                            return Err(Error::Unrecoverable(format!(
                                "pod '{}' deleted while resolving patch conflict",
                                name
                            )));
                        }
                        Err(e) => return Err(e.into()),
                    };
                    // Re-apply against the live pod; predicates from the first
                    // application remain authoritative.
                    let reapplied = prepare(&fresh, mutations)?;
                    if !reapplied.should_patch {
                        return Ok((fresh, predicates));
                    }
                    base = fresh;
                    mutated = reapplied.mutated;
                }
                Err(e) => match retry_reason(&e) {
                    Some(reason) if transient_retries < MAX_TRANSIENT_RETRIES => {
                        metrics::KUBE_API_RETRY_TOTAL
                            .with_label_values(&[reason])
                            .inc();
                        let delay = RETRY_BASE_DELAY * 2u32.pow(transient_retries);
                        transient_retries += 1;
                        warn!(
                            pod = %name,
                            reason = reason,
                            attempt = transient_retries,
                            "retrying pod patch after transient error: {}",
                            e
                        );
                        tokio::time::sleep(delay).await;
                    }
                    _ => return Err(e.into()),
                },
            }
        }
    }
}

/// Applies all mutations to a deep copy, folding outcomes.
fn prepare(pod: &Pod, mutations: &[PodMutation]) -> Result<Prepared> {
    let mut mutated = pod.clone();
    let mut should_patch = false;
    let mut predicates = Vec::new();
    for mutation in mutations {
        let outcome = mutation(&mut mutated).map_err(|e| e.context("unable to mutate pod"))?;
        should_patch |= outcome.should_patch;
        if let Some(predicate) = outcome.wait_predicate {
            predicates.push(predicate);
        }
    }
    Ok(Prepared {
        mutated,
        should_patch,
        predicates,
    })
}

/// Computes an RFC 7386 merge patch transforming `original` into `modified`.
pub fn merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(original), Value::Object(modified)) => {
            let mut patch = serde_json::Map::new();
            for (key, modified_value) in modified {
                match original.get(key) {
                    Some(original_value) if original_value == modified_value => {}
                    Some(original_value) => {
                        patch.insert(key.clone(), merge_patch(original_value, modified_value));
                    }
                    None => {
                        patch.insert(key.clone(), modified_value.clone());
                    }
                }
            }
            for key in original.keys() {
                if !modified.contains_key(key) {
                    patch.insert(key.clone(), Value::Null);
                }
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

/// Drains the subscription until every predicate holds for an observed pod,
/// or returns `fallback` on timeout.
///
/// # Panics
///
/// Panics when a non-update event arrives; the subscription filter only
/// admits updates, so anything else is a publisher bug.
async fn wait_for_cache_sync(
    mut rx: mpsc::Receiver<PodEvent>,
    predicates: &[WaitPredicate],
    timeout: Duration,
    fallback: Pod,
) -> Pod {
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            metrics::INFORMER_CACHE_SYNC_TIMEOUT_TOTAL.inc();
            return fallback;
        }
        match tokio::time::timeout(remaining, rx.recv()).await {
            Err(_) | Ok(None) => {
                metrics::INFORMER_CACHE_SYNC_TIMEOUT_TOTAL.inc();
                return fallback;
            }
            Ok(Some(event)) => {
                assert!(
                    event.event_type == PodEventType::Update,
                    "received {:?} pod event on an update-only subscription",
                    event.event_type
                );
                if predicates.iter().all(|p| p(&event.pod)) {
                    return (*event.pod).clone();
                }
            }
        }
    }
}

/// Unsubscribes on drop so every exit path releases the subscription.
struct SubscriptionGuard<'a> {
    publisher: &'a PodEventPublisher,
    id: SubscriptionId,
}

impl<'a> SubscriptionGuard<'a> {
    fn new(publisher: &'a PodEventPublisher, id: SubscriptionId) -> Self {
        Self { publisher, id }
    }
}

impl Drop for SubscriptionGuard<'_> {
    fn drop(&mut self) {
        self.publisher.unsubscribe(self.id);
    }
}

/// Classifies a kube error into a retry-reason label, or `None` when the
/// error must not be retried.
fn retry_reason(err: &kube::Error) -> Option<&'static str> {
    match err {
        kube::Error::Api(ae) if ae.code == 429 => Some("too_many_requests"),
        kube::Error::Api(ae) if (500..600).contains(&ae.code) => Some("server_error"),
        kube::Error::Api(_) => None,
        kube::Error::HyperError(_) | kube::Error::Service(_) => Some("transport"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scale::update::MutationOutcome;
    use serde_json::json;

    fn pod_fixture(cpu: &str) -> Pod {
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
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn test_merge_patch_diffs_nested_objects() {
        let original = json!({"a": {"b": 1, "c": 2}, "keep": true});
        let modified = json!({"a": {"b": 1, "c": 3}, "keep": true});
        assert_eq!(merge_patch(&original, &modified), json!({"a": {"c": 3}}));
    }

    #[test]
    fn test_merge_patch_nulls_removed_keys() {
        let original = json!({"a": 1, "b": 2});
        let modified = json!({"a": 1});
        assert_eq!(merge_patch(&original, &modified), json!({"b": null}));
    }

    #[test]
    fn test_merge_patch_replaces_arrays_wholesale() {
        let original = json!({"list": [1, 2]});
        let modified = json!({"list": [1, 2, 3]});
        assert_eq!(
            merge_patch(&original, &modified),
            json!({"list": [1, 2, 3]})
        );
    }

    #[test]
    fn test_merge_patch_identical_is_empty() {
        let value = serde_json::to_value(pod_fixture("100m")).unwrap();
        assert_eq!(merge_patch(&value, &value), json!({}));
    }

    #[test]
    fn test_prepare_folds_outcomes() {
        let noop: PodMutation = Arc::new(|_pod: &mut Pod| {
            Ok(MutationOutcome {
                should_patch: false,
                wait_predicate: None,
            })
        });
        let active: PodMutation = Arc::new(|pod: &mut Pod| {
            pod.metadata
                .annotations
                .get_or_insert_with(Default::default)
                .insert("k".to_string(), "v".to_string());
            Ok(MutationOutcome {
                should_patch: true,
                wait_predicate: Some(Arc::new(|_| true)),
            })
        });

        let pod = pod_fixture("100m");
        let prepared = prepare(&pod, &[noop.clone(), active]).unwrap();
        assert!(prepared.should_patch);
        assert_eq!(prepared.predicates.len(), 1);
        assert!(prepared
            .mutated
            .metadata
            .annotations
            .as_ref()
            .unwrap()
            .contains_key("k"));
        // Original untouched
        assert!(pod.metadata.annotations.is_none());

        let prepared = prepare(&pod, &[noop]).unwrap();
        assert!(!prepared.should_patch);
    }

    #[test]
    fn test_prepare_wraps_mutation_errors_with_context() {
        let failing: PodMutation =
            Arc::new(|_pod: &mut Pod| Err(Error::ContainerNotPresent("ghost".to_string())));
        let err = prepare(&pod_fixture("100m"), &[failing]).unwrap_err();
        // The error class survives for classification; the message gains the
        // mutation-layer context.
        assert!(matches!(&err, Error::ContainerNotPresent(m) if m.starts_with("unable to mutate pod: ")));
    }

    #[tokio::test]
    async fn test_wait_returns_pod_once_predicates_hold() {
        let publisher = PodEventPublisher::new();
        let (_id, rx) = publisher.subscribe("default", "test", &[PodEventType::Update]);

        let predicate: WaitPredicate = Arc::new(|pod: &Pod| {
            pod.spec.as_ref().unwrap().containers[0]
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()["cpu"]
                .0
                == "200m"
        });

        let predicates = vec![predicate];
        let waiter = tokio::spawn(async move {
            wait_for_cache_sync(rx, &predicates, Duration::from_secs(2), pod_fixture("100m")).await
        });

        // First event does not satisfy the predicate; second does.
        publisher.publish(PodEvent {
            event_type: PodEventType::Update,
            pod: Arc::new(pod_fixture("100m")),
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        publisher.publish(PodEvent {
            event_type: PodEventType::Update,
            pod: Arc::new(pod_fixture("200m")),
        });

        let observed = waiter.await.unwrap();
        assert_eq!(
            observed.spec.as_ref().unwrap().containers[0]
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()["cpu"]
                .0,
            "200m"
        );
    }

    #[tokio::test]
    async fn test_wait_times_out_to_fallback() {
        let publisher = PodEventPublisher::new();
        let (_id, rx) = publisher.subscribe("default", "test", &[PodEventType::Update]);
        let never: WaitPredicate = Arc::new(|_| false);

        let before = metrics::INFORMER_CACHE_SYNC_TIMEOUT_TOTAL.get();
        let observed = wait_for_cache_sync(
            rx,
            std::slice::from_ref(&never),
            Duration::from_millis(50),
            pod_fixture("100m"),
        )
        .await;
        assert_eq!(
            observed.spec.as_ref().unwrap().containers[0]
                .resources
                .as_ref()
                .unwrap()
                .requests
                .as_ref()
                .unwrap()["cpu"]
                .0,
            "100m"
        );
        assert!(metrics::INFORMER_CACHE_SYNC_TIMEOUT_TOTAL.get() > before);
    }

    #[test]
    fn test_retry_reason_classification() {
        let conflict = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        // Conflicts are handled by the re-read loop, not the backoff path.
        assert_eq!(retry_reason(&conflict), None);

        let unavailable = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "unavailable".to_string(),
            reason: "ServiceUnavailable".to_string(),
            code: 503,
        });
        assert_eq!(retry_reason(&unavailable), Some("server_error"));

        let not_found = kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        assert_eq!(retry_reason(&not_found), None);
    }

    #[test]
    fn test_subscription_guard_unsubscribes_on_drop() {
        let publisher = PodEventPublisher::new();
        let (id, _rx) = publisher.subscribe("default", "test", &[PodEventType::Update]);
        {
            let _guard = SubscriptionGuard::new(&publisher, id);
        }
        // A publish after the guard dropped reaches no subscriber; this only
        // checks it does not panic or block.
        publisher.publish(PodEvent {
            event_type: PodEventType::Update,
            pod: Arc::new(pod_fixture("100m")),
        });
    }
}
