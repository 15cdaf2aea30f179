//! Prometheus metrics for the startup-scaler operator.

use once_cell::sync::Lazy;
use prometheus::{
    register_counter, register_counter_vec, register_int_gauge, Counter, CounterVec, Encoder,
    IntGauge, TextEncoder,
};

/// Kubernetes API retries by classified reason.
pub static KUBE_API_RETRY_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "startup_scaler_kube_api_retry_total",
        "Kubernetes API retries by classified reason",
        &["reason"]
    )
    .unwrap()
});

/// Timeouts waiting for the informer cache to reflect a patch.
pub static INFORMER_CACHE_SYNC_TIMEOUT_TOTAL: Lazy<Counter> = Lazy::new(|| {
    register_counter!(
        "startup_scaler_informer_cache_sync_timeout_total",
        "Timeouts waiting for the informer cache to reflect a patch"
    )
    .unwrap()
});

/// Reconcile failures by error kind.
pub static RECONCILE_FAILURE_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "startup_scaler_reconcile_failure_total",
        "Reconcile failures by error kind",
        &["kind"]
    )
    .unwrap()
});

/// Actions chosen by the reconciliation engine.
pub static ENGINE_ACTION_TOTAL: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        "startup_scaler_engine_action_total",
        "Actions chosen by the reconciliation engine",
        &["action"]
    )
    .unwrap()
});

/// Whether this instance currently holds the leader lease (1 or 0).
pub static LEADER: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "startup_scaler_leader",
        "Whether this instance currently holds the leader lease"
    )
    .unwrap()
});

/// Renders the process-wide registry in the Prometheus text format.
pub fn render() -> String {
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_render() {
        KUBE_API_RETRY_TOTAL.with_label_values(&["conflict"]).inc();
        INFORMER_CACHE_SYNC_TIMEOUT_TOTAL.inc();
        RECONCILE_FAILURE_TOTAL.with_label_values(&["validation"]).inc();
        ENGINE_ACTION_TOTAL
            .with_label_values(&["startup_commanded"])
            .inc();
        LEADER.set(1);

        let rendered = render();
        assert!(rendered.contains("startup_scaler_kube_api_retry_total"));
        assert!(rendered.contains("startup_scaler_informer_cache_sync_timeout_total"));
        assert!(rendered.contains("startup_scaler_reconcile_failure_total"));
        assert!(rendered.contains("startup_scaler_engine_action_total"));
        assert!(rendered.contains("startup_scaler_leader 1"));
    }
}
