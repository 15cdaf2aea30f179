//! Process-level controller configuration.

use std::time::Duration;

/// Controller-wide settings, populated from CLI flags in `main`.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Gate for CPU scaling across all pods.
    pub cpu_scaling: bool,
    /// Gate for memory scaling across all pods.
    pub memory_scaling: bool,
    /// When true, a container whose spec matches neither triplet is treated
    /// as if it currently carried the post-startup triplet.
    pub scale_when_unknown_resources: bool,
    /// How long the patcher waits for the informer cache to reflect a patch.
    pub cache_sync_timeout: Duration,
    /// Namespace to watch; empty for all namespaces.
    pub namespace: String,
    /// How long a held leader lease stays valid without renewal.
    pub lease_duration: Duration,
    /// Interval between lease renewals while leading.
    pub lease_renew_interval: Duration,
    /// Interval between acquisition attempts while another instance leads.
    pub lease_retry_interval: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cpu_scaling: true,
            memory_scaling: true,
            scale_when_unknown_resources: false,
            cache_sync_timeout: Duration::from_secs(5),
            namespace: String::new(),
            lease_duration: Duration::from_secs(15),
            lease_renew_interval: Duration::from_secs(10),
            lease_retry_interval: Duration::from_secs(5),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert!(settings.cpu_scaling);
        assert!(settings.memory_scaling);
        assert!(!settings.scale_when_unknown_resources);
        assert_eq!(settings.cache_sync_timeout, Duration::from_secs(5));
        assert!(settings.namespace.is_empty());
        // Renewal must fit inside the lease duration with room for a retry.
        assert!(settings.lease_renew_interval < settings.lease_duration);
        assert!(settings.lease_retry_interval < settings.lease_duration);
    }
}
