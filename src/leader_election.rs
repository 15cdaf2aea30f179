//! Kubernetes Lease-based leader election for HA deployments.
//!
//! Replicas contend for a single `coordination.k8s.io/v1` Lease; only the
//! holder runs the controller and watch tasks, and the others block in
//! [`LeaderElector::acquire`] until the current lease expires. Every write
//! goes through `replace` so the apiserver's `resourceVersion` check
//! arbitrates races: a 409 means another instance won the claim.

use crate::error::{Error, Result};
use crate::metrics;
use crate::settings::Settings;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const LEASE_NAME: &str = "startup-scaler-leader";

/// How a lease write claims (or surrenders) leadership.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Claim {
    /// Same holder re-stamping the renew time; acquire time is preserved.
    Renew,
    /// The previous holder's lease expired; transitions increment.
    Takeover,
    /// Clear the holder so a standby can claim without waiting for expiry.
    Release,
}

/// Detects the namespace for leader election.
///
/// Priority: explicit argument → service account file → `"default"`.
pub fn detect_namespace(explicit: &str) -> String {
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    std::fs::read_to_string("/var/run/secrets/kubernetes.io/serviceaccount/namespace")
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|_| "default".to_string())
}

/// Contends for the leader lease with the timings configured in
/// [`Settings`], and mirrors the outcome into the `startup_scaler_leader`
/// gauge.
pub struct LeaderElector {
    lease_api: Api<Lease>,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    retry_interval: Duration,
}

impl LeaderElector {
    pub fn new(client: Client, namespace: &str, settings: &Settings) -> Self {
        let lease_api = Api::<Lease>::namespaced(client, namespace);
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("startup-scaler-{:08x}", rand::random::<u32>()));
        info!(identity = %identity, namespace = %namespace, "Initialized leader elector");
        Self {
            lease_api,
            identity,
            lease_duration: settings.lease_duration,
            renew_interval: settings.lease_renew_interval,
            retry_interval: settings.lease_retry_interval,
        }
    }

    /// Blocks until the lease is successfully acquired.
    pub async fn acquire(&self) -> Result<()> {
        info!(identity = %self.identity, "Waiting to acquire leader lease '{}'", LEASE_NAME);
        loop {
            match self.try_acquire().await {
                Ok(true) => {
                    metrics::LEADER.set(1);
                    info!(identity = %self.identity, "Acquired leader lease");
                    return Ok(());
                }
                Ok(false) => {
                    debug!(
                        "Lease held by another instance, retrying in {:?}",
                        self.retry_interval
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
                Err(e) => {
                    warn!(
                        "Lease acquisition error: {}, retrying in {:?}",
                        e, self.retry_interval
                    );
                    tokio::time::sleep(self.retry_interval).await;
                }
            }
        }
    }

    /// Renews the lease. Returns `Ok(true)` if still leader, `Ok(false)` if
    /// leadership was lost to another instance or the lease disappeared.
    pub async fn renew(&self) -> Result<bool> {
        let still_leader = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) if self.holds(&lease) => self.write(&lease, Claim::Renew).await?,
            Ok(_) => false,
            Err(kube::Error::Api(ae)) if ae.code == 404 => false,
            Err(e) => return Err(Error::from(e).context("unable to renew leader lease")),
        };
        if still_leader {
            debug!("Renewed leader lease");
        } else {
            metrics::LEADER.set(0);
            warn!(identity = %self.identity, "Leader lease lost");
        }
        Ok(still_leader)
    }

    /// Releases the lease by clearing the holder identity. Best-effort: on
    /// failure the lease simply expires on its own.
    pub async fn release(&self) {
        info!(identity = %self.identity, "Releasing leader lease");
        let result = match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) if self.holds(&lease) => self.write(&lease, Claim::Release).await,
            Ok(_) => Ok(false),
            Err(e) => Err(Error::from(e)),
        };
        metrics::LEADER.set(0);
        match result {
            Ok(true) => info!("Released leader lease"),
            Ok(false) => debug!("Lease not held by this instance, nothing to release"),
            Err(e) => warn!("Failed to release leader lease: {}", e),
        }
    }

    /// Returns the configured interval between lease renewals.
    pub fn renew_interval(&self) -> Duration {
        self.renew_interval
    }

    async fn try_acquire(&self) -> Result<bool> {
        match self.lease_api.get(LEASE_NAME).await {
            Ok(lease) if self.holds(&lease) => self.write(&lease, Claim::Renew).await,
            Ok(lease) if is_expired(lease.spec.as_ref(), self.lease_duration) => {
                self.write(&lease, Claim::Takeover).await
            }
            Ok(_) => Ok(false),
            Err(kube::Error::Api(ae)) if ae.code == 404 => self.create().await,
            Err(e) => Err(Error::from(e).context("unable to read leader lease")),
        }
    }

    fn holds(&self, lease: &Lease) -> bool {
        lease
            .spec
            .as_ref()
            .and_then(|s| s.holder_identity.as_deref())
            == Some(self.identity.as_str())
    }

    /// Replaces the lease with our claim; a 409 means another instance won.
    async fn write(&self, existing: &Lease, claim: Claim) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let mut updated = existing.clone();
        updated.spec = Some(desired_spec(
            &self.identity,
            self.lease_duration,
            existing.spec.as_ref(),
            claim,
            &now,
        ));
        match self
            .lease_api
            .replace(LEASE_NAME, &PostParams::default(), &updated)
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(Error::from(e).context("unable to write leader lease")),
        }
    }

    async fn create(&self) -> Result<bool> {
        let now = MicroTime(Utc::now());
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(LEASE_NAME.to_string()),
                ..Default::default()
            },
            spec: Some(desired_spec(
                &self.identity,
                self.lease_duration,
                None,
                Claim::Takeover,
                &now,
            )),
        };
        match self.lease_api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
            Err(e) => Err(Error::from(e).context("unable to create leader lease")),
        }
    }
}

/// The lease spec a claim should persist, derived from the previous spec.
fn desired_spec(
    identity: &str,
    lease_duration: Duration,
    prev: Option<&LeaseSpec>,
    claim: Claim,
    now: &MicroTime,
) -> LeaseSpec {
    let duration_secs = lease_duration.as_secs() as i32;
    let transitions = prev.and_then(|s| s.lease_transitions).unwrap_or(0);
    match claim {
        Claim::Renew => LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(duration_secs),
            acquire_time: prev
                .and_then(|s| s.acquire_time.clone())
                .or_else(|| Some(now.clone())),
            renew_time: Some(now.clone()),
            lease_transitions: Some(transitions),
            preferred_holder: None,
            strategy: None,
        },
        Claim::Takeover => LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(duration_secs),
            acquire_time: Some(now.clone()),
            renew_time: Some(now.clone()),
            lease_transitions: Some(if prev.is_some() { transitions + 1 } else { 0 }),
            preferred_holder: None,
            strategy: None,
        },
        Claim::Release => LeaseSpec {
            holder_identity: None,
            lease_duration_seconds: Some(duration_secs),
            acquire_time: prev.and_then(|s| s.acquire_time.clone()),
            renew_time: prev.and_then(|s| s.renew_time.clone()),
            lease_transitions: Some(transitions),
            preferred_holder: None,
            strategy: None,
        },
    }
}

/// A lease with no renew time is expired; otherwise the lease's own duration
/// governs, falling back to the configured one.
fn is_expired(spec: Option<&LeaseSpec>, default_duration: Duration) -> bool {
    let duration_secs = spec
        .and_then(|s| s.lease_duration_seconds)
        .map(|s| s as i64)
        .unwrap_or(default_duration.as_secs() as i64);
    match spec.and_then(|s| s.renew_time.as_ref()) {
        Some(MicroTime(t)) => Utc::now().signed_duration_since(*t).num_seconds() > duration_secs,
        None => true,
    }
}
