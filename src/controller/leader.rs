//! Leader election using Kubernetes Leases
//!
//! Only one controller replica may talk to the registry at a time. The
//! `LeaseGate` campaigns for a `coordination.k8s.io/v1` Lease and runs the
//! supplied task while it holds it.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the Lease
//! changed in between, the API server answers 409 Conflict and the attempt
//! counts as "not acquired".

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::error::LeaderElectionError;

// Timing constants
const LEASE_DURATION: Duration = Duration::from_secs(30);
const RENEW_INTERVAL: Duration = Duration::from_secs(10);
const RENEW_DEADLINE: Duration = Duration::from_secs(20);
const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Runs a task on at most one replica at a time
#[async_trait]
pub trait LeadershipGate: Send + Sync {
    /// Campaign for `namespace/lock_name` until `shutdown` is cancelled.
    ///
    /// `on_acquire` is started each time leadership is gained. The token it
    /// receives is cancelled when leadership is lost or on shutdown, and the
    /// task is awaited before the gate campaigns again.
    async fn run_exclusive<F, Fut>(
        &self,
        shutdown: CancellationToken,
        namespace: &str,
        lock_name: &str,
        on_acquire: F,
    ) -> Result<(), LeaderElectionError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static;
}

/// What to do with the Lease as last read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseDecision {
    /// No Lease exists yet
    Create,
    /// We hold it
    Renew,
    /// Held by someone else but expired
    TakeOver { transitions: i32 },
    /// Held by someone else and still valid
    Wait,
}

/// Decide how to acquire or keep `lease` as `identity` at `now`
pub fn decide(lease: Option<&Lease>, identity: &str, now: DateTime<Utc>) -> LeaseDecision {
    let Some(lease) = lease else {
        return LeaseDecision::Create;
    };

    let spec = lease.spec.as_ref();
    let holder = spec.and_then(|s| s.holder_identity.as_deref());

    if holder == Some(identity) {
        return LeaseDecision::Renew;
    }

    let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);

    // A released Lease has no holder and can be taken immediately
    if holder.map(str::is_empty).unwrap_or(true) {
        return LeaseDecision::TakeOver { transitions };
    }

    let renew_time = spec.and_then(|s| s.renew_time.as_ref());
    let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
    let expired = match (renew_time, duration_secs) {
        (Some(rt), Some(duration)) => now > rt.0 + chrono::Duration::seconds(duration as i64),
        _ => true,
    };

    if expired {
        LeaseDecision::TakeOver { transitions }
    } else {
        LeaseDecision::Wait
    }
}

/// Holder identity for this replica: pod name plus a per-process suffix
pub fn leader_identity() -> String {
    let host = std::env::var("POD_NAME")
        .or_else(|_| std::env::var("HOSTNAME"))
        .unwrap_or_else(|_| "fides".to_string());

    format!("{}_{}", host, uuid::Uuid::new_v4())
}

/// Leadership gate backed by a Kubernetes Lease
pub struct LeaseGate {
    client: Client,
    identity: String,
    lease_duration: Duration,
    renew_interval: Duration,
    renew_deadline: Duration,
    retry_interval: Duration,
}

impl LeaseGate {
    /// Create a gate with default timing (30s lease, 10s renew, 5s retry)
    pub fn new(client: Client, identity: &str) -> Self {
        Self {
            client,
            identity: identity.to_string(),
            lease_duration: LEASE_DURATION,
            renew_interval: RENEW_INTERVAL,
            renew_deadline: RENEW_DEADLINE,
            retry_interval: RETRY_INTERVAL,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Retry until the Lease is ours. Returns false if shut down first.
    async fn campaign(
        &self,
        lock: &LeaseLock<'_>,
        shutdown: &CancellationToken,
    ) -> Result<bool, LeaderElectionError> {
        info!(identity = %self.identity, lease = %lock.name, "Waiting for leadership...");

        loop {
            match lock.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => return Ok(true),
                Ok(false) => debug!(
                    identity = %self.identity,
                    retry_secs = self.retry_interval.as_secs(),
                    "Lease held by another, waiting..."
                ),
                Err(e) => {
                    if let Some(forbidden) = lock.forbidden(&e) {
                        return Err(forbidden);
                    }
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = self.retry_interval.as_secs(),
                        "Failed to acquire lease, retrying..."
                    );
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return Ok(false),
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
    }

    /// Keep renewing until the Lease is lost or `shutdown` is cancelled
    async fn hold(&self, lock: &LeaseLock<'_>, shutdown: &CancellationToken) {
        let mut last_renew = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(self.renew_interval) => {}
            }

            match lock.try_acquire_or_renew(Utc::now()).await {
                Ok(true) => {
                    last_renew = Instant::now();
                }
                Ok(false) => {
                    warn!(identity = %self.identity, "Leadership lost");
                    return;
                }
                Err(e) if last_renew.elapsed() < self.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease, retrying");
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Renew deadline passed, leadership lost"
                    );
                    return;
                }
            }
        }
    }
}

#[async_trait]
impl LeadershipGate for LeaseGate {
    async fn run_exclusive<F, Fut>(
        &self,
        shutdown: CancellationToken,
        namespace: &str,
        lock_name: &str,
        on_acquire: F,
    ) -> Result<(), LeaderElectionError>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let lock = LeaseLock {
            api: Api::namespaced(self.client.clone(), namespace),
            namespace,
            name: lock_name,
            identity: &self.identity,
            lease_duration: self.lease_duration,
        };

        loop {
            if !self.campaign(&lock, &shutdown).await? {
                return Ok(());
            }

            info!(identity = %self.identity, "Leadership acquired");

            let term = shutdown.child_token();
            let task = tokio::spawn(on_acquire(term.clone()));

            self.hold(&lock, &shutdown).await;

            // Let an in-flight cycle finish before anyone else may start one
            term.cancel();
            if let Err(e) = task.await {
                warn!(identity = %self.identity, error = %e, "Leader task failed");
            }

            if shutdown.is_cancelled() {
                if let Err(e) = lock.release().await {
                    warn!(identity = %self.identity, error = %e, "Failed to release lease");
                }
                return Ok(());
            }
        }
    }
}

/// One Lease as seen by one candidate
struct LeaseLock<'a> {
    api: Api<Lease>,
    namespace: &'a str,
    name: &'a str,
    identity: &'a str,
    lease_duration: Duration,
}

impl LeaseLock<'_> {
    /// Try to acquire or renew the lease atomically
    async fn try_acquire_or_renew(&self, now: DateTime<Utc>) -> Result<bool, kube::Error> {
        let existing = self.api.get_opt(self.name).await?;

        let lease = match decide(existing.as_ref(), self.identity, now) {
            LeaseDecision::Wait => return Ok(false),
            LeaseDecision::Create => {
                let lease = self.lease(now, now, 0, None);
                return match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => {
                        info!(identity = %self.identity, "Created new lease");
                        Ok(true)
                    }
                    Err(kube::Error::Api(e)) if e.code == 409 => {
                        debug!(identity = %self.identity, "Lease creation conflict, will retry");
                        Ok(false)
                    }
                    Err(e) => Err(e),
                };
            }
            LeaseDecision::Renew => {
                let existing = existing.as_ref();
                let spec = existing.and_then(|l| l.spec.as_ref());
                let acquired = spec
                    .and_then(|s| s.acquire_time.as_ref())
                    .map(|t| t.0)
                    .unwrap_or(now);
                let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
                self.lease(
                    acquired,
                    now,
                    transitions,
                    existing.and_then(|l| l.metadata.resource_version.clone()),
                )
            }
            LeaseDecision::TakeOver { transitions } => self.lease(
                now,
                now,
                transitions + 1,
                existing.and_then(|l| l.metadata.resource_version),
            ),
        };

        match self
            .api
            .replace(self.name, &PostParams::default(), &lease)
            .await
        {
            Ok(_) => {
                debug!(identity = %self.identity, "Lease acquired or renewed");
                Ok(true)
            }
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(identity = %self.identity, "Lease update conflict");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn lease(
        &self,
        acquired: DateTime<Utc>,
        renewed: DateTime<Utc>,
        transitions: i32,
        resource_version: Option<String>,
    ) -> Lease {
        Lease {
            metadata: ObjectMeta {
                name: Some(self.name.to_string()),
                namespace: Some(self.namespace.to_string()),
                resource_version,
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.to_string()),
                lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                acquire_time: Some(MicroTime(acquired)),
                renew_time: Some(MicroTime(renewed)),
                lease_transitions: Some(transitions),
                ..Default::default()
            }),
        }
    }

    /// Clear the holder so a standby can take over without waiting for expiry
    async fn release(&self) -> Result<(), kube::Error> {
        let Some(lease) = self.api.get_opt(self.name).await? else {
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if holder != Some(self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let past = Utc::now() - chrono::Duration::seconds(60);
        let patch = json!({
            "metadata": {
                "resourceVersion": lease.metadata.resource_version
            },
            "spec": {
                "holderIdentity": null,
                "renewTime": MicroTime(past)
            }
        });

        self.api
            .patch(self.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        info!(identity = %self.identity, "Lease released");
        Ok(())
    }

    fn forbidden(&self, err: &kube::Error) -> Option<LeaderElectionError> {
        match err {
            kube::Error::Api(e) if e.code == 401 || e.code == 403 => {
                Some(LeaderElectionError::Forbidden {
                    namespace: self.namespace.to_string(),
                    name: self.name.to_string(),
                    message: e.message.clone(),
                })
            }
            _ => None,
        }
    }
}
