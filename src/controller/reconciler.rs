//! Registration Reconciler
//!
//! Each cycle derives the registration state from the stored identity,
//! fetches fresh discovery metadata, then either registers the cluster
//! (unregistered) or refreshes its record (registered). Only a successful
//! registration writes to the identity store.
//!
//! Cycles run strictly one after another: the next tick is armed only once
//! the previous cycle has finished. Cancellation is observed between ticks;
//! a cycle that is already talking to the registry runs to completion.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::discovery::DiscoveryFetcher;
use super::error::{DiscoveryError, StoreError, SyncError};
use super::identity::{ClusterIdentity, IdentityStore};
use super::registry::Registry;
use crate::types::{ClusterNewRequest, ClusterPutRequest};

/// Registration state, derived from the store at the start of every cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistrationState {
    Unregistered,
    Registered,
}

impl RegistrationState {
    pub fn of(identity: &ClusterIdentity) -> Self {
        if identity.is_registered() {
            RegistrationState::Registered
        } else {
            RegistrationState::Unregistered
        }
    }
}

/// Deadline for each identity store and discovery call of a cycle
pub const KUBE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Immutable reconciler settings, fixed for the life of the process
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    /// Delay before the first cycle after leadership is acquired
    pub initial_delay: Duration,
    /// Delay between the end of one cycle and the start of the next
    pub interval: Duration,
    /// Display name sent on registration instead of the stored one
    pub cluster_name: Option<String>,
    /// Identity of an existing registration, used while the store has none
    pub seeded_identity: Option<ClusterIdentity>,
    /// Base of the issuer URLs suggested when the registry cannot verify us
    pub issuer_base_url: String,
    /// Deadline for each identity store and discovery call
    pub call_timeout: Duration,
}

/// What a successful cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Registered {
        cluster_id: String,
        cluster_name: String,
    },
    Updated {
        cluster_id: String,
        verified: bool,
    },
}

/// Summary of the last finished cycle, published for the status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub cycle: u64,
    pub outcome: &'static str,
    pub cluster_id: Option<String>,
    pub verified: Option<bool>,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl CycleReport {
    fn new(cycle: u64, result: &Result<CycleOutcome, SyncError>) -> Self {
        let (outcome, cluster_id, verified, error) = match result {
            Ok(CycleOutcome::Registered { cluster_id, .. }) => {
                ("registered", Some(cluster_id.clone()), None, None)
            }
            Ok(CycleOutcome::Updated {
                cluster_id,
                verified,
            }) => ("updated", Some(cluster_id.clone()), Some(*verified), None),
            Err(e) => ("failed", None, None, Some(e.to_string())),
        };

        Self {
            cycle,
            outcome,
            cluster_id,
            verified,
            error,
            finished_at: Utc::now(),
        }
    }
}

/// Keeps this cluster's registry record in step with its issuer metadata
pub struct Reconciler {
    settings: ReconcilerSettings,
    store: Arc<dyn IdentityStore>,
    discovery: Arc<dyn DiscoveryFetcher>,
    registry: Arc<dyn Registry>,
    reports: watch::Sender<Option<CycleReport>>,
}

impl Reconciler {
    pub fn new(
        settings: ReconcilerSettings,
        store: Arc<dyn IdentityStore>,
        discovery: Arc<dyn DiscoveryFetcher>,
        registry: Arc<dyn Registry>,
    ) -> Self {
        let (reports, _) = watch::channel(None);

        Self {
            settings,
            store,
            discovery,
            registry,
            reports,
        }
    }

    /// Receiver for the report of each finished cycle
    pub fn subscribe(&self) -> watch::Receiver<Option<CycleReport>> {
        self.reports.subscribe()
    }

    /// Run cycles until `shutdown` is cancelled
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(
            initial_delay_secs = self.settings.initial_delay.as_secs_f64(),
            interval_secs = self.settings.interval.as_secs(),
            "Started sync loop"
        );

        let mut delay = self.settings.initial_delay;
        let mut cycle: u64 = 0;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(cycles = cycle, "Sync loop stopped");
                    return;
                }
                _ = tokio::time::sleep(delay) => {}
            }

            cycle += 1;
            self.reconcile(cycle).await;
            delay = self.settings.interval;
        }
    }

    /// Run one cycle, log its result, and publish a report
    pub async fn reconcile(&self, cycle: u64) -> CycleReport {
        info!(cycle, "Running sync cycle");

        let result = self.cycle().await;

        match &result {
            Ok(CycleOutcome::Registered {
                cluster_id,
                cluster_name,
            }) => info!(
                cycle,
                cluster_id = %cluster_id,
                cluster_name = %cluster_name,
                "Cluster registered and identity stored"
            ),
            Ok(CycleOutcome::Updated {
                cluster_id,
                verified,
            }) => info!(cycle, cluster_id = %cluster_id, verified, "Cluster updated"),
            Err(e @ SyncError::AlreadyRegistered) => error!(
                cycle,
                error = %e,
                "Registry already holds this cluster; restore the identity secret or pass --cluster-id and --cluster-key"
            ),
            Err(e @ SyncError::Desynchronized { .. }) => error!(
                cycle,
                error = %e,
                "Local identity is behind the registry; operator intervention required"
            ),
            Err(e) => warn!(cycle, error = %e, "Unable to perform sync"),
        }

        let report = CycleReport::new(cycle, &result);
        self.reports.send_replace(Some(report.clone()));
        report
    }

    /// One pass: read identity, fetch discovery, register or update
    pub async fn cycle(&self) -> Result<CycleOutcome, SyncError> {
        let stored = self
            .with_deadline(self.store.get(), StoreError::Timeout)
            .await?;
        let identity = self.effective_identity(stored.identity);
        let state = RegistrationState::of(&identity);

        info!(
            cluster_id = %identity.cluster_id,
            cluster_name = %identity.cluster_name,
            state = ?state,
            "Cluster information"
        );

        let discovery = self
            .with_deadline(self.discovery.fetch(), DiscoveryError::Timeout)
            .await?;

        match state {
            RegistrationState::Unregistered => {
                let name = self
                    .settings
                    .cluster_name
                    .clone()
                    .unwrap_or(identity.cluster_name);

                let request = ClusterNewRequest {
                    name,
                    uid: discovery.cluster_uid,
                    oid_config: discovery.openid_configuration,
                    jwks: discovery.jwks,
                };

                let response = self.registry.register(&request).await?;
                let registered = ClusterIdentity {
                    cluster_id: response.uid,
                    cluster_key: response.token,
                    cluster_name: response.name,
                };

                let written = self.with_deadline(
                    self.store.set(&registered, stored.revision.as_deref()),
                    StoreError::Timeout,
                );

                match written.await {
                    Ok(()) => Ok(CycleOutcome::Registered {
                        cluster_id: registered.cluster_id,
                        cluster_name: registered.cluster_name,
                    }),
                    Err(StoreError::Conflict { name }) => {
                        warn!(
                            record = %name,
                            "Identity record changed while registering; not overwriting"
                        );
                        Err(SyncError::AlreadyRegistered)
                    }
                    Err(source) => Err(SyncError::Desynchronized {
                        cluster_id: registered.cluster_id,
                        source,
                    }),
                }
            }
            RegistrationState::Registered => {
                let request = ClusterPutRequest {
                    uid: discovery.cluster_uid,
                    oid_config: discovery.openid_configuration,
                    jwks: discovery.jwks,
                };

                let response = self
                    .registry
                    .update(&identity.cluster_id, &identity.cluster_key, &request)
                    .await?;

                if !response.verified {
                    self.warn_unverified(&identity.cluster_id);
                }

                Ok(CycleOutcome::Updated {
                    cluster_id: identity.cluster_id,
                    verified: response.verified,
                })
            }
        }
    }

    async fn with_deadline<T, E>(
        &self,
        call: impl Future<Output = Result<T, E>>,
        timed_out: fn(Duration) -> E,
    ) -> Result<T, E> {
        let limit = self.settings.call_timeout;
        tokio::time::timeout(limit, call)
            .await
            .unwrap_or_else(|_| Err(timed_out(limit)))
    }

    /// Stored identity, or the seeded one while nothing usable is stored
    fn effective_identity(&self, stored: ClusterIdentity) -> ClusterIdentity {
        match &self.settings.seeded_identity {
            Some(seeded) if !stored.is_registered() && seeded.is_registered() => {
                info!(cluster_id = %seeded.cluster_id, "Using pre-seeded cluster identity");
                seeded.clone()
            }
            _ => stored,
        }
    }

    fn warn_unverified(&self, cluster_id: &str) {
        warn!(cluster_id = %cluster_id, "Cluster is not verified");
        warn!("To verify your cluster, add the following arguments to your kube-apiserver");
        for flag in verification_flags(&self.settings.issuer_base_url, cluster_id) {
            warn!("{}", flag);
        }
    }
}

/// kube-apiserver flags that publish the issuer where the registry expects it
pub fn verification_flags(issuer_base_url: &str, cluster_id: &str) -> [String; 2] {
    let base = issuer_base_url.trim_end_matches('/');
    [
        format!("--service-account-issuer={}/c/{}", base, cluster_id),
        format!("--service-account-jwks-uri={}/c/{}/jwks", base, cluster_id),
    ]
}
