//! Cluster registration controller
//!
//! Wires the identity store, the discovery fetcher and the registry client
//! into a [`Reconciler`], and runs it only while this replica holds the
//! leader Lease.

mod discovery;
mod error;
mod identity;
mod leader;
mod reconciler;
mod registry;

use std::sync::Arc;

use anyhow::{Context, Result};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

pub use discovery::{
    parse_discovery, ClusterDiscovery, DiscoveryFetcher, KubeDiscoveryFetcher, JWKS_PATH,
    OPENID_CONFIGURATION_PATH,
};
pub use error::{DiscoveryError, LeaderElectionError, RegistryError, StoreError, SyncError};
pub use identity::{
    identity_from_data, identity_secret, ClusterIdentity, IdentityStore, SecretIdentityStore,
    StoredIdentity, QUICKSTART_KEY,
};
pub use leader::{decide, leader_identity, LeaseDecision, LeaseGate, LeadershipGate};
pub use reconciler::{
    verification_flags, CycleOutcome, CycleReport, Reconciler, ReconcilerSettings,
    RegistrationState, KUBE_CALL_TIMEOUT,
};
pub use registry::{Registry, RegistryClient};

use crate::config::ControllerConfig;
use crate::health;
use crate::version::AppVersion;

/// Run the controller until `shutdown` is cancelled
pub async fn run(config: ControllerConfig, shutdown: CancellationToken) -> Result<()> {
    let version = AppVersion::current();
    info!(
        version = %version.summary,
        namespace = %config.namespace,
        secret = %config.secret_name,
        registry = %config.base_url,
        "Starting fides controller"
    );

    let client = kube_client(&config).await?;

    let store = Arc::new(SecretIdentityStore::new(
        client.clone(),
        &config.namespace,
        &config.secret_name,
    ));
    let discovery = Arc::new(KubeDiscoveryFetcher::new(client.clone()));
    let registry = Arc::new(
        RegistryClient::new(&config.base_url, &version.user_agent())
            .context("Failed to create registry client")?,
    );

    let reconciler = Arc::new(Reconciler::new(
        config.reconciler_settings(),
        store,
        discovery,
        registry,
    ));

    let status_server = tokio::spawn(health::serve(
        config.metrics_address,
        reconciler.subscribe(),
        shutdown.clone(),
    ));

    let gate = LeaseGate::new(client, &leader_identity());
    info!(identity = %gate.identity(), lease = %config.lock_name, "Leader election configured");

    let elected = gate
        .run_exclusive(
            shutdown.clone(),
            &config.namespace,
            &config.lock_name,
            move |term| {
                let reconciler = reconciler.clone();
                async move { reconciler.run(term).await }
            },
        )
        .await;

    // Leader election can fail without a shutdown; stop the status server too
    shutdown.cancel();
    match status_server.await {
        Ok(Err(e)) => error!(error = %e, "Status server failed"),
        Err(e) => error!(error = %e, "Status server task panicked"),
        Ok(Ok(())) => {}
    }

    elected.context("Leader election failed")?;

    info!("Controller stopped");
    Ok(())
}

async fn kube_client(config: &ControllerConfig) -> Result<Client> {
    let mut kube_config = match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .with_context(|| format!("Failed to read kubeconfig {}", path.display()))?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .context("Failed to load kubeconfig")?
        }
        None => Config::infer()
            .await
            .context("Failed to infer Kubernetes configuration")?,
    };

    kube_config.connect_timeout = Some(KUBE_CALL_TIMEOUT);
    kube_config.read_timeout = Some(KUBE_CALL_TIMEOUT);

    Client::try_from(kube_config).context("Failed to create Kubernetes client")
}
