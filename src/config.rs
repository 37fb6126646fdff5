//! Controller configuration
//!
//! Flags are parsed once at startup and validated into an immutable
//! `ControllerConfig`. Nothing learned while running is written back.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Args;
use reqwest::Url;
use thiserror::Error;

use crate::controller::{ClusterIdentity, ReconcilerSettings, KUBE_CALL_TIMEOUT};

pub const DEFAULT_NAMESPACE: &str = "fides-system";
pub const DEFAULT_SECRET_NAME: &str = "fides";
pub const DEFAULT_LOCK_NAME: &str = "fides-controller";
pub const DEFAULT_BASE_URL: &str = "https://fides.ekristen.dev";
pub const DEFAULT_ISSUER_BASE_URL: &str = "https://oidc.fides.ekristen.dev";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("you must agree to the terms of service to use this, you can do this with --agree-tos")]
    TermsNotAccepted,

    #[error("invalid {flag} {value:?}: {reason}")]
    InvalidUrl {
        flag: &'static str,
        value: String,
        reason: String,
    },

    #[error("--interval must be greater than zero")]
    InvalidInterval,

    #[error("--cluster-id and --cluster-key must be given together")]
    IncompleteSeed,
}

/// Flags of `fides controller`
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Agree to the Terms of Service https://fides.ekristen.dev/terms
    #[arg(long, env = "FIDES_AGREE_TOS")]
    pub agree_tos: bool,

    /// Namespace for fides
    #[arg(long, env = "FIDES_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// Custom name for the fides secret
    #[arg(long, env = "FIDES_SECRET_NAME", default_value = DEFAULT_SECRET_NAME)]
    pub secret_name: String,

    /// Name of the leader election lease
    #[arg(long, env = "FIDES_LOCK_NAME", default_value = DEFAULT_LOCK_NAME, hide = true)]
    pub lock_name: String,

    /// Base URL of the fides registry
    #[arg(long, env = "FIDES_BASE_URL", default_value = DEFAULT_BASE_URL, hide = true)]
    pub base_url: String,

    /// Base URL of the published issuers
    #[arg(long, env = "FIDES_ISSUER_BASE_URL", default_value = DEFAULT_ISSUER_BASE_URL, hide = true)]
    pub issuer_base_url: String,

    /// Shared secret of an existing registration
    #[arg(long, env = "FIDES_CLUSTER_KEY", hide_env_values = true)]
    pub cluster_key: Option<String>,

    /// Display name used when registering
    #[arg(long, env = "FIDES_CLUSTER_NAME")]
    pub cluster_name: Option<String>,

    /// Cluster id of an existing registration
    #[arg(long, env = "FIDES_CLUSTER_ID", alias = "cluster-uid")]
    pub cluster_id: Option<String>,

    /// Path to a kubeconfig; in-cluster configuration is used when unset
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<PathBuf>,

    /// Address of the status server
    #[arg(long, env = "FIDES_METRICS_ADDRESS", default_value = "0.0.0.0:9997")]
    pub metrics_address: SocketAddr,

    /// Seconds before the first sync after becoming leader
    #[arg(long, env = "FIDES_INITIAL_DELAY", default_value = "1")]
    pub initial_delay: u64,

    /// Seconds between syncs
    #[arg(long, env = "FIDES_INTERVAL", default_value = "900")]
    pub interval: u64,
}

/// Validated, immutable controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub namespace: String,
    pub secret_name: String,
    pub lock_name: String,
    pub base_url: String,
    pub issuer_base_url: String,
    pub kubeconfig: Option<PathBuf>,
    pub metrics_address: SocketAddr,
    pub cluster_name: Option<String>,
    pub seeded_identity: Option<ClusterIdentity>,
    pub initial_delay: Duration,
    pub interval: Duration,
}

impl ControllerConfig {
    pub fn from_args(args: ControllerArgs) -> Result<Self, ConfigError> {
        if !args.agree_tos {
            return Err(ConfigError::TermsNotAccepted);
        }

        if args.interval == 0 {
            return Err(ConfigError::InvalidInterval);
        }

        let base_url = validate_url("--base-url", &args.base_url)?;
        let issuer_base_url = validate_url("--issuer-base-url", &args.issuer_base_url)?;

        let cluster_id = non_empty(args.cluster_id);
        let cluster_key = non_empty(args.cluster_key);
        let cluster_name = non_empty(args.cluster_name);

        let seeded_identity = match (cluster_id, cluster_key) {
            (Some(cluster_id), Some(cluster_key)) => Some(ClusterIdentity {
                cluster_id,
                cluster_key,
                cluster_name: cluster_name.clone().unwrap_or_default(),
            }),
            (None, None) => None,
            _ => return Err(ConfigError::IncompleteSeed),
        };

        Ok(Self {
            namespace: args.namespace,
            secret_name: args.secret_name,
            lock_name: args.lock_name,
            base_url,
            issuer_base_url,
            kubeconfig: args.kubeconfig,
            metrics_address: args.metrics_address,
            cluster_name,
            seeded_identity,
            initial_delay: Duration::from_secs(args.initial_delay),
            interval: Duration::from_secs(args.interval),
        })
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            initial_delay: self.initial_delay,
            interval: self.interval,
            cluster_name: self.cluster_name.clone(),
            seeded_identity: self.seeded_identity.clone(),
            issuer_base_url: self.issuer_base_url.clone(),
            call_timeout: KUBE_CALL_TIMEOUT,
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Accept absolute http(s) URLs; returned without a trailing slash
fn validate_url(flag: &'static str, value: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        flag,
        value: value.to_string(),
        reason,
    };

    let url = Url::parse(value).map_err(|e| invalid(e.to_string()))?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(invalid(format!("unsupported scheme {}", url.scheme())));
    }

    Ok(value.trim_end_matches('/').to_string())
}
