//! Controller error types

use std::time::Duration;

use thiserror::Error;

/// Failure to read the cluster's discovery metadata from the cluster API
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("failed to request {path}: {source}")]
    Request {
        path: &'static str,
        #[source]
        source: kube::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Decode {
        path: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("namespace {0} has no uid")]
    MissingUid(&'static str),

    #[error("discovery did not complete within {0:?}")]
    Timeout(Duration),
}

/// Failure talking to the fides registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// 409 on register: the registry already holds a record for this cluster
    #[error("cluster already exists in the registry")]
    AlreadyRegistered,

    #[error("registry returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("registry request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("failed to parse registry response: {0}")]
    Decode(#[from] serde_json::Error),

    /// 201 without the token or cluster id needed to store an identity
    #[error("registry accepted the registration but returned no token or cluster id")]
    IncompleteRegistration,
}

/// Failure reading or writing the persisted cluster identity
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The record changed between read and write
    #[error("identity record {name} was modified concurrently")]
    Conflict { name: String },

    #[error("identity record field {field} is not valid UTF-8")]
    Decode { field: &'static str },

    #[error("identity record call did not complete within {0:?}")]
    Timeout(Duration),
}

/// Outcome of a failed reconciliation cycle
///
/// Every variant ends the current cycle only; the next tick starts fresh
/// from the persisted record.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("unable to fetch discovery metadata: {0}")]
    Fetch(#[from] DiscoveryError),

    #[error("cluster already registered but no usable identity is stored locally")]
    AlreadyRegistered,

    #[error("registry call failed: {0}")]
    Registry(RegistryError),

    #[error("identity record unavailable: {0}")]
    Persistence(#[from] StoreError),

    /// The registry accepted the registration but the returned identity
    /// could not be stored; local and remote state now disagree.
    #[error("cluster {cluster_id} was registered but its identity could not be stored: {source}")]
    Desynchronized {
        cluster_id: String,
        #[source]
        source: StoreError,
    },
}

impl From<RegistryError> for SyncError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::AlreadyRegistered => SyncError::AlreadyRegistered,
            other => SyncError::Registry(other),
        }
    }
}

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The controller may not read or write its Lease
    #[error("not permitted to manage lease {namespace}/{name}: {message}")]
    Forbidden {
        namespace: String,
        name: String,
        message: String,
    },
}
