//! Discovery Fetcher
//!
//! Reads the service-account issuer metadata from the local API server:
//! the OIDC discovery document, the signing key set, and the cluster UID
//! (the UID of the `kube-system` namespace).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Namespace;
use kube::{Api, Client};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::error::DiscoveryError;
use crate::types::{Jwks, OpenIdConfiguration};

pub const OPENID_CONFIGURATION_PATH: &str = "/.well-known/openid-configuration";
pub const JWKS_PATH: &str = "/openid/v1/jwks";
pub const CLUSTER_UID_NAMESPACE: &str = "kube-system";

/// Snapshot of the cluster's issuer metadata, fetched fresh every cycle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterDiscovery {
    pub cluster_uid: String,
    pub openid_configuration: OpenIdConfiguration,
    pub jwks: Jwks,
}

/// Source of the cluster's issuer metadata
#[async_trait]
pub trait DiscoveryFetcher: Send + Sync {
    async fn fetch(&self) -> Result<ClusterDiscovery, DiscoveryError>;
}

/// Fetches issuer metadata through the Kubernetes API client
pub struct KubeDiscoveryFetcher {
    client: Client,
}

impl KubeDiscoveryFetcher {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get_raw(&self, path: &'static str) -> Result<String, DiscoveryError> {
        let request = http::Request::get(path)
            .body(Vec::new())
            .map_err(|e| DiscoveryError::Request {
                path,
                source: kube::Error::HttpError(e),
            })?;

        self.client
            .request_text(request)
            .await
            .map_err(|source| DiscoveryError::Request { path, source })
    }

    async fn cluster_uid(&self) -> Result<String, DiscoveryError> {
        let namespaces: Api<Namespace> = Api::all(self.client.clone());
        let namespace = namespaces
            .get(CLUSTER_UID_NAMESPACE)
            .await
            .map_err(|source| DiscoveryError::Request {
                path: "/api/v1/namespaces/kube-system",
                source,
            })?;

        namespace
            .metadata
            .uid
            .ok_or(DiscoveryError::MissingUid(CLUSTER_UID_NAMESPACE))
    }
}

#[async_trait]
impl DiscoveryFetcher for KubeDiscoveryFetcher {
    async fn fetch(&self) -> Result<ClusterDiscovery, DiscoveryError> {
        let cluster_uid = self.cluster_uid().await?;
        let configuration = self.get_raw(OPENID_CONFIGURATION_PATH).await?;
        let jwks = self.get_raw(JWKS_PATH).await?;

        let discovery = parse_discovery(cluster_uid, &configuration, &jwks)?;

        debug!(
            issuer = %discovery.openid_configuration.issuer,
            keys = discovery.jwks.keys.len(),
            "Fetched cluster discovery metadata"
        );

        Ok(discovery)
    }
}

/// Decode both payloads; nothing is returned unless both parse
pub fn parse_discovery(
    cluster_uid: String,
    configuration: &str,
    jwks: &str,
) -> Result<ClusterDiscovery, DiscoveryError> {
    Ok(ClusterDiscovery {
        cluster_uid,
        openid_configuration: decode(OPENID_CONFIGURATION_PATH, configuration)?,
        jwks: decode(JWKS_PATH, jwks)?,
    })
}

fn decode<T: DeserializeOwned>(path: &'static str, raw: &str) -> Result<T, DiscoveryError> {
    serde_json::from_str(raw).map_err(|source| DiscoveryError::Decode { path, source })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{"issuer":"https://c.example","jwks_uri":"https://c.example/jwks","response_types_supported":["id_token"],"subject_types_supported":["public"],"id_token_signing_alg_values_supported":["RS256"]}"#;

    #[test]
    fn test_parse_discovery() {
        let discovery = parse_discovery("uid-1".to_string(), CONFIG, r#"{"keys":[]}"#).unwrap();

        assert_eq!(discovery.cluster_uid, "uid-1");
        assert_eq!(discovery.openid_configuration.issuer, "https://c.example");
        assert_eq!(discovery.openid_configuration.jwks_uri, "https://c.example/jwks");
        assert!(discovery.jwks.keys.is_empty());
    }

    #[test]
    fn test_malformed_configuration_names_path() {
        let err = parse_discovery("uid-1".to_string(), "<html>", r#"{"keys":[]}"#).unwrap_err();

        match err {
            DiscoveryError::Decode { path, .. } => assert_eq!(path, OPENID_CONFIGURATION_PATH),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_jwks_names_path() {
        let err = parse_discovery("uid-1".to_string(), CONFIG, r#"{"keys":"#).unwrap_err();

        match err {
            DiscoveryError::Decode { path, .. } => assert_eq!(path, JWKS_PATH),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
