//! Registry Wire Types
//!
//! Payloads exchanged with the cluster API (discovery document, key set)
//! and with the fides registry (cluster create / update).

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// OIDC discovery document served at `/.well-known/openid-configuration`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    pub issuer: String,
    pub jwks_uri: String,
    #[serde(default)]
    pub response_types_supported: Vec<String>,
    #[serde(default)]
    pub subject_types_supported: Vec<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// Service-account signing key set served at `/openid/v1/jwks`
///
/// Forwarded to the registry as-is. Keys are not validated, and members
/// this crate does not name are carried through unchanged.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwks {
    #[serde(default)]
    pub keys: Vec<Jwk>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A single JSON Web Key
///
/// Only the members common to every key type are named; type-specific ones
/// (`n`/`e` for RSA, `crv`/`x`/`y` for EC, `x5c`, ...) live in `params`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Jwk {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub key_use: Option<String>,
    #[serde(default)]
    pub kty: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

/// Body of `POST /api/v1/clusters`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNewRequest {
    pub name: String,
    pub uid: String,
    pub oid_config: OpenIdConfiguration,
    pub jwks: Jwks,
}

/// `201 Created` response to a cluster registration
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterNewResponse {
    /// Shared secret presented as `x-cluster-key` on later updates
    pub token: String,
    /// Registry-assigned cluster id
    pub uid: String,
    pub url: String,
    pub name: String,
}

/// Body of `PUT /api/v1/clusters/{id}`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterPutRequest {
    pub uid: String,
    pub oid_config: OpenIdConfiguration,
    pub jwks: Jwks,
}

/// `200 OK` response to a cluster update
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterPutResponse {
    /// Whether the registry could reach the cluster's published discovery endpoint
    #[serde(default)]
    pub verified: bool,
}

/// Error body returned by the registry
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorResponse {
    #[serde(default)]
    pub error: String,
}
