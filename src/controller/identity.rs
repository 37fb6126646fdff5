//! Cluster Identity Store
//!
//! The registry-issued identity (cluster id, shared secret, display name)
//! lives in a Secret so it survives restarts. A missing Secret, an empty
//! key, or the `quickstart` placeholder key all mean "not registered yet".

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, PostParams};
use kube::Client;
use tracing::debug;

use super::error::StoreError;

/// Placeholder key written by the install manifests before registration
pub const QUICKSTART_KEY: &str = "quickstart";

pub const CLUSTER_ID_FIELD: &str = "cluster-uid";
pub const CLUSTER_KEY_FIELD: &str = "cluster-key";
pub const CLUSTER_NAME_FIELD: &str = "cluster-name";

/// Registry-issued identity of this cluster
#[derive(Clone, Default, PartialEq, Eq)]
pub struct ClusterIdentity {
    pub cluster_id: String,
    pub cluster_key: String,
    pub cluster_name: String,
}

impl ClusterIdentity {
    /// True once a registration response has been stored: both the id and a
    /// real key are present
    pub fn is_registered(&self) -> bool {
        !self.cluster_id.is_empty()
            && !self.cluster_key.is_empty()
            && self.cluster_key != QUICKSTART_KEY
    }
}

impl fmt::Debug for ClusterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClusterIdentity")
            .field("cluster_id", &self.cluster_id)
            .field("cluster_key", &"<redacted>")
            .field("cluster_name", &self.cluster_name)
            .finish()
    }
}

/// Identity as read from the store, with the revision it was read at
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoredIdentity {
    pub identity: ClusterIdentity,
    /// Backend revision; `None` when no record exists
    pub revision: Option<String>,
}

/// Persistence for the cluster identity
#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Read the current identity. A missing record is an empty identity.
    async fn get(&self) -> Result<StoredIdentity, StoreError>;

    /// Write the identity, conditioned on the record still being at `revision`
    async fn set(
        &self,
        identity: &ClusterIdentity,
        revision: Option<&str>,
    ) -> Result<(), StoreError>;
}

/// Identity store backed by a namespaced Secret
pub struct SecretIdentityStore {
    api: Api<Secret>,
    namespace: String,
    name: String,
}

impl SecretIdentityStore {
    pub fn new(client: Client, namespace: &str, name: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    fn conflict(&self) -> StoreError {
        StoreError::Conflict {
            name: format!("{}/{}", self.namespace, self.name),
        }
    }
}

#[async_trait]
impl IdentityStore for SecretIdentityStore {
    async fn get(&self) -> Result<StoredIdentity, StoreError> {
        let secret = match self.api.get_opt(&self.name).await? {
            Some(secret) => secret,
            None => {
                debug!(namespace = %self.namespace, name = %self.name, "Identity secret not found");
                return Ok(StoredIdentity::default());
            }
        };

        let identity = match secret.data.as_ref() {
            Some(data) => identity_from_data(data)?,
            None => ClusterIdentity::default(),
        };

        Ok(StoredIdentity {
            identity,
            revision: secret.metadata.resource_version,
        })
    }

    async fn set(
        &self,
        identity: &ClusterIdentity,
        revision: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut secret = identity_secret(&self.namespace, &self.name, identity, revision);

        let result = match revision {
            None => self.api.create(&PostParams::default(), &secret).await,
            Some(_) => {
                // The installer may own the record; keep its labels and annotations
                if let Some(existing) = self.api.get_opt(&self.name).await? {
                    carry_metadata(&existing.metadata, &mut secret.metadata);
                }
                self.api
                    .replace(&self.name, &PostParams::default(), &secret)
                    .await
            }
        };

        match result {
            Ok(_) => {
                debug!(namespace = %self.namespace, name = %self.name, "Identity secret written");
                Ok(())
            }
            Err(kube::Error::Api(e)) if e.code == 409 => Err(self.conflict()),
            // Conditioned replace of a record that was deleted underneath us
            Err(kube::Error::Api(e)) if e.code == 404 && revision.is_some() => {
                Err(self.conflict())
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Decode the identity fields of a Secret's data. Absent fields are empty.
pub fn identity_from_data(
    data: &BTreeMap<String, ByteString>,
) -> Result<ClusterIdentity, StoreError> {
    let field = |key: &'static str| -> Result<String, StoreError> {
        match data.get(key) {
            Some(value) => String::from_utf8(value.0.clone())
                .map_err(|_| StoreError::Decode { field: key }),
            None => Ok(String::new()),
        }
    };

    Ok(ClusterIdentity {
        cluster_id: field(CLUSTER_ID_FIELD)?,
        cluster_key: field(CLUSTER_KEY_FIELD)?,
        cluster_name: field(CLUSTER_NAME_FIELD)?,
    })
}

/// Build the Secret holding `identity`
pub fn identity_secret(
    namespace: &str,
    name: &str,
    identity: &ClusterIdentity,
    revision: Option<&str>,
) -> Secret {
    let data: BTreeMap<String, ByteString> = [
        (CLUSTER_ID_FIELD, &identity.cluster_id),
        (CLUSTER_KEY_FIELD, &identity.cluster_key),
        (CLUSTER_NAME_FIELD, &identity.cluster_name),
    ]
    .into_iter()
    .map(|(key, value)| (key.to_string(), ByteString(value.as_bytes().to_vec())))
    .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            resource_version: revision.map(str::to_string),
            labels: Some(
                [(
                    "app.kubernetes.io/managed-by".to_string(),
                    "fides".to_string(),
                )]
                .into(),
            ),
            ..Default::default()
        },
        data: Some(data),
        type_: Some("Opaque".to_string()),
        ..Default::default()
    }
}

/// Merge labels, annotations and owners of `existing` into `replacement`.
/// Existing values win, so an installer's ownership markers survive.
pub fn carry_metadata(existing: &ObjectMeta, replacement: &mut ObjectMeta) {
    if let Some(labels) = &existing.labels {
        let merged = replacement.labels.get_or_insert_with(BTreeMap::new);
        for (key, value) in labels {
            merged.insert(key.clone(), value.clone());
        }
    }

    if let Some(annotations) = &existing.annotations {
        let merged = replacement.annotations.get_or_insert_with(BTreeMap::new);
        for (key, value) in annotations {
            merged.insert(key.clone(), value.clone());
        }
    }

    if replacement.owner_references.is_none() {
        replacement.owner_references = existing.owner_references.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(pairs: &[(&str, &[u8])]) -> BTreeMap<String, ByteString> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
            .collect()
    }

    #[test]
    fn test_registration_state_from_key() {
        let mut identity = ClusterIdentity::default();
        assert!(!identity.is_registered());

        identity.cluster_key = QUICKSTART_KEY.to_string();
        assert!(!identity.is_registered());

        // A key without an id cannot be updated
        identity.cluster_key = "abc".to_string();
        assert!(!identity.is_registered());

        identity.cluster_id = "cl-1".to_string();
        assert!(identity.is_registered());

        identity.cluster_key = String::new();
        assert!(!identity.is_registered());
    }

    #[test]
    fn test_identity_from_secret_data() {
        let identity = identity_from_data(&data(&[
            ("cluster-uid", b"cl-1"),
            ("cluster-key", b"abc"),
            ("cluster-name", b"c1"),
        ]))
        .unwrap();

        assert_eq!(identity.cluster_id, "cl-1");
        assert_eq!(identity.cluster_key, "abc");
        assert_eq!(identity.cluster_name, "c1");
        assert!(identity.is_registered());
    }

    #[test]
    fn test_missing_fields_are_empty() {
        let identity = identity_from_data(&data(&[("cluster-key", b"quickstart")])).unwrap();

        assert!(identity.cluster_id.is_empty());
        assert!(identity.cluster_name.is_empty());
        assert!(!identity.is_registered());
    }

    #[test]
    fn test_invalid_utf8_is_rejected() {
        let err = identity_from_data(&data(&[("cluster-key", &[0xff, 0xfe])])).unwrap_err();
        assert!(matches!(err, StoreError::Decode { field: "cluster-key" }));
    }

    #[test]
    fn test_identity_secret_round_trips_fields() {
        let identity = ClusterIdentity {
            cluster_id: "cl-1".to_string(),
            cluster_key: "abc".to_string(),
            cluster_name: "c1".to_string(),
        };

        let secret = identity_secret("fides-system", "fides", &identity, Some("42"));

        assert_eq!(secret.metadata.name.as_deref(), Some("fides"));
        assert_eq!(secret.metadata.namespace.as_deref(), Some("fides-system"));
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("42"));
        assert_eq!(
            identity_from_data(secret.data.as_ref().unwrap()).unwrap(),
            identity
        );
    }

    #[test]
    fn test_replacement_keeps_installer_metadata() {
        let existing = ObjectMeta {
            labels: Some(
                [
                    ("app.kubernetes.io/managed-by".to_string(), "Helm".to_string()),
                    ("app.kubernetes.io/instance".to_string(), "fides".to_string()),
                ]
                .into(),
            ),
            annotations: Some(
                [(
                    "meta.helm.sh/release-name".to_string(),
                    "fides".to_string(),
                )]
                .into(),
            ),
            resource_version: Some("41".to_string()),
            ..Default::default()
        };

        let identity = ClusterIdentity {
            cluster_id: "cl-1".to_string(),
            cluster_key: "abc".to_string(),
            cluster_name: "c1".to_string(),
        };
        let mut secret = identity_secret("fides-system", "fides", &identity, Some("42"));
        carry_metadata(&existing, &mut secret.metadata);

        let labels = secret.metadata.labels.as_ref().unwrap();
        assert_eq!(labels["app.kubernetes.io/instance"], "fides");
        assert_eq!(labels["app.kubernetes.io/managed-by"], "Helm");

        let annotations = secret.metadata.annotations.as_ref().unwrap();
        assert_eq!(annotations["meta.helm.sh/release-name"], "fides");

        // The write stays conditioned on the revision that was read
        assert_eq!(secret.metadata.resource_version.as_deref(), Some("42"));
    }

    #[test]
    fn test_debug_redacts_key() {
        let identity = ClusterIdentity {
            cluster_id: "cl-1".to_string(),
            cluster_key: "super-secret".to_string(),
            cluster_name: "c1".to_string(),
        };

        let rendered = format!("{:?}", identity);
        assert!(rendered.contains("cl-1"));
        assert!(!rendered.contains("super-secret"));
    }
}
