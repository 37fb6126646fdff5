//! Fides Registry Client
//!
//! Creates and refreshes this cluster's record in the registry over HTTP.
//! Every call carries the fides `User-Agent` and is bounded by a 30 second
//! timeout of its own, regardless of what the caller is doing.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use super::error::RegistryError;
use crate::types::{ClusterNewRequest, ClusterNewResponse, ClusterPutRequest, ClusterPutResponse};

/// Marks a registration as coming from the self-service controller
pub const QUICKSTART_HEADER: &str = "x-fides-quickstart";

/// Shared secret presented on updates
pub const CLUSTER_KEY_HEADER: &str = "x-cluster-key";

pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote operations against the registry
#[async_trait]
pub trait Registry: Send + Sync {
    /// Create the cluster record. Only `201 Created` with a token and id is
    /// a registration; 409 is reported as `AlreadyRegistered`.
    async fn register(
        &self,
        request: &ClusterNewRequest,
    ) -> Result<ClusterNewResponse, RegistryError>;

    /// Refresh the discovery metadata of an existing record
    async fn update(
        &self,
        cluster_id: &str,
        cluster_key: &str,
        request: &ClusterPutRequest,
    ) -> Result<ClusterPutResponse, RegistryError>;
}

/// HTTP client for the fides registry API
pub struct RegistryClient {
    http_client: Client,
    base_url: String,
}

impl RegistryClient {
    /// Create a client for the registry at `base_url`
    pub fn new(base_url: &str, user_agent: &str) -> Result<Self, RegistryError> {
        let http_client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(user_agent)
            .build()?;

        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl Registry for RegistryClient {
    async fn register(
        &self,
        request: &ClusterNewRequest,
    ) -> Result<ClusterNewResponse, RegistryError> {
        let url = format!("{}/api/v1/clusters", self.base_url);
        debug!(url = %url, "Registering cluster");

        let response = self
            .http_client
            .post(&url)
            .header(QUICKSTART_HEADER, "true")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        match status {
            StatusCode::CREATED => {}
            StatusCode::CONFLICT => return Err(RegistryError::AlreadyRegistered),
            _ => {
                return Err(RegistryError::Status {
                    status: status.as_u16(),
                    body,
                })
            }
        }

        let registered: ClusterNewResponse = serde_json::from_str(&body)?;
        if registered.token.is_empty() || registered.uid.is_empty() {
            return Err(RegistryError::IncompleteRegistration);
        }

        info!(cluster_id = %registered.uid, cluster_name = %registered.name, "Cluster registered");

        Ok(registered)
    }

    async fn update(
        &self,
        cluster_id: &str,
        cluster_key: &str,
        request: &ClusterPutRequest,
    ) -> Result<ClusterPutResponse, RegistryError> {
        let url = format!(
            "{}/api/v1/clusters/{}",
            self.base_url,
            urlencoding::encode(cluster_id)
        );
        debug!(url = %url, "Updating cluster");

        let mut builder = self.http_client.put(&url).json(request);
        if !cluster_key.is_empty() {
            builder = builder.header(CLUSTER_KEY_HEADER, cluster_key);
        }

        let response = builder.send().await?;
        let status = response.status();
        let body = response.text().await?;

        if status.is_success() && body.trim().is_empty() {
            return Ok(ClusterPutResponse::default());
        }

        decode_success(status, body)
    }
}

fn decode_success<T: DeserializeOwned>(
    status: StatusCode,
    body: String,
) -> Result<T, RegistryError> {
    if !status.is_success() {
        return Err(RegistryError::Status {
            status: status.as_u16(),
            body,
        });
    }

    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Jwks, OpenIdConfiguration};
    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::routing::{post, put};
    use axum::{Json, Router};
    use serde_json::{json, Value};
    use std::sync::{Arc, Mutex};

    #[derive(Debug, Clone)]
    struct Captured {
        path_id: Option<String>,
        headers: HeaderMap,
        body: Value,
    }

    #[derive(Clone)]
    struct MockRegistry {
        status: AxumStatus,
        reply: Value,
        calls: Arc<Mutex<Vec<Captured>>>,
    }

    async fn create_cluster(
        State(mock): State<MockRegistry>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        mock.calls.lock().unwrap().push(Captured {
            path_id: None,
            headers,
            body,
        });
        (mock.status, Json(mock.reply.clone()))
    }

    async fn update_cluster(
        State(mock): State<MockRegistry>,
        Path(id): Path<String>,
        headers: HeaderMap,
        Json(body): Json<Value>,
    ) -> (AxumStatus, Json<Value>) {
        mock.calls.lock().unwrap().push(Captured {
            path_id: Some(id),
            headers,
            body,
        });
        (mock.status, Json(mock.reply.clone()))
    }

    async fn spawn_registry(
        status: AxumStatus,
        reply: Value,
    ) -> (String, Arc<Mutex<Vec<Captured>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let mock = MockRegistry {
            status,
            reply,
            calls: calls.clone(),
        };

        let app = Router::new()
            .route("/api/v1/clusters", post(create_cluster))
            .route("/api/v1/clusters/:id", put(update_cluster))
            .with_state(mock);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (format!("http://{}/", addr), calls)
    }

    fn oid_config() -> OpenIdConfiguration {
        OpenIdConfiguration {
            issuer: "https://c.example".to_string(),
            jwks_uri: "https://c.example/jwks".to_string(),
            response_types_supported: vec!["id_token".to_string()],
            subject_types_supported: vec!["public".to_string()],
            id_token_signing_alg_values_supported: vec!["RS256".to_string()],
        }
    }

    fn new_request() -> ClusterNewRequest {
        ClusterNewRequest {
            name: "c1".to_string(),
            uid: "kube-uid".to_string(),
            oid_config: oid_config(),
            jwks: Jwks::default(),
        }
    }

    fn put_request() -> ClusterPutRequest {
        ClusterPutRequest {
            uid: "kube-uid".to_string(),
            oid_config: oid_config(),
            jwks: Jwks::default(),
        }
    }

    #[tokio::test]
    async fn test_register_created() {
        let (url, calls) = spawn_registry(
            AxumStatus::CREATED,
            json!({
                "token": "abc",
                "uid": "cl-1",
                "url": "https://oidc.example/c/cl-1",
                "name": "c1"
            }),
        )
        .await;

        let client = RegistryClient::new(&url, "fides/v0.1.0").unwrap();
        let response = client.register(&new_request()).await.unwrap();

        assert_eq!(response.token, "abc");
        assert_eq!(response.uid, "cl-1");
        assert_eq!(response.name, "c1");

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let call = &calls[0];
        assert_eq!(call.headers.get(QUICKSTART_HEADER).unwrap(), "true");
        assert_eq!(call.headers.get("user-agent").unwrap(), "fides/v0.1.0");
        assert_eq!(call.body["name"], "c1");
        assert_eq!(call.body["uid"], "kube-uid");
        assert_eq!(call.body["oid_config"]["issuer"], "https://c.example");
        assert_eq!(call.body["jwks"]["keys"], json!([]));
    }

    #[tokio::test]
    async fn test_register_conflict_is_already_registered() {
        let (url, calls) = spawn_registry(AxumStatus::CONFLICT, json!({"error": "exists"})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();

        assert!(matches!(err, RegistryError::AlreadyRegistered));
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_server_error_keeps_status_and_body() {
        let (url, _calls) =
            spawn_registry(AxumStatus::INTERNAL_SERVER_ERROR, json!({"error": "boom"})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();

        match err {
            RegistryError::Status { status, body } => {
                assert_eq!(status, 500);
                assert!(body.contains("boom"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_register_requires_created() {
        let (url, _calls) = spawn_registry(
            AxumStatus::OK,
            json!({"token": "abc", "uid": "cl-1", "url": "", "name": "c1"}),
        )
        .await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();

        assert!(matches!(err, RegistryError::Status { status: 200, .. }));
    }

    #[tokio::test]
    async fn test_register_created_without_identity_rejected() {
        let (url, _calls) = spawn_registry(AxumStatus::CREATED, json!({})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();
        assert!(matches!(err, RegistryError::IncompleteRegistration));

        let (url, _calls) =
            spawn_registry(AxumStatus::CREATED, json!({"token": "abc", "uid": ""})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();
        assert!(matches!(err, RegistryError::IncompleteRegistration));
    }

    #[tokio::test]
    async fn test_update_sends_cluster_key() {
        let (url, calls) = spawn_registry(AxumStatus::OK, json!({"verified": false})).await;

        let client = RegistryClient::new(&url, "fides/v0.1.0").unwrap();
        let response = client.update("cl-1", "abc", &put_request()).await.unwrap();

        assert!(!response.verified);

        let calls = calls.lock().unwrap();
        let call = &calls[0];
        assert_eq!(call.path_id.as_deref(), Some("cl-1"));
        assert_eq!(call.headers.get(CLUSTER_KEY_HEADER).unwrap(), "abc");
        assert_eq!(call.headers.get("user-agent").unwrap(), "fides/v0.1.0");
        assert!(call.headers.get(QUICKSTART_HEADER).is_none());
        assert_eq!(call.body["uid"], "kube-uid");
        assert!(call.body.get("name").is_none());
    }

    #[tokio::test]
    async fn test_update_without_key_omits_header() {
        let (url, calls) = spawn_registry(AxumStatus::OK, json!({"verified": true})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let response = client.update("cl-1", "", &put_request()).await.unwrap();

        assert!(response.verified);
        assert!(calls.lock().unwrap()[0]
            .headers
            .get(CLUSTER_KEY_HEADER)
            .is_none());
    }

    #[tokio::test]
    async fn test_update_rejected() {
        let (url, _calls) =
            spawn_registry(AxumStatus::UNAUTHORIZED, json!({"error": "bad key"})).await;

        let client = RegistryClient::new(&url, "fides/test").unwrap();
        let err = client.update("cl-1", "wrong", &put_request()).await.unwrap_err();

        assert!(matches!(err, RegistryError::Status { status: 401, .. }));
    }

    #[tokio::test]
    async fn test_unreachable_registry_is_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = RegistryClient::new(&format!("http://{}", addr), "fides/test").unwrap();
        let err = client.register(&new_request()).await.unwrap_err();

        assert!(matches!(err, RegistryError::Transport(_)));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = RegistryClient::new("https://fides.example/", "fides/test").unwrap();
        assert_eq!(client.base_url(), "https://fides.example");
    }
}
