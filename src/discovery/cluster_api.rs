//! Typed cluster API client and the strategy built on it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tracing::debug;

use super::resources::{resource_path, Endpoints};
use super::strategy::{Strategy, StrategyResult};
use super::UnavailableReason;
use crate::credentials::CredentialBundle;
use crate::env::{ClusterEnvironment, ResourceKind};
use crate::Result;

/// In-cluster DNS name of the control plane.
pub const IN_CLUSTER_API: &str = "https://kubernetes.default.svc";

/// Error type for cluster API calls.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApiError {
    /// Non-success HTTP status.
    #[error("API returned status {0}")]
    Status(u16),
    /// The request timed out.
    #[error("API request timed out")]
    Timeout,
    /// Connection-level failure.
    #[error("API transport error: {0}")]
    Transport(String),
    /// Body was not the expected resource.
    #[error("failed to decode API response: {0}")]
    Decode(String),
}

impl ApiError {
    pub(crate) fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Transport(err.to_string())
        }
    }
}

impl From<ApiError> for UnavailableReason {
    fn from(err: ApiError) -> Self {
        match err {
            ApiError::Status(code) => UnavailableReason::HttpStatus(code),
            ApiError::Timeout => UnavailableReason::Timeout,
            ApiError::Transport(e) => UnavailableReason::Transport(e),
            ApiError::Decode(e) => UnavailableReason::InvalidResponse(e),
        }
    }
}

/// Read access to the cluster API.
#[async_trait]
pub trait ClusterApi: Send + Sync + 'static {
    /// Fetch the Endpoints object `name` in `namespace`.
    async fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Endpoints, ApiError>;
}

/// [`ClusterApi`] over HTTPS with service-account credentials.
#[derive(Debug, Clone)]
pub struct KubeApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl KubeApiClient {
    /// Client for [`IN_CLUSTER_API`].
    pub fn in_cluster(credentials: &CredentialBundle, timeout: Duration) -> Result<Self> {
        Self::with_base_url(credentials, IN_CLUSTER_API, timeout)
    }

    /// Client for an explicit base URL.
    pub fn with_base_url(
        credentials: &CredentialBundle,
        base_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self> {
        Ok(Self {
            http: credentials.http_client(timeout)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
    ) -> std::result::Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(%url, "cluster API request");
        let response = self.http.get(&url).send().await.map_err(ApiError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }
        response.json::<T>().await.map_err(ApiError::from_reqwest)
    }
}

#[async_trait]
impl ClusterApi for KubeApiClient {
    async fn endpoints(
        &self,
        namespace: &str,
        name: &str,
    ) -> std::result::Result<Endpoints, ApiError> {
        self.get_json(&resource_path(namespace, ResourceKind::Endpoints, name))
            .await
    }
}

/// Strategy 1: ask the cluster API for the service's ready endpoints.
///
/// Targets the fixed service name when configured, otherwise the workload
/// name derived from the pod name. [`DirectHttpStrategy`](super::DirectHttpStrategy)
/// prefers the workload name instead.
#[derive(Clone, Default)]
pub struct ApiClientStrategy {
    client: Option<Arc<dyn ClusterApi>>,
}

impl ApiClientStrategy {
    /// Strategy using `client`.
    pub fn new(client: Arc<dyn ClusterApi>) -> Self {
        Self {
            client: Some(client),
        }
    }

    /// Strategy without a client; never applicable.
    pub fn unavailable() -> Self {
        Self { client: None }
    }
}

#[async_trait]
impl Strategy for ApiClientStrategy {
    fn name(&self) -> &'static str {
        "cluster-api"
    }

    fn is_applicable(&self, env: &ClusterEnvironment) -> bool {
        self.client.is_some() && env.in_cluster() && env.target_name().is_some()
    }

    async fn discover(&self, env: &ClusterEnvironment) -> StrategyResult {
        let (Some(client), Some(name)) = (&self.client, env.target_name()) else {
            return Err(UnavailableReason::NotInClusterEnvironment);
        };
        let endpoints = client.endpoints(env.namespace(), &name).await?;
        Ok(endpoints.descriptors(env.peer_port, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(std::result::Result<Endpoints, ApiError>);

    #[async_trait]
    impl ClusterApi for Fixed {
        async fn endpoints(&self, _: &str, _: &str) -> std::result::Result<Endpoints, ApiError> {
            self.0.clone()
        }
    }

    fn in_cluster() -> ClusterEnvironment {
        ClusterEnvironment {
            service_host: Some("10.0.0.1".into()),
            service_port: Some(443),
            pod_name: Some("myapp-7f8c9-abcde".into()),
            ..ClusterEnvironment::default()
        }
    }

    #[test]
    fn needs_client_and_marker() {
        assert!(!ApiClientStrategy::unavailable().is_applicable(&in_cluster()));

        let strategy = ApiClientStrategy::new(Arc::new(Fixed(Ok(Endpoints::default()))));
        assert!(strategy.is_applicable(&in_cluster()));
        assert!(!strategy.is_applicable(&ClusterEnvironment::default()));
    }

    #[tokio::test]
    async fn api_error_becomes_reason() {
        let strategy = ApiClientStrategy::new(Arc::new(Fixed(Err(ApiError::Status(403)))));
        assert_eq!(
            strategy.discover(&in_cluster()).await,
            Err(UnavailableReason::HttpStatus(403))
        );
    }

    #[tokio::test]
    async fn reports_ready_addresses_only() {
        let endpoints: Endpoints = serde_json::from_str(
            r#"{"subsets":[{"addresses":[{"ip":"10.1.0.4"}],"notReadyAddresses":[{"ip":"10.1.0.5"}]}]}"#,
        )
        .unwrap();
        let strategy = ApiClientStrategy::new(Arc::new(Fixed(Ok(endpoints))));
        let peers = strategy.discover(&in_cluster()).await.unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].address.to_string(), "10.1.0.4");
        assert_eq!(peers[0].port, 80);
    }
}
