//! Strategy 2: raw HTTP call to the control plane.

use async_trait::async_trait;
use tracing::debug;

use super::cluster_api::ApiError;
use super::resources::{resource_path, Endpoints, Pod};
use super::strategy::{Strategy, StrategyResult};
use super::UnavailableReason;
use crate::env::{ClusterEnvironment, ResourceKind};

/// GETs the endpoints (or pod) named after this workload from the control
/// plane at `KUBERNETES_SERVICE_HOST:KUBERNETES_SERVICE_PORT`.
///
/// A non-success status is reported as
/// [`UnavailableReason::HttpStatus`] and not retried.
#[derive(Debug, Clone, Default)]
pub struct DirectHttpStrategy {
    http: Option<reqwest::Client>,
}

impl DirectHttpStrategy {
    /// Strategy sending requests through `http`, which carries the
    /// credentials (see [`CredentialBundle::http_client`](crate::credentials::CredentialBundle::http_client)).
    pub fn new(http: reqwest::Client) -> Self {
        Self { http: Some(http) }
    }

    /// Strategy without credentials; never applicable.
    pub fn unavailable() -> Self {
        Self { http: None }
    }

    /// Name of the resource to fetch.
    ///
    /// `endpoints` uses the derived workload name, falling back to the fixed
    /// service name when the pod name is unknown. This is the reverse of
    /// [`ClusterEnvironment::target_name`], which the cluster API strategy
    /// uses. `pods` uses this instance's own pod name.
    pub fn target_name(env: &ClusterEnvironment) -> Option<String> {
        match env.resource {
            ResourceKind::Endpoints => env.workload_name().or_else(|| env.service_name.clone()),
            ResourceKind::Pods => env.pod_name.clone(),
        }
    }

    /// Full URL this strategy requests in `env`.
    pub fn resource_url(env: &ClusterEnvironment) -> Option<String> {
        let base = env.api_base_url()?;
        let name = Self::target_name(env)?;
        Some(format!(
            "{base}{}",
            resource_path(env.namespace(), env.resource, &name)
        ))
    }
}

#[async_trait]
impl Strategy for DirectHttpStrategy {
    fn name(&self) -> &'static str {
        "direct-http"
    }

    fn is_applicable(&self, env: &ClusterEnvironment) -> bool {
        self.http.is_some() && Self::resource_url(env).is_some()
    }

    async fn discover(&self, env: &ClusterEnvironment) -> StrategyResult {
        let (Some(http), Some(url)) = (&self.http, Self::resource_url(env)) else {
            return Err(UnavailableReason::NotInClusterEnvironment);
        };

        debug!(%url, resource = %env.resource, "requesting control plane");
        let response = http.get(&url).send().await.map_err(ApiError::from_reqwest)?;
        let status = response.status();
        if !status.is_success() {
            debug!(%url, status = status.as_u16(), "control plane refused");
            return Err(UnavailableReason::HttpStatus(status.as_u16()));
        }

        match env.resource {
            ResourceKind::Endpoints => {
                let endpoints: Endpoints =
                    response.json().await.map_err(ApiError::from_reqwest)?;
                Ok(endpoints.descriptors(env.peer_port, true))
            }
            ResourceKind::Pods => {
                let pod: Pod = response.json().await.map_err(ApiError::from_reqwest)?;
                Ok(pod.descriptor(env.peer_port).into_iter().collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::{POD_NAME_VAR, SERVICE_HOST_VAR, SERVICE_PORT_VAR};

    #[test]
    fn url_from_service_host_and_pod_name() {
        let env = ClusterEnvironment::from_vars([
            (SERVICE_HOST_VAR, "10.0.0.1"),
            (SERVICE_PORT_VAR, "443"),
            (POD_NAME_VAR, "myapp-7f8c9-abcde"),
        ]);
        assert_eq!(
            DirectHttpStrategy::resource_url(&env).unwrap(),
            "https://10.0.0.1/api/v1/namespaces/default/endpoints/myapp-7f8c9"
        );
    }

    #[test]
    fn explicit_port_and_pods_resource() {
        let env = ClusterEnvironment {
            service_host: Some("10.0.0.1".into()),
            service_port: Some(6443),
            pod_name: Some("relay-0".into()),
            namespace: Some("relay".into()),
            resource: ResourceKind::Pods,
            ..ClusterEnvironment::default()
        };
        assert_eq!(
            DirectHttpStrategy::resource_url(&env).unwrap(),
            "https://10.0.0.1:6443/api/v1/namespaces/relay/pods/relay-0"
        );
    }

    #[test]
    fn not_applicable_without_credentials_or_host() {
        let env = ClusterEnvironment {
            service_host: Some("10.0.0.1".into()),
            service_port: Some(443),
            pod_name: Some("myapp-7f8c9-abcde".into()),
            ..ClusterEnvironment::default()
        };
        assert!(!DirectHttpStrategy::unavailable().is_applicable(&env));

        let strategy = DirectHttpStrategy::new(reqwest::Client::new());
        assert!(strategy.is_applicable(&env));
        assert!(!strategy.is_applicable(&ClusterEnvironment::default()));
    }

    #[test]
    fn pods_resource_needs_the_pod_name() {
        let env = ClusterEnvironment {
            service_host: Some("10.0.0.1".into()),
            service_port: Some(443),
            service_name: Some("relay-svc".into()),
            resource: ResourceKind::Pods,
            ..ClusterEnvironment::default()
        };
        assert_eq!(DirectHttpStrategy::resource_url(&env), None);
        assert_eq!(
            DirectHttpStrategy::target_name(&ClusterEnvironment {
                resource: ResourceKind::Endpoints,
                ..env
            })
            .as_deref(),
            Some("relay-svc")
        );
    }
}
