use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use cluster_relay::discovery::{DiscoveryChain, DiscoveryConfig, KubeApiClient, Readiness};
use cluster_relay::env::ResourceKind;
use cluster_relay::{
    ClusterEnvironment, CredentialBundle, CredentialPaths, Credentials, DiscoveryResult,
    UnavailableReason,
};

const TOKEN: &str = "s3cr3t-token";
const CA_BUNDLE: &[u8] = include_bytes!("fixtures/ca-bundle.pem");
const ENDPOINTS_PATH: &str = "/api/v1/namespaces/default/endpoints/myapp-7f8c9";

fn bundle() -> CredentialBundle {
    CredentialBundle::from_parts(TOKEN, CA_BUNDLE).unwrap()
}

/// In-cluster environment whose control plane is the mock server.
fn cluster_env(server: &MockServer) -> ClusterEnvironment {
    ClusterEnvironment {
        service_host: Some("10.0.0.1".into()),
        service_port: Some(443),
        pod_name: Some("myapp-7f8c9-abcde".into()),
        api_base_url: Some(server.uri()),
        ..ClusterEnvironment::default()
    }
}

fn endpoints_body() -> serde_json::Value {
    json!({
        "kind": "Endpoints",
        "apiVersion": "v1",
        "metadata": { "name": "myapp-7f8c9", "namespace": "default" },
        "subsets": [{
            "addresses": [{ "ip": "10.1.0.4" }, { "ip": "10.1.0.5" }],
            "notReadyAddresses": [{ "ip": "10.1.0.6" }],
            "ports": [{ "name": "http", "port": 8080, "protocol": "TCP" }]
        }]
    })
}

fn direct_http_chain(env: ClusterEnvironment) -> DiscoveryChain {
    DiscoveryChain::builder(env)
        .credentials(Some(bundle()))
        .without_api_client()
        .build()
}

#[test_log::test(tokio::test)]
async fn outside_cluster_is_unavailable() {
    let chain = DiscoveryChain::with_credentials(
        ClusterEnvironment::default(),
        Ok(Credentials::NotInCluster),
    );
    assert_eq!(
        chain.discover_peers().await,
        DiscoveryResult::Unavailable {
            reason: UnavailableReason::NotInClusterEnvironment
        }
    );
}

#[test_log::test(tokio::test)]
async fn direct_http_reads_endpoints_with_bearer_token() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .and(header("authorization", format!("Bearer {TOKEN}").as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_json(endpoints_body()))
        .expect(1)
        .mount(&server)
        .await;

    let result = direct_http_chain(cluster_env(&server)).discover_peers().await;
    let DiscoveryResult::Found { source, endpoints } = result.clone() else {
        panic!("expected peers, got {result:?}");
    };
    assert_eq!(source, "direct-http");
    assert_eq!(endpoints.len(), 3);
    assert!(endpoints.iter().all(|e| e.port == 8080));
    assert_eq!(endpoints[0].address.to_string(), "10.1.0.4");
    assert_eq!(endpoints[2].readiness, Readiness::NotReady);
}

#[tokio::test]
async fn non_success_status_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .respond_with(ResponseTemplate::new(403).set_body_string("forbidden"))
        .expect(1)
        .mount(&server)
        .await;

    let result = direct_http_chain(cluster_env(&server)).discover_peers().await;
    assert_eq!(result.reason(), Some(&UnavailableReason::HttpStatus(403)));
}

#[tokio::test]
async fn hanging_control_plane_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(endpoints_body())
                .set_delay(Duration::from_secs(10)),
        )
        .mount(&server)
        .await;

    let chain = DiscoveryChain::builder(cluster_env(&server))
        .credentials(Some(bundle()))
        .without_api_client()
        .config(DiscoveryConfig::default().strategy_timeout(Duration::from_millis(200)))
        .build();
    assert_eq!(
        chain.discover_peers().await.reason(),
        Some(&UnavailableReason::Timeout)
    );
}

#[tokio::test]
async fn garbage_body_is_invalid_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy error</html>"))
        .mount(&server)
        .await;

    let result = direct_http_chain(cluster_env(&server)).discover_peers().await;
    assert!(matches!(
        result.reason(),
        Some(UnavailableReason::InvalidResponse(_))
    ));
}

#[test_log::test(tokio::test)]
async fn cluster_api_answers_first_with_ready_addresses() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/default/endpoints/relay-svc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(endpoints_body()))
        .expect(1)
        .mount(&server)
        .await;

    let env = ClusterEnvironment {
        service_name: Some("relay-svc".into()),
        ..cluster_env(&server)
    };
    let client = KubeApiClient::with_base_url(&bundle(), server.uri(), Duration::from_secs(2))
        .unwrap();
    let chain = DiscoveryChain::builder(env)
        .credentials(Some(bundle()))
        .api_client(Arc::new(client))
        .build();

    let result = chain.discover_peers().await;
    let DiscoveryResult::Found { source, endpoints } = result.clone() else {
        panic!("expected peers, got {result:?}");
    };
    assert_eq!(source, "cluster-api");
    assert_eq!(endpoints.len(), 2);
    assert!(endpoints.iter().all(|e| e.readiness == Readiness::Ready));
}

#[tokio::test]
async fn cluster_api_failure_falls_through_to_direct_http() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/broken{ENDPOINTS_PATH}")))
        .respond_with(ResponseTemplate::new(500))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(endpoints_body()))
        .expect(1)
        .mount(&server)
        .await;

    let broken = KubeApiClient::with_base_url(
        &bundle(),
        format!("{}/broken", server.uri()),
        Duration::from_secs(2),
    )
    .unwrap();
    let chain = DiscoveryChain::builder(cluster_env(&server))
        .credentials(Some(bundle()))
        .api_client(Arc::new(broken))
        .build();

    let result = chain.discover_peers().await;
    assert!(result.is_found());
    assert_eq!(result.endpoints().len(), 3);
    assert!(matches!(result, DiscoveryResult::Found { source: "direct-http", .. }));
}

#[tokio::test]
async fn pods_resource_in_mounted_namespace() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/v1/namespaces/relay/pods/myapp-7f8c9-abcde"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "kind": "Pod",
            "status": {
                "phase": "Running",
                "podIP": "10.1.0.9",
                "conditions": [{ "type": "Ready", "status": "True" }]
            }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("token"), format!("{TOKEN}\n")).unwrap();
    std::fs::write(dir.path().join("ca.crt"), CA_BUNDLE).unwrap();
    std::fs::write(dir.path().join("namespace"), "relay").unwrap();

    let env = ClusterEnvironment {
        resource: ResourceKind::Pods,
        peer_port: 7000,
        ..cluster_env(&server)
    };
    let chain = DiscoveryChain::builder(env)
        .credentials(
            CredentialBundle::load(&CredentialPaths::in_dir(dir.path()))
                .unwrap()
                .into_bundle(),
        )
        .without_api_client()
        .build();
    assert_eq!(chain.environment().namespace(), "relay");

    let result = chain.discover_peers().await;
    assert_eq!(result.endpoints().len(), 1);
    assert_eq!(result.endpoints()[0].address.to_string(), "10.1.0.9");
    assert_eq!(result.endpoints()[0].port, 7000);
    assert_eq!(result.endpoints()[0].readiness, Readiness::Ready);
}

#[test_log::test(tokio::test)]
async fn http_failure_falls_back_to_dns() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(ENDPOINTS_PATH))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let env = ClusterEnvironment {
        headless_service: Some("localhost".into()),
        ..cluster_env(&server)
    };
    let result = direct_http_chain(env).discover_peers().await;
    let DiscoveryResult::Found { source, endpoints } = result.clone() else {
        panic!("expected DNS peers, got {result:?}");
    };
    assert_eq!(source, "dns");
    assert!(endpoints.iter().all(|e| e.address.is_loopback() && e.port == 80));
}

#[tokio::test]
async fn dns_works_without_credentials() {
    let env = ClusterEnvironment {
        headless_service: Some("localhost".into()),
        ..ClusterEnvironment::default()
    };
    let chain = DiscoveryChain::with_credentials(env, Ok(Credentials::NotInCluster));
    let result = chain.discover_peers().await;
    assert!(result.is_found());
    assert!(!result.endpoints().is_empty());
}
