//! The slice of the cluster API's JSON that discovery reads.

use std::net::IpAddr;

use serde::Deserialize;
use tracing::warn;

use super::{EndpointDescriptor, Readiness};
use crate::env::ResourceKind;

/// `/api/v1/namespaces/{namespace}/{kind}/{name}`
pub fn resource_path(namespace: &str, kind: ResourceKind, name: &str) -> String {
    format!("/api/v1/namespaces/{namespace}/{kind}/{name}")
}

/// `v1.Endpoints`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Endpoints {
    /// Address groups sharing a port set.
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

/// `v1.EndpointSubset`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointSubset {
    /// Ready addresses.
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    /// Addresses failing readiness.
    #[serde(default)]
    pub not_ready_addresses: Vec<EndpointAddress>,
    /// Ports exposed by every address in the subset.
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

/// `v1.EndpointAddress`
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointAddress {
    /// Address as text.
    pub ip: String,
}

/// `v1.EndpointPort`
#[derive(Debug, Clone, Deserialize)]
pub struct EndpointPort {
    /// Port number.
    pub port: u16,
}

impl Endpoints {
    /// One descriptor per address, using the subset's first port or
    /// `default_port`. Not-ready addresses are included only on request.
    pub fn descriptors(
        &self,
        default_port: u16,
        include_not_ready: bool,
    ) -> Vec<EndpointDescriptor> {
        let mut out = Vec::new();
        for subset in &self.subsets {
            let port = subset.ports.first().map(|p| p.port).unwrap_or(default_port);
            let ready = subset.addresses.iter().map(|a| (a, Readiness::Ready));
            let not_ready = subset
                .not_ready_addresses
                .iter()
                .filter(|_| include_not_ready)
                .map(|a| (a, Readiness::NotReady));
            for (addr, readiness) in ready.chain(not_ready) {
                if let Some(address) = parse_ip(&addr.ip) {
                    out.push(EndpointDescriptor {
                        address,
                        port,
                        readiness,
                    });
                }
            }
        }
        out
    }
}

/// `v1.Pod`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    /// Observed state.
    #[serde(default)]
    pub status: PodStatus,
}

/// `v1.PodStatus`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodStatus {
    /// Assigned address; absent until scheduled.
    #[serde(rename = "podIP", default)]
    pub pod_ip: Option<String>,
    /// Condition list, including `Ready`.
    #[serde(default)]
    pub conditions: Vec<PodCondition>,
}

/// `v1.PodCondition`
#[derive(Debug, Clone, Deserialize)]
pub struct PodCondition {
    /// Condition type, e.g. `Ready`.
    #[serde(rename = "type")]
    pub kind: String,
    /// `True`, `False` or `Unknown`.
    pub status: String,
}

impl Pod {
    /// Whether the `Ready` condition is `True`.
    pub fn is_ready(&self) -> bool {
        self.status
            .conditions
            .iter()
            .any(|c| c.kind == "Ready" && c.status == "True")
    }

    /// The pod as a descriptor on `port`, if it has an address.
    pub fn descriptor(&self, port: u16) -> Option<EndpointDescriptor> {
        let address = parse_ip(self.status.pod_ip.as_deref()?)?;
        let readiness = if self.is_ready() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        };
        Some(EndpointDescriptor {
            address,
            port,
            readiness,
        })
    }
}

fn parse_ip(text: &str) -> Option<IpAddr> {
    match text.parse() {
        Ok(ip) => Some(ip),
        Err(_) => {
            warn!(address = text, "skipping unparseable address");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENDPOINTS: &str = r#"{
        "kind": "Endpoints",
        "apiVersion": "v1",
        "metadata": { "name": "myapp", "namespace": "default" },
        "subsets": [{
            "addresses": [
                { "ip": "10.1.0.4", "targetRef": { "kind": "Pod", "name": "myapp-7f8c9-abcde" } },
                { "ip": "10.1.0.5" }
            ],
            "notReadyAddresses": [{ "ip": "10.1.0.6" }],
            "ports": [{ "name": "http", "port": 8080, "protocol": "TCP" }]
        }]
    }"#;

    #[test]
    fn endpoints_ready_only() {
        let endpoints: Endpoints = serde_json::from_str(ENDPOINTS).unwrap();
        let descriptors = endpoints.descriptors(80, false);
        assert_eq!(descriptors.len(), 2);
        assert!(descriptors.iter().all(|d| d.port == 8080 && d.readiness == Readiness::Ready));
    }

    #[test]
    fn endpoints_with_not_ready() {
        let endpoints: Endpoints = serde_json::from_str(ENDPOINTS).unwrap();
        let descriptors = endpoints.descriptors(80, true);
        assert_eq!(descriptors.len(), 3);
        assert_eq!(descriptors[2].address.to_string(), "10.1.0.6");
        assert_eq!(descriptors[2].readiness, Readiness::NotReady);
    }

    #[test]
    fn endpoints_without_subsets_is_empty() {
        let endpoints: Endpoints = serde_json::from_str(r#"{"kind":"Endpoints"}"#).unwrap();
        assert!(endpoints.descriptors(80, true).is_empty());
    }

    #[test]
    fn pod_readiness_from_conditions() {
        let pod: Pod = serde_json::from_str(
            r#"{"status":{"podIP":"10.1.0.9","conditions":[
                {"type":"Initialized","status":"True"},
                {"type":"Ready","status":"False"}]}}"#,
        )
        .unwrap();
        let descriptor = pod.descriptor(9000).unwrap();
        assert_eq!(descriptor.port, 9000);
        assert_eq!(descriptor.readiness, Readiness::NotReady);

        let pending: Pod = serde_json::from_str(r#"{"status":{"phase":"Pending"}}"#).unwrap();
        assert!(pending.descriptor(9000).is_none());
    }

    #[test]
    fn builds_resource_path() {
        assert_eq!(
            resource_path("default", ResourceKind::Endpoints, "myapp-7f8c9"),
            "/api/v1/namespaces/default/endpoints/myapp-7f8c9"
        );
        assert_eq!(
            resource_path("relay", ResourceKind::Pods, "myapp-0"),
            "/api/v1/namespaces/relay/pods/myapp-0"
        );
    }
}
