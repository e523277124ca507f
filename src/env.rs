//! Cluster environment, read once at startup.
//!
//! Discovery strategies receive a [`ClusterEnvironment`] by reference and
//! never consult process environment variables themselves.

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::str::FromStr;

use tracing::warn;

/// Set inside every pod; its presence marks an in-cluster process.
pub const SERVICE_HOST_VAR: &str = "KUBERNETES_SERVICE_HOST";
/// Control-plane port paired with [`SERVICE_HOST_VAR`].
pub const SERVICE_PORT_VAR: &str = "KUBERNETES_SERVICE_PORT";
/// Pod name (the generated instance identifier).
pub const POD_NAME_VAR: &str = "HOSTNAME";
/// Namespace override.
pub const NAMESPACE_VAR: &str = "POD_NAMESPACE";
/// Fixed service name used instead of the derived workload name.
pub const SERVICE_NAME_VAR: &str = "PEER_SERVICE_NAME";
/// Headless service hostname for DNS discovery.
pub const HEADLESS_SERVICE_VAR: &str = "PEER_HEADLESS_SERVICE";
/// Port peers listen on.
pub const PEER_PORT_VAR: &str = "PEER_PORT";
/// Resource the direct HTTP strategy reads (`endpoints` or `pods`).
pub const PEER_RESOURCE_VAR: &str = "PEER_RESOURCE";
/// Explicit control-plane base URL, e.g. a local API proxy.
pub const API_URL_VAR: &str = "KUBERNETES_API_URL";

const DEFAULT_NAMESPACE: &str = "default";
const DEFAULT_PEER_PORT: u16 = 80;

/// Cluster API resource holding peer addresses.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResourceKind {
    /// `endpoints/{name}`: addresses backing a service.
    #[default]
    Endpoints,
    /// `pods/{name}`: a single pod.
    Pods,
}

impl ResourceKind {
    /// Path segment used in the API URL.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Endpoints => "endpoints",
            ResourceKind::Pods => "pods",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "endpoints" | "endpoint" => Ok(ResourceKind::Endpoints),
            "pods" | "pod" => Ok(ResourceKind::Pods),
            other => Err(format!("unknown resource kind `{other}`")),
        }
    }
}

/// Everything discovery needs to know about where this process runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterEnvironment {
    /// Control-plane host; presence marks an in-cluster process.
    pub service_host: Option<String>,
    /// Control-plane port.
    pub service_port: Option<u16>,
    /// This instance's generated name.
    pub pod_name: Option<String>,
    /// Namespace override. The discovery chain fills it from the credential
    /// mount when unset; `default` otherwise.
    pub namespace: Option<String>,
    /// Fixed service name; otherwise derived from the pod name.
    pub service_name: Option<String>,
    /// Headless service hostname for DNS discovery.
    pub headless_service: Option<String>,
    /// Port reported for peers when the API does not say.
    pub peer_port: u16,
    /// Resource read by the direct HTTP strategy.
    pub resource: ResourceKind,
    /// Replaces the base URL derived from host and port.
    pub api_base_url: Option<String>,
}

impl Default for ClusterEnvironment {
    fn default() -> Self {
        Self {
            service_host: None,
            service_port: None,
            pod_name: None,
            namespace: None,
            service_name: None,
            headless_service: None,
            peer_port: DEFAULT_PEER_PORT,
            resource: ResourceKind::default(),
            api_base_url: None,
        }
    }
}

impl ClusterEnvironment {
    /// Read the process environment.
    ///
    /// Variables whose name or value is not valid UTF-8 are skipped.
    pub fn from_env() -> Self {
        Self::from_vars(utf8_vars(std::env::vars_os()))
    }

    /// Build from explicit `(name, value)` pairs. Empty values count as unset.
    pub fn from_vars<I, K, V>(vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let get = |name: &str| vars.get(name).map(|v| v.trim().to_string());

        let service_port = get(SERVICE_PORT_VAR).and_then(|p| match p.parse::<u16>() {
            Ok(port) => Some(port),
            Err(_) => {
                warn!(var = SERVICE_PORT_VAR, value = %p, "ignoring invalid port");
                None
            }
        });
        let peer_port = get(PEER_PORT_VAR)
            .and_then(|p| match p.parse::<u16>() {
                Ok(port) => Some(port),
                Err(_) => {
                    warn!(var = PEER_PORT_VAR, value = %p, "ignoring invalid port");
                    None
                }
            })
            .unwrap_or(DEFAULT_PEER_PORT);
        let resource = get(PEER_RESOURCE_VAR)
            .and_then(|r| match r.parse::<ResourceKind>() {
                Ok(kind) => Some(kind),
                Err(e) => {
                    warn!(var = PEER_RESOURCE_VAR, "{e}");
                    None
                }
            })
            .unwrap_or_default();

        Self {
            service_host: get(SERVICE_HOST_VAR),
            service_port,
            pod_name: get(POD_NAME_VAR),
            namespace: get(NAMESPACE_VAR),
            service_name: get(SERVICE_NAME_VAR),
            headless_service: get(HEADLESS_SERVICE_VAR),
            peer_port,
            resource,
            api_base_url: get(API_URL_VAR),
        }
    }

    /// Whether the in-cluster marker is present.
    pub fn in_cluster(&self) -> bool {
        self.service_host.is_some()
    }

    /// Stable workload name derived from the pod name.
    pub fn workload_name(&self) -> Option<String> {
        self.pod_name.as_deref().map(|pod| workload_name(pod).to_string())
    }

    /// Fixed service name if configured, else the derived workload name.
    pub fn target_name(&self) -> Option<String> {
        self.service_name.clone().or_else(|| self.workload_name())
    }

    /// Configured namespace, or `default`.
    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Control-plane base URL without a trailing slash.
    ///
    /// Port 443 gives `https://host`, port 80 gives `http://host`, any other
    /// port is kept explicit on https. `api_base_url` wins when set.
    pub fn api_base_url(&self) -> Option<String> {
        if let Some(url) = &self.api_base_url {
            return Some(url.trim_end_matches('/').to_string());
        }
        let host = self.service_host.as_deref()?;
        let port = self.service_port?;
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        Some(match port {
            443 => format!("https://{host}"),
            80 => format!("http://{host}"),
            port => format!("https://{host}:{port}"),
        })
    }
}

fn utf8_vars<I>(vars: I) -> impl Iterator<Item = (String, String)>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    vars.into_iter()
        .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
}

/// Strip the generated suffix (everything from the last `-`) from `pod_name`.
///
/// A name without `-` is returned unchanged.
pub fn workload_name(pod_name: &str) -> &str {
    match pod_name.rfind('-') {
        Some(idx) if idx > 0 => &pod_name[..idx],
        _ => pod_name,
    }
}
