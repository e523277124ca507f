//! Peer discovery: locate sibling instances of this service.
//!
//! - Pluggable strategies via the [`Strategy`] trait
//! - Tried in order by [`DiscoveryChain`]; first [`DiscoveryResult::Found`] wins
//! - Built-ins: [`ApiClientStrategy`], [`DirectHttpStrategy`], [`DnsStrategy`]
//!
//! Not finding peers is an expected outcome (for example when running on a
//! laptop), so it is reported as [`DiscoveryResult::Unavailable`], never as an
//! error.

use std::fmt;
use std::net::IpAddr;

use serde::Serialize;

pub mod chain;
pub mod cluster_api;
pub mod direct_http;
pub mod dns;
pub mod resources;
pub mod strategy;

pub use chain::{DiscoveryChain, DiscoveryChainBuilder, DiscoveryConfig};
pub use cluster_api::{ApiClientStrategy, ApiError, ClusterApi, KubeApiClient};
pub use direct_http::DirectHttpStrategy;
pub use dns::DnsStrategy;
pub use strategy::{Strategy, StrategyResult};

/// Whether a peer is accepting traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Readiness {
    /// Ready to serve.
    Ready,
    /// Known but not ready.
    NotReady,
}

/// One discovered peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EndpointDescriptor {
    /// Peer address.
    pub address: IpAddr,
    /// Peer port.
    pub port: u16,
    /// Readiness as reported by the source.
    pub readiness: Readiness,
}

impl EndpointDescriptor {
    /// A ready endpoint.
    pub fn ready(address: IpAddr, port: u16) -> Self {
        Self {
            address,
            port,
            readiness: Readiness::Ready,
        }
    }
}

/// Why discovery could not produce peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum UnavailableReason {
    /// No strategy's preconditions hold: not running in a cluster.
    NotInClusterEnvironment,
    /// The control plane answered with a non-success status.
    HttpStatus(u16),
    /// The attempt did not finish in time.
    Timeout,
    /// Connection-level failure.
    Transport(String),
    /// The response body was not the expected resource.
    InvalidResponse(String),
    /// Name resolution failed.
    Dns(String),
    /// Name resolution succeeded with no addresses.
    NoAddresses,
}

impl fmt::Display for UnavailableReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnavailableReason::NotInClusterEnvironment => {
                f.write_str("not running in a cluster environment")
            }
            UnavailableReason::HttpStatus(code) => write!(f, "control plane returned HTTP {code}"),
            UnavailableReason::Timeout => f.write_str("timed out"),
            UnavailableReason::Transport(e) => write!(f, "transport error: {e}"),
            UnavailableReason::InvalidResponse(e) => write!(f, "invalid response: {e}"),
            UnavailableReason::Dns(e) => write!(f, "DNS lookup failed: {e}"),
            UnavailableReason::NoAddresses => f.write_str("DNS returned no addresses"),
        }
    }
}

/// Outcome of one discovery request. Never cached.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DiscoveryResult {
    /// A strategy produced a peer list (possibly empty).
    Found {
        /// Strategy that answered.
        source: &'static str,
        /// Peers it reported.
        endpoints: Vec<EndpointDescriptor>,
    },
    /// No strategy produced a peer list.
    Unavailable {
        /// Failure of the last strategy attempted, or
        /// [`UnavailableReason::NotInClusterEnvironment`] if none applied.
        reason: UnavailableReason,
    },
}

impl DiscoveryResult {
    /// Whether peers were found.
    pub fn is_found(&self) -> bool {
        matches!(self, DiscoveryResult::Found { .. })
    }

    /// Discovered endpoints; empty when unavailable.
    pub fn endpoints(&self) -> &[EndpointDescriptor] {
        match self {
            DiscoveryResult::Found { endpoints, .. } => endpoints,
            DiscoveryResult::Unavailable { .. } => &[],
        }
    }

    /// The reason, when unavailable.
    pub fn reason(&self) -> Option<&UnavailableReason> {
        match self {
            DiscoveryResult::Found { .. } => None,
            DiscoveryResult::Unavailable { reason } => Some(reason),
        }
    }
}
