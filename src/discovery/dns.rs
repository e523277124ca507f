//! Strategy 3: resolve a headless service name.

use std::collections::BTreeSet;
use std::net::IpAddr;

use async_trait::async_trait;
use tracing::{debug, trace};

use super::strategy::{Strategy, StrategyResult};
use super::{EndpointDescriptor, UnavailableReason};
use crate::env::ClusterEnvironment;

/// Resolves `PEER_HEADLESS_SERVICE` to the addresses behind it.
///
/// A headless service publishes one record per ready pod, so every address
/// is reported ready on the configured peer port. Needs no credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct DnsStrategy;

impl DnsStrategy {
    /// Create the strategy.
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Strategy for DnsStrategy {
    fn name(&self) -> &'static str {
        "dns"
    }

    fn is_applicable(&self, env: &ClusterEnvironment) -> bool {
        env.headless_service.is_some()
    }

    async fn discover(&self, env: &ClusterEnvironment) -> StrategyResult {
        let Some(host) = env.headless_service.as_deref() else {
            return Err(UnavailableReason::NotInClusterEnvironment);
        };

        trace!(host, "resolving headless service");
        let addrs = tokio::net::lookup_host((host, env.peer_port))
            .await
            .map_err(|e| UnavailableReason::Dns(e.to_string()))?;

        // one descriptor per distinct address, stable order
        let unique: BTreeSet<IpAddr> = addrs.map(|addr| addr.ip()).collect();
        if unique.is_empty() {
            return Err(UnavailableReason::NoAddresses);
        }
        debug!(host, count = unique.len(), "headless service resolved");
        Ok(unique
            .into_iter()
            .map(|ip| EndpointDescriptor::ready(ip, env.peer_port))
            .collect())
    }
}
